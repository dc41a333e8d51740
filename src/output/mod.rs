mod progress;
mod styling;
mod summary;
mod tables;

pub use progress::PhaseProgress;
pub use styling::{dim, magenta_bold};
pub use summary::{print_located_job, print_summary};

/// Prints the citriage banner to stderr.
///
/// Displays the tool name, version, and description at the start of execution.
pub fn print_banner() {
    eprintln!(
        r"
{} {}
  {}
",
        magenta_bold("🔍 citriage"),
        dim(env!("CARGO_PKG_VERSION")),
        dim("CI failure triage")
    );
}
