use std::cell::Cell;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::pipeline::Stage;

use super::styling::{bright, bright_green, bright_red, bright_yellow};

/// Spinner over the five pipeline phases; also remembers which one is
/// running so a deadline can be attributed to it.
pub struct PhaseProgress {
    pb: ProgressBar,
    stage: Cell<Stage>,
}

fn running_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Locate => "Locating failed job",
        Stage::Fetch => "Fetching job log",
        Stage::Build => "Building diagnostic request",
        Stage::Invoke => "Waiting for the model",
        Stage::Publish => "Publishing diagnosis",
    }
}

fn done_label(stage: Stage) -> &'static str {
    match stage {
        Stage::Locate => "Located failed job",
        Stage::Fetch => "Fetched job log",
        Stage::Build => "Built diagnostic request",
        Stage::Invoke => "Received diagnosis",
        Stage::Publish => "Published diagnosis",
    }
}

fn phase(stage: Stage, label: &str) -> String {
    format!("Phase {}/{}: {label}", stage.number(), Stage::COUNT)
}

impl PhaseProgress {
    /// Starts at the first phase. A hidden tracker draws nothing.
    pub fn start(visible: bool) -> Self {
        let pb = ProgressBar::new_spinner();
        if visible {
            eprintln!("{}  {}", bright("⚙️"), bright("Phases").underlined());
            pb.set_draw_target(ProgressDrawTarget::stderr());
            pb.enable_steady_tick(std::time::Duration::from_millis(100));
        } else {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        if let Ok(style) = ProgressStyle::default_spinner().template("  {msg} {spinner}") {
            pb.set_style(style);
        }

        let first = Stage::Locate;
        pb.set_message(bright_yellow(phase(first, running_label(first))).to_string());
        Self {
            pb,
            stage: Cell::new(first),
        }
    }

    pub fn current(&self) -> Stage {
        self.stage.get()
    }

    /// Marks the running phase done and moves on to `stage`.
    pub fn enter(&self, stage: Stage) {
        let previous = self.stage.replace(stage);
        if previous != stage {
            self.pb.println(format!(
                "  {}",
                bright_green(format!("{} ✓", phase(previous, done_label(previous))))
            ));
        }
        self.pb
            .set_message(bright_yellow(phase(stage, running_label(stage))).to_string());
    }

    pub fn finish(&self) {
        let last = self.stage.get();
        self.pb.finish_with_message(
            bright_green(format!("{} ✓", phase(last, done_label(last)))).to_string(),
        );
    }

    pub fn fail(&self, reason: &str) {
        let stage = self.stage.get();
        self.pb.abandon_with_message(
            bright_red(format!("{} ✗ ({reason})", phase(stage, running_label(stage)))).to_string(),
        );
    }
}
