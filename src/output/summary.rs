use std::fmt::Write;

use comfy_table::{Cell, Color as TableColor};

use crate::triage::{Diagnosis, FailedJob, Outcome, PublishAction, PublishResult};

use super::styling::{bright, bright_green, bright_red, bright_yellow, cyan, dim};
use super::tables::{
    color_coded_category_cell, color_coded_confidence_cell, color_coded_status_cell,
    create_table,
};

/// Prints a human-readable summary of the outcome to stderr.
///
/// Shows the overall status, the diagnosis table when one was produced,
/// where it was published, and the error that stopped the run, if any.
/// The JSON outcome on stdout is unaffected.
pub fn print_summary(outcome: &Outcome) {
    eprintln!("{}", render_summary(outcome));
}

/// Prints the job the locator selected.
pub fn print_located_job(job: &FailedJob) {
    eprintln!(
        "  {} {} {}\n",
        dim("Selected job:"),
        cyan(&job.name),
        dim(format!("(id {}, position {})", job.id, job.ordinal))
    );
}

fn add_section_header(output: &mut String, emoji: &str, title: &str) {
    let _ = writeln!(output, "{} {}", bright(emoji), bright(title).underlined());
}

fn label_cell(label: &str) -> Cell {
    Cell::new(label).fg(TableColor::Cyan)
}

fn render_diagnosis(output: &mut String, diagnosis: &Diagnosis) {
    add_section_header(output, "🩺", "Diagnosis");

    let mut table = create_table();
    table.add_row(vec![label_cell("Job"), Cell::new(&diagnosis.job.name)]);
    table.add_row(vec![
        label_cell("Category"),
        color_coded_category_cell(diagnosis.category),
    ]);
    table.add_row(vec![
        label_cell("Confidence"),
        color_coded_confidence_cell(diagnosis.confidence),
    ]);
    table.add_row(vec![label_cell("Summary"), Cell::new(&diagnosis.summary)]);
    if let Some(remediation) = &diagnosis.remediation {
        table.add_row(vec![label_cell("Suggested fix"), Cell::new(remediation)]);
    }
    let _ = writeln!(output, "{table}");

    if diagnosis.partial {
        let _ = writeln!(
            output,
            "  {}",
            bright_yellow("Log was truncated; the analysis is based on a partial log.")
        );
    }
    output.push('\n');
}

fn publish_line(publish: &PublishResult) -> String {
    let action = match publish.action {
        PublishAction::Created => bright_green("created"),
        PublishAction::Updated => bright_green("updated"),
        PublishAction::Unchanged => dim("unchanged"),
        PublishAction::DryRun => bright_yellow("dry run, not written"),
        PublishAction::Skipped => dim("publishing disabled"),
    };
    let target = publish.url.as_deref().unwrap_or(&publish.destination);
    format!("  {} {action} {}", dim("Comment:"), cyan(target))
}

fn render_summary(outcome: &Outcome) -> String {
    let mut output = String::new();

    add_section_header(&mut output, "📊", "Outcome");
    let mut status = create_table();
    status.add_row(vec![
        label_cell("Status"),
        color_coded_status_cell(outcome.status),
    ]);
    if let Some(run) = outcome
        .diagnosis
        .as_ref()
        .map(|d| &d.run)
        .or_else(|| outcome.error.as_ref().and_then(|e| e.run.as_ref()))
    {
        status.add_row(vec![label_cell("Run"), Cell::new(run)]);
    }
    let _ = writeln!(output, "{status}\n");

    if let Some(diagnosis) = &outcome.diagnosis {
        render_diagnosis(&mut output, diagnosis);
    }

    if let Some(publish) = &outcome.publish {
        let _ = writeln!(output, "{}", publish_line(publish));
    }

    if let Some(error) = &outcome.error {
        let _ = writeln!(
            output,
            "  {} {}",
            bright_red(format!("{:?}:", error.kind)),
            error.message
        );
    }

    output
}
