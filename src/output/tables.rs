use comfy_table::modifiers::UTF8_ROUND_CORNERS;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, Color as TableColor, ContentArrangement, Table};

use crate::triage::{CauseCategory, Confidence, OutcomeStatus};

/// Table and cell creation helpers
pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

pub fn color_coded_confidence_cell(confidence: Confidence) -> Cell {
    let color = match confidence {
        Confidence::High => TableColor::Green,
        Confidence::Medium => TableColor::Yellow,
        Confidence::Low => TableColor::Red,
    };
    Cell::new(confidence.label()).fg(color)
}

pub fn color_coded_category_cell(category: CauseCategory) -> Cell {
    let color = match category {
        CauseCategory::TransientInfrastructure => TableColor::Yellow,
        CauseCategory::Unknown => TableColor::DarkGrey,
        CauseCategory::Configuration
        | CauseCategory::Permission
        | CauseCategory::CodeDefect
        | CauseCategory::Dependency => TableColor::Magenta,
    };
    Cell::new(category.label()).fg(color)
}

pub fn color_coded_status_cell(status: OutcomeStatus) -> Cell {
    let (text, color) = match status {
        OutcomeStatus::Success => ("SUCCESS", TableColor::Green),
        OutcomeStatus::Partial => ("PARTIAL", TableColor::Yellow),
        OutcomeStatus::Failure => ("FAILURE", TableColor::Red),
    };
    Cell::new(text).fg(color)
}
