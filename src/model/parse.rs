use serde::Deserialize;
use serde_json::Value;

use crate::triage::{CauseCategory, Confidence};

/// Diagnosis fields extracted from a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDiagnosis {
    pub summary: String,
    pub category: CauseCategory,
    pub confidence: Confidence,
    pub remediation: Option<String>,
}

#[derive(Deserialize)]
struct DiagnosisJson {
    #[serde(default, alias = "root_cause", alias = "rootCause")]
    summary: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    confidence: String,
    #[serde(default, alias = "remediation_steps", alias = "steps")]
    remediation: Option<Value>,
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Extract a JSON fragment between matching delimiters
fn extract_json_fragment(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (start <= end).then(|| &text[start..=end])
}

/// The model sometimes answers with a list of steps instead of prose.
fn remediation_text(value: Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s,
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .enumerate()
            .map(|(i, step)| format!("{}. {step}", i + 1))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => return None,
        other => other.to_string(),
    };
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn parse_structured(response: &str) -> Option<ParsedDiagnosis> {
    let clean = strip_markdown_fences(response);
    let fragment = extract_json_fragment(clean, '{', '}')?;
    let parsed: DiagnosisJson = serde_json::from_str(fragment).ok()?;

    let summary = parsed.summary.trim();
    if summary.is_empty() {
        return None;
    }

    Some(ParsedDiagnosis {
        summary: summary.to_string(),
        category: CauseCategory::from_label(&parsed.category),
        confidence: Confidence::from_label(&parsed.confidence),
        remediation: parsed.remediation.and_then(remediation_text),
    })
}

/// Parses a non-empty model response.
///
/// Anything that is not the expected JSON object is kept verbatim as the
/// summary with low confidence and an unknown category.
pub fn parse_diagnosis(response: &str) -> ParsedDiagnosis {
    parse_structured(response).unwrap_or_else(|| {
        log::warn!("Model response is not structured, keeping it as free text");
        ParsedDiagnosis {
            summary: response.trim().to_string(),
            category: CauseCategory::Unknown,
            confidence: Confidence::Low,
            remediation: None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let parsed = parse_diagnosis(
            r#"{"summary": "Provider region missing", "category": "configuration",
                "confidence": "high", "remediation": "Set region in provider.tf"}"#,
        );

        assert_eq!(parsed.summary, "Provider region missing");
        assert_eq!(parsed.category, CauseCategory::Configuration);
        assert_eq!(parsed.confidence, Confidence::High);
        assert_eq!(parsed.remediation.as_deref(), Some("Set region in provider.tf"));
    }

    #[test]
    fn parses_fenced_json_with_preamble() {
        let response = "Here is my analysis:\n```json\n{\"summary\": \"Test failed\", \
                        \"category\": \"code_defect\", \"confidence\": \"medium\"}\n```";
        let parsed = parse_diagnosis(response);

        assert_eq!(parsed.summary, "Test failed");
        assert_eq!(parsed.category, CauseCategory::CodeDefect);
        assert_eq!(parsed.confidence, Confidence::Medium);
        assert_eq!(parsed.remediation, None);
    }

    #[test]
    fn remediation_steps_are_numbered() {
        let parsed = parse_diagnosis(
            r#"{"root_cause": "Token expired", "category": "permission",
                "confidence": "high", "remediation": ["Rotate the PAT", "Re-run the job"]}"#,
        );

        assert_eq!(parsed.summary, "Token expired");
        assert_eq!(parsed.category, CauseCategory::Permission);
        assert_eq!(
            parsed.remediation.as_deref(),
            Some("1. Rotate the PAT\n2. Re-run the job")
        );
    }

    #[test]
    fn free_text_falls_back_to_low_confidence() {
        let response = "The job failed because the runner ran out of disk space.";
        let parsed = parse_diagnosis(response);

        assert_eq!(parsed.summary, response);
        assert_eq!(parsed.category, CauseCategory::Unknown);
        assert_eq!(parsed.confidence, Confidence::Low);
    }

    #[test]
    fn json_without_summary_falls_back() {
        let response = r#"{"category": "dependency"}"#;
        let parsed = parse_diagnosis(response);

        assert_eq!(parsed.summary, response);
        assert_eq!(parsed.confidence, Confidence::Low);
    }

    #[test]
    fn broken_json_falls_back() {
        let response = r#"{"summary": "cut off mid"#;
        assert_eq!(parse_diagnosis(response).summary, response);
    }
}
