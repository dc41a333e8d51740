//! Diagnostic Request Builder.
//!
//! Turns a normalized log into a bounded request. Oversized logs keep a
//! short head slice (job header, the command that ran) and the tail, where
//! the failure is usually reported, joined by an omission marker.

use std::fmt::Write;
use std::ops::Range;

use crate::triage::{FailedJob, LogDocument, RepositoryContext, RunReference};

/// Fixed instructions sent with every request.
pub const SYSTEM_INSTRUCTIONS: &str = "\
You are an expert CI/CD engineer troubleshooting a failed pipeline job. \
You receive the log of the first job that failed in a workflow run.

Identify the most probable root cause of the failure and classify it into \
exactly one category:
- configuration: invalid pipeline, tool or infrastructure configuration
- permission: missing credentials, rejected tokens, insufficient access
- transient_infrastructure: network blips, runner crashes, rate limits, outages
- code_defect: compilation errors, failing tests, runtime exceptions in project code
- dependency: unavailable, incompatible or yanked packages and images
- unknown: the log does not support a conclusion

Respond with a single JSON object and nothing else:
{\"summary\": string, \"category\": string, \"confidence\": \"high\" | \"medium\" | \"low\", \"remediation\": string}

When repository files are included, use them to point at the exact file and \
setting at fault.

The summary states the root cause in at most three sentences and quotes the \
decisive log line when there is one. The remediation lists concrete steps a \
developer should take. Use low confidence when the log is truncated around \
the failure or inconclusive.";

/// Stands in for the log when the job produced no output.
pub const EMPTY_LOG_EXCERPT: &str = "no log content available";

/// Bounded request for one invocation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticRequest {
    pub system: &'static str,
    pub run: RunReference,
    pub job: FailedJob,
    pub excerpt: String,
    /// Input budget in characters the excerpt was cut against
    pub budget_chars: usize,
    /// True when anything was dropped, here or during the download
    pub truncated: bool,
    pub omitted_chars: usize,
    /// 1-based line of the first line mentioning "error", counted in the
    /// retrieved log
    pub error_line: Option<usize>,
    /// That line sits entirely in the part cut out of the excerpt
    pub error_line_omitted: bool,
    pub context: Option<RepositoryContext>,
}

/// Result of applying the truncation policy to a text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Excerpt {
    pub text: String,
    pub truncated: bool,
    pub omitted_chars: usize,
    /// Characters of the source text that were cut out
    pub omitted: Range<usize>,
}

pub fn omission_marker(omitted_chars: usize) -> String {
    format!("\n\n[... {omitted_chars} characters omitted ...]\n\n")
}

fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map_or(text.len(), |(offset, _)| offset)
}

/// Cuts `text` down to `budget` characters of log content.
///
/// Texts within budget are returned unchanged. Longer ones keep the first
/// `min(head_chars, budget / 2)` characters and the last `budget - head`
/// characters with an omission marker between them.
pub fn truncate_log(text: &str, budget: usize, head_chars: usize) -> Excerpt {
    let total = text.chars().count();
    if total <= budget {
        return Excerpt {
            text: text.to_string(),
            truncated: false,
            omitted_chars: 0,
            omitted: total..total,
        };
    }

    let head_len = head_chars.min(budget / 2);
    let tail_len = budget - head_len;
    let omitted = total - budget;

    let head_end = byte_offset(text, head_len);
    let tail_start = byte_offset(text, total - tail_len);

    let marker = omission_marker(omitted);
    let mut excerpt = String::with_capacity(head_end + marker.len() + text.len() - tail_start);
    excerpt.push_str(&text[..head_end]);
    excerpt.push_str(&marker);
    excerpt.push_str(&text[tail_start..]);

    Excerpt {
        text: excerpt,
        truncated: true,
        omitted_chars: omitted,
        omitted: head_len..total - tail_len,
    }
}

/// Line number of the first line mentioning "error", case-insensitively.
pub fn first_error_line(text: &str) -> Option<usize> {
    text.lines()
        .position(|line| line.to_lowercase().contains("error"))
        .map(|index| index + 1)
}

/// Character range of the 1-based `line` in `text`, newline excluded.
fn line_span(text: &str, line: usize) -> Option<Range<usize>> {
    let mut start = 0;
    for (index, content) in text.split('\n').enumerate() {
        let len = content.chars().count();
        if index + 1 == line {
            return Some(start..start + len);
        }
        start += len + 1;
    }
    None
}

/// Builds the request for `job`. Never fails.
pub fn build(
    run: &RunReference,
    job: &FailedJob,
    log: &LogDocument,
    budget_chars: usize,
    head_chars: usize,
) -> DiagnosticRequest {
    let (excerpt, error_line) = if log.text.is_empty() {
        (
            Excerpt {
                text: EMPTY_LOG_EXCERPT.to_string(),
                truncated: false,
                omitted_chars: 0,
                omitted: 0..0,
            },
            None,
        )
    } else {
        (
            truncate_log(&log.text, budget_chars, head_chars),
            first_error_line(&log.text),
        )
    };
    let error_line_omitted = error_line
        .and_then(|line| line_span(&log.text, line))
        .is_some_and(|span| {
            excerpt.omitted.start <= span.start && span.end <= excerpt.omitted.end
        });

    DiagnosticRequest {
        system: SYSTEM_INSTRUCTIONS,
        run: run.clone(),
        job: job.clone(),
        excerpt: excerpt.text,
        budget_chars,
        truncated: log.truncated || excerpt.truncated,
        omitted_chars: excerpt.omitted_chars,
        error_line,
        error_line_omitted,
        context: None,
    }
}

impl DiagnosticRequest {
    /// Attaches repository files read for this run.
    #[must_use]
    pub fn with_context(mut self, context: Option<RepositoryContext>) -> Self {
        self.context = context.filter(|c| !c.files.is_empty());
        self
    }

    /// User message carrying the run context and the log excerpt.
    pub fn user_prompt(&self) -> String {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Repository: {}", self.run.repository);
        if !self.run.branch.is_empty() {
            let _ = writeln!(prompt, "Branch: {}", self.run.branch);
        }
        let _ = writeln!(prompt, "Workflow run: {}", self.job.run_id);
        let _ = writeln!(prompt, "Failed job: {} (id {})", self.job.name, self.job.id);

        if let Some(line) = self.error_line {
            let _ = write!(
                prompt,
                "The first line mentioning an error is line {line} of the retrieved log"
            );
            if self.error_line_omitted {
                let _ = writeln!(prompt, "; it falls in the omitted part and is not shown below.");
            } else {
                let _ = writeln!(prompt, ".");
            }
        }
        if self.truncated {
            let _ = writeln!(
                prompt,
                "The log was too large and has been truncated; only the beginning and the end are shown."
            );
        }

        if let Some(context) = &self.context {
            let _ = writeln!(prompt, "\nRepository files at `{}`:", context.git_ref);
            for file in &context.files {
                let _ = writeln!(
                    prompt,
                    "<file path=\"{}\">\n{}\n</file>",
                    file.path,
                    file.text.trim_end()
                );
            }
            if !context.skipped.is_empty() {
                let _ = writeln!(
                    prompt,
                    "Left out for size: {}",
                    context.skipped.join(", ")
                );
            }
        }

        let _ = write!(prompt, "\n<log>\n{}\n</log>", self.excerpt);
        prompt
    }
}
