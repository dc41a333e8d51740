//! Log Fetcher: authenticated download plus normalization.

use std::sync::OnceLock;

use log::{debug, info, warn};
use regex::Regex;
use reqwest::Method;

use crate::error::{CallError, Result, TriageError};
use crate::pipeline::Stage;
use crate::triage::{FailedJob, LogDocument, RunReference};

use super::client::GitHubClient;

/// CSI and OSC escape sequences plus two-byte ESC sequences.
fn ansi_escape() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("ANSI regex compiles")
    })
}

/// Converts raw log text into the canonical form handed to the builder.
///
/// Strips ANSI escapes and other control characters (tabs survive),
/// turns `\r\n` and lone `\r` into `\n`, and keeps line order intact.
pub fn normalize_log(raw: &str) -> String {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let without_ansi = ansi_escape().replace_all(raw, "");
    let unified = without_ansi.replace("\r\n", "\n").replace('\r', "\n");

    unified
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}

/// Keeps at most `max_bytes` from the end of the buffer and returns the
/// last byte it dropped.
fn keep_tail(buffer: &mut Vec<u8>, max_bytes: usize) -> Option<u8> {
    if buffer.len() <= max_bytes {
        return None;
    }
    let excess = buffer.len() - max_bytes;
    let last_dropped = buffer[excess - 1];
    buffer.drain(..excess);
    Some(last_dropped)
}

/// Tail of one download.
struct Download {
    bytes: Vec<u8>,
    total: usize,
    /// The cut fell inside a line, so the first kept line is incomplete
    partial_first_line: bool,
}

/// Removes the incomplete first line left by a byte cut.
fn drop_partial_first_line(text: &mut String) {
    if let Some(newline) = text.find('\n') {
        text.drain(..=newline);
    }
}

impl GitHubClient {
    async fn download_log_once(
        &self,
        url: &str,
        max_bytes: usize,
    ) -> std::result::Result<Download, CallError> {
        let mut response = self.send_once(Method::GET, url, None::<&()>).await?;

        let mut kept = Vec::new();
        let mut total = 0usize;
        let mut last_dropped = None;
        while let Some(chunk) = response.chunk().await? {
            total += chunk.len();
            kept.extend_from_slice(&chunk);
            // Trim lazily so large logs are not shifted on every chunk
            if kept.len() >= max_bytes.saturating_mul(2) {
                last_dropped = keep_tail(&mut kept, max_bytes).or(last_dropped);
            }
        }
        last_dropped = keep_tail(&mut kept, max_bytes).or(last_dropped);

        Ok(Download {
            bytes: kept,
            total,
            partial_first_line: last_dropped.is_some_and(|b| b != b'\n' && b != b'\r'),
        })
    }

    /// Downloads and normalizes the log of `job`.
    ///
    /// Transient failures are retried with backoff; a rejected token fails
    /// immediately with `AuthError`.
    pub async fn fetch_log(
        &self,
        run: &RunReference,
        job: &FailedJob,
        max_bytes: usize,
    ) -> Result<LogDocument> {
        info!("Fetching logs for job '{}' from {}", job.name, job.logs_url);

        let url = job.logs_url.as_str();
        let download = self
            .retry_policy()
            .run(
                "log download",
                move |attempt| {
                    debug!("GET {url} (attempt {attempt})");
                    self.download_log_once(url, max_bytes)
                },
                CallError::is_transient,
            )
            .await
            .map_err(|failure| match failure.error {
                CallError::Unauthorized(_) => TriageError::Auth {
                    run: run.clone(),
                    stage: Stage::Fetch,
                    source: failure.error,
                },
                error => TriageError::Fetch {
                    run: run.clone(),
                    attempts: failure.attempts,
                    source: error,
                },
            })?;

        let raw_len = download.total;
        let capped = raw_len > download.bytes.len();
        let mut text = String::from_utf8_lossy(&download.bytes).into_owned();
        if capped {
            warn!(
                "Log for job {} is {raw_len} bytes, keeping the last {}",
                job.id,
                download.bytes.len()
            );
        }
        if download.partial_first_line {
            drop_partial_first_line(&mut text);
        }

        let text = normalize_log(&text);
        debug!(
            "Normalized log: {raw_len} raw bytes -> {} chars",
            text.chars().count()
        );

        Ok(LogDocument {
            raw_len,
            text,
            truncated: capped,
        })
    }
}
