//! Repository files read at the run's ref and sent with the log.

use log::{debug, info};
use url::form_urlencoded;

use crate::triage::{ContextFile, RepositoryContext};

use super::client::{CallResult, GitHubClient};
use super::types::ContentEntry;

/// Picks the root-level files to read, in listing order.
///
/// Only regular files whose name ends with one of `extensions` qualify.
/// Files are taken while their listed size fits in `max_chars`; the names
/// of qualifying files that do not fit are returned as skipped.
pub fn select_context_files<'a>(
    entries: &'a [ContentEntry],
    extensions: &[String],
    max_chars: usize,
) -> (Vec<&'a ContentEntry>, Vec<String>) {
    let mut selected = Vec::new();
    let mut skipped = Vec::new();
    let mut used = 0usize;

    let matching = entries.iter().filter(|entry| {
        entry.kind == "file"
            && extensions
                .iter()
                .any(|ext| !ext.is_empty() && entry.name.ends_with(ext.as_str()))
    });
    for entry in matching {
        if used + entry.size <= max_chars {
            used += entry.size;
            selected.push(entry);
        } else {
            skipped.push(entry.path.clone());
        }
    }

    (selected, skipped)
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

impl GitHubClient {
    /// Reads the repository files matching `extensions` at `git_ref`.
    ///
    /// At most `max_chars` characters of file content are kept in total.
    pub async fn fetch_repository_context(
        &self,
        git_ref: &str,
        extensions: &[String],
        max_chars: usize,
    ) -> CallResult<RepositoryContext> {
        let git_ref_param = encode(git_ref);
        let url = self.repo_url(&format!("contents?ref={git_ref_param}"));
        let entries: Vec<ContentEntry> = self.get_json("list repository files", &url).await?;

        let (selected, skipped) = select_context_files(&entries, extensions, max_chars);
        debug!(
            "{} of {} entries at {git_ref} selected for context",
            selected.len(),
            entries.len()
        );

        let mut remaining = max_chars;
        let mut files = Vec::with_capacity(selected.len());
        for entry in selected {
            if remaining == 0 {
                break;
            }
            let url = self.repo_url(&format!("contents/{}?ref={git_ref_param}", entry.path));
            let text = self.get_raw("read repository file", &url).await?;
            let text: String = text.chars().take(remaining).collect();
            remaining -= text.chars().count();
            files.push(ContextFile {
                path: entry.path.clone(),
                text,
            });
        }

        info!(
            "Read {} repository file(s) at {git_ref} for context{}",
            files.len(),
            if skipped.is_empty() {
                String::new()
            } else {
                format!(", {} left out", skipped.len())
            }
        );

        Ok(RepositoryContext {
            git_ref: git_ref.to_string(),
            files,
            skipped,
        })
    }
}
