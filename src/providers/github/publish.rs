//! Diagnosis Publisher: upserts one comment per (run, job).
//!
//! The comment goes to the pull request the run belongs to, or to the run's
//! head commit when there is none. A hidden marker carrying the run and job
//! ids identifies our comment, so repeated invocations edit it in place.

use std::fmt::Write;

use log::{debug, info};
use reqwest::Method;

use crate::error::{CallError, Result, TriageError};
use crate::triage::{Diagnosis, PublishAction, PublishResult, RunReference};

use super::client::{GitHubClient, PAGE_SIZE};
use super::links::workflow_run_url;
use super::types::{CommentBody, GitHubComment, GitHubWorkflowRun};

const MAX_COMMENT_PAGES: usize = 30;

/// Hidden idempotency key embedded in the comment body.
pub fn marker(run_id: u64, job_id: u64) -> String {
    format!("<!-- citriage:run={run_id};job={job_id} -->")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    PullRequest(u64),
    Commit(String),
}

impl Destination {
    pub fn label(&self) -> String {
        match self {
            Destination::PullRequest(number) => format!("pull/{number}"),
            Destination::Commit(sha) => format!("commit/{sha}"),
        }
    }
}

/// Markdown body of the diagnosis comment, marker included.
///
/// `web_base` is the web UI origin the run link points at.
pub fn render_comment(diagnosis: &Diagnosis, web_base: &str) -> String {
    let job = &diagnosis.job;
    let mut body = String::new();

    let _ = writeln!(body, "### CI failure diagnosis: `{}`\n", job.name);
    let _ = writeln!(body, "{}\n", diagnosis.summary.trim());

    let run_link = workflow_run_url(web_base, &diagnosis.run.repository, job.run_id);
    let job_link = job.html_url.clone().unwrap_or_else(|| run_link.clone());
    let _ = writeln!(body, "| | |\n|---|---|");
    let _ = writeln!(body, "| **Category** | {} |", diagnosis.category.label());
    let _ = writeln!(body, "| **Confidence** | {} |", diagnosis.confidence.label());
    let _ = writeln!(body, "| **Job** | [{}]({job_link}) |", job.name);
    let _ = writeln!(body, "| **Run** | [#{}]({run_link}) |", job.run_id);
    if !diagnosis.run.branch.is_empty() {
        let _ = writeln!(body, "| **Branch** | `{}` |", diagnosis.run.branch);
    }
    body.push('\n');

    if let Some(remediation) = diagnosis
        .remediation
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
    {
        let _ = writeln!(body, "**Suggested fix**\n\n{remediation}\n");
    }

    if diagnosis.partial {
        let _ = writeln!(
            body,
            "> [!WARNING]\n> The job log exceeded the analysis budget and was truncated. \
             This diagnosis is based on a partial log.\n"
        );
    }

    let _ = writeln!(body, "<sub>Generated by citriage using `{}`</sub>", diagnosis.model);
    body.push_str(&marker(job.run_id, job.id));
    body
}

impl GitHubClient {
    async fn resolve_destination(
        &self,
        run_id: u64,
        head_sha: Option<&str>,
    ) -> std::result::Result<Destination, CallError> {
        let url = self.repo_url(&format!("actions/runs/{run_id}"));
        let run: GitHubWorkflowRun = self
            .json_once(Method::GET, &url, None::<&()>)
            .await?;

        if let Some(pr) = run.pull_requests.first() {
            return Ok(Destination::PullRequest(pr.number));
        }
        let sha = head_sha.map_or(run.head_sha, ToString::to_string);
        Ok(Destination::Commit(sha))
    }

    fn comments_url(&self, destination: &Destination) -> String {
        match destination {
            Destination::PullRequest(number) => self.repo_url(&format!("issues/{number}/comments")),
            Destination::Commit(sha) => self.repo_url(&format!("commits/{sha}/comments")),
        }
    }

    fn comment_url(&self, destination: &Destination, comment_id: u64) -> String {
        match destination {
            Destination::PullRequest(_) => self.repo_url(&format!("issues/comments/{comment_id}")),
            Destination::Commit(_) => self.repo_url(&format!("comments/{comment_id}")),
        }
    }

    async fn find_marked_comment(
        &self,
        destination: &Destination,
        marker: &str,
    ) -> std::result::Result<Option<GitHubComment>, CallError> {
        let base = self.comments_url(destination);
        for page in 1..=MAX_COMMENT_PAGES {
            let url = format!("{base}?per_page={PAGE_SIZE}&page={page}");
            let comments: Vec<GitHubComment> =
                self.json_once(Method::GET, &url, None::<&()>).await?;
            let count = comments.len();

            if let Some(found) = comments
                .into_iter()
                .find(|c| c.body.as_deref().is_some_and(|b| b.contains(marker)))
            {
                return Ok(Some(found));
            }
            if count < PAGE_SIZE {
                break;
            }
        }
        Ok(None)
    }

    /// Looks up the marked comment and creates, edits or keeps it.
    async fn upsert_once(
        &self,
        diagnosis: &Diagnosis,
        body: &str,
        dry_run: bool,
    ) -> std::result::Result<PublishResult, CallError> {
        let job = &diagnosis.job;
        let destination = self
            .resolve_destination(job.run_id, job.head_sha.as_deref())
            .await?;
        let label = destination.label();

        if dry_run {
            info!("Dry run: would publish diagnosis to {label}");
            debug!("Comment body:\n{body}");
            return Ok(PublishResult {
                action: PublishAction::DryRun,
                destination: label,
                comment_id: None,
                url: None,
            });
        }

        let key = marker(job.run_id, job.id);
        let payload = CommentBody { body };

        let (action, comment) = match self.find_marked_comment(&destination, &key).await? {
            Some(existing) if existing.body.as_deref() == Some(body) => {
                (PublishAction::Unchanged, existing)
            }
            Some(existing) => {
                let url = self.comment_url(&destination, existing.id);
                let updated: GitHubComment =
                    self.json_once(Method::PATCH, &url, Some(&payload)).await?;
                (PublishAction::Updated, updated)
            }
            None => {
                let url = self.comments_url(&destination);
                let created: GitHubComment =
                    self.json_once(Method::POST, &url, Some(&payload)).await?;
                (PublishAction::Created, created)
            }
        };

        Ok(PublishResult {
            action,
            destination: label,
            comment_id: Some(comment.id),
            url: comment.html_url,
        })
    }

    /// Publishes the diagnosis idempotently.
    ///
    /// The whole lookup-then-write sequence is retried as a unit, so a write
    /// that succeeded before a dropped response is found on the next attempt
    /// instead of being duplicated.
    ///
    /// # Errors
    ///
    /// Returns `PublishError` when the destination rejects the token, is
    /// unavailable, or answers with an unexpected payload.
    pub async fn publish_diagnosis(
        &self,
        run: &RunReference,
        diagnosis: &Diagnosis,
        dry_run: bool,
    ) -> Result<PublishResult> {
        let body = render_comment(diagnosis, &self.web_base_url());
        let body = body.as_str();

        let result = self
            .retry_policy()
            .run(
                "publish diagnosis",
                move |_| self.upsert_once(diagnosis, body, dry_run),
                CallError::is_transient,
            )
            .await
            .map_err(|failure| TriageError::Publish {
                run: run.clone(),
                source: failure.error,
            })?;

        info!(
            "Diagnosis {:?} on {} for {}",
            result.action, result.destination, run
        );
        Ok(result)
    }
}
