use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job within a GitHub Actions workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubJob {
    /// Unique identifier for the job
    pub id: u64,
    /// Workflow run this job belongs to
    pub run_id: u64,
    /// Name of the job
    pub name: String,
    /// Status of the job (queued, in_progress, completed)
    pub status: String,
    /// Conclusion of the job (success, failure, skipped, ...)
    pub conclusion: Option<String>,
    /// When the job started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job completed
    pub completed_at: Option<DateTime<Utc>>,
    /// SHA of the commit the job ran against
    #[serde(default)]
    pub head_sha: Option<String>,
    /// Web UI link to the job
    #[serde(default)]
    pub html_url: Option<String>,
}

impl GitHubJob {
    /// GitHub reports `failure`; other hosts and older payloads say `failed`.
    pub fn is_failed(&self) -> bool {
        self.conclusion
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case("failure") || c.eq_ignore_ascii_case("failed"))
    }
}

/// Response from GitHub API for workflow jobs.
#[derive(Debug, Deserialize)]
pub struct WorkflowJobsResponse {
    #[serde(default)]
    pub total_count: usize,
    pub jobs: Vec<GitHubJob>,
}

/// The subset of a workflow run needed to pick a publish destination.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubWorkflowRun {
    pub head_sha: String,
    #[serde(default)]
    pub pull_requests: Vec<PullRequestRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestRef {
    pub number: u64,
}

/// Entry of a repository directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentEntry {
    pub name: String,
    pub path: String,
    /// `file`, `dir`, `symlink` or `submodule`
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub size: usize,
}

/// Issue comment or commit comment; both share these fields.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubComment {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommentBody<'a> {
    pub body: &'a str,
}
