use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorReport, Result, TriageError};
use crate::providers::github::links::{parse_logs_url, LogsTarget};

/// Invocation payload sent by the failing pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub repo_name: String,
    pub logs_url: String,
    pub branch_name: String,
}

/// What the caller pointed us at: a whole run or one job inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum RunHandle {
    Run(u64),
    Job(u64),
}

/// Identity of the unit of work under diagnosis. Built once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReference {
    /// Repository in `owner/name` form
    pub repository: String,
    pub branch: String,
    pub handle: RunHandle,
}

impl RunReference {
    /// Builds the reference from the trigger payload, resolving `logs_url`
    /// into a run or job handle.
    pub fn from_event(event: &TriggerEvent) -> Result<Self> {
        let repository = event.repo_name.trim();
        let parts: Vec<&str> = repository.split('/').collect();
        if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
            return Err(TriageError::Config(format!(
                "repo_name must be in format 'owner/repo', got '{repository}'"
            )));
        }

        let handle = match parse_logs_url(&event.logs_url)? {
            LogsTarget {
                job_id: Some(job_id),
                ..
            } => RunHandle::Job(job_id),
            LogsTarget {
                run_id: Some(run_id),
                ..
            } => RunHandle::Run(run_id),
            LogsTarget { .. } => {
                return Err(TriageError::Config(format!(
                    "logs_url names neither a run nor a job: {}",
                    event.logs_url
                )))
            }
        };

        Ok(Self {
            repository: repository.to_string(),
            branch: event.branch_name.trim().to_string(),
            handle,
        })
    }
}

impl fmt::Display for RunReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle {
            RunHandle::Run(id) => write!(f, "{} run {}", self.repository, id)?,
            RunHandle::Job(id) => write!(f, "{} job {}", self.repository, id)?,
        }
        if !self.branch.is_empty() {
            write!(f, " ({})", self.branch)?;
        }
        Ok(())
    }
}

/// The single job selected for diagnosis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedJob {
    pub id: u64,
    pub run_id: u64,
    pub name: String,
    /// Position of the job in the host's job listing for the run
    pub ordinal: usize,
    pub logs_url: String,
    pub head_sha: Option<String>,
    pub html_url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Normalized log text for one job. Lives only for the current invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDocument {
    /// Bytes received from the host before normalization
    pub raw_len: usize,
    pub text: String,
    /// Set when the download was cut at the size cap
    pub truncated: bool,
}

/// Repository file sent to the model next to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextFile {
    pub path: String,
    pub text: String,
}

/// Files read from the repository at the ref the run built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryContext {
    pub git_ref: String,
    pub files: Vec<ContextFile>,
    /// Matching files left out because the character budget ran out
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseCategory {
    Configuration,
    Permission,
    TransientInfrastructure,
    CodeDefect,
    Dependency,
    Unknown,
}

impl CauseCategory {
    /// Lenient mapping from whatever label the model came up with.
    pub fn from_label(label: &str) -> Self {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "configuration" | "configuration_error" | "config" | "misconfiguration" => {
                Self::Configuration
            }
            "permission" | "permission_error" | "permissions" | "authorization"
            | "authentication" => Self::Permission,
            "transient_infrastructure" | "transient" | "infrastructure" | "flaky"
            | "network" => Self::TransientInfrastructure,
            "code_defect" | "code" | "bug" | "test_failure" | "compilation_error" => {
                Self::CodeDefect
            }
            "dependency" | "dependency_error" | "dependencies" => Self::Dependency,
            _ => Self::Unknown,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Configuration => "configuration error",
            Self::Permission => "permission error",
            Self::TransientInfrastructure => "transient infrastructure",
            Self::CodeDefect => "code defect",
            Self::Dependency => "dependency problem",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "high" => Self::High,
            "medium" | "moderate" => Self::Medium,
            _ => Self::Low,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }
}

/// Structured result of one triage run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub summary: String,
    pub category: CauseCategory,
    pub confidence: Confidence,
    pub remediation: Option<String>,
    /// True when the model only saw part of the log
    pub partial: bool,
    pub run: RunReference,
    pub job: FailedJob,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishAction {
    Created,
    Updated,
    Unchanged,
    DryRun,
    /// Publishing is disabled in the configuration
    Skipped,
}

/// Where and how the diagnosis comment ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub action: PublishAction,
    /// `pull/<number>`, `commit/<sha>` or `none`
    pub destination: String,
    pub comment_id: Option<u64>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutcomeStatus {
    Success,
    Partial,
    Failure,
}

impl OutcomeStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::Partial => 2,
        }
    }
}

/// The single value returned to the caller for an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnosis: Option<Diagnosis>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl Outcome {
    pub fn success(diagnosis: Diagnosis, publish: PublishResult) -> Self {
        Self {
            status: OutcomeStatus::Success,
            diagnosis: Some(diagnosis),
            publish: Some(publish),
            error: None,
        }
    }

    pub fn partial(diagnosis: Diagnosis, error: &TriageError) -> Self {
        Self {
            status: OutcomeStatus::Partial,
            diagnosis: Some(diagnosis),
            publish: None,
            error: Some(ErrorReport::from(error)),
        }
    }

    pub fn failure(error: &TriageError) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            diagnosis: None,
            publish: None,
            error: Some(ErrorReport::from(error)),
        }
    }
}
