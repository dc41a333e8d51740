use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::Stage;
use crate::triage::RunReference;

/// Failure of a single remote call, before retry policy is applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("unauthorized (HTTP {0})")]
    Unauthorized(u16),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    Decode(String),
}

impl CallError {
    /// Builds the error for a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => CallError::Unauthorized(status),
            404 => CallError::NotFound(truncate_body(body)),
            _ => CallError::Status {
                status,
                body: truncate_body(body),
            },
        }
    }

    /// Timeouts, dropped connections, throttling and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            CallError::Timeout | CallError::Network(_) => true,
            CallError::Status { status, .. } => *status == 429 || *status >= 500,
            CallError::Unauthorized(_) | CallError::NotFound(_) | CallError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return CallError::Timeout;
        }
        if let Some(status) = e.status() {
            return CallError::from_status(status.as_u16(), "");
        }
        if e.is_decode() {
            return CallError::Decode(e.to_string());
        }
        CallError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for CallError {
    fn from(e: serde_json::Error) -> Self {
        CallError::Decode(e.to_string())
    }
}

fn truncate_body(body: &str) -> String {
    const MAX_CHARS: usize = 300;
    let body = body.trim();
    if body.chars().count() <= MAX_CHARS {
        body.to_string()
    } else {
        let mut cut: String = body.chars().take(MAX_CHARS).collect();
        cut.push_str("...");
        cut
    }
}

/// Error taxonomy of a triage invocation.
#[derive(Error, Debug)]
pub enum TriageError {
    #[error("no failed job found for {run}")]
    NotFound { run: RunReference },

    #[error("credential rejected while {stage} for {run}: {source}")]
    Auth {
        run: RunReference,
        stage: Stage,
        source: CallError,
    },

    #[error("log retrieval failed for {run} after {attempts} attempt(s): {source}")]
    Fetch {
        run: RunReference,
        attempts: u32,
        source: CallError,
    },

    #[error("model invocation failed for {run} after {attempts} attempt(s): {source}")]
    Model {
        run: RunReference,
        attempts: u32,
        source: CallError,
    },

    #[error("publishing diagnosis for {run} failed: {source}")]
    Publish {
        run: RunReference,
        source: CallError,
    },

    #[error("triage of {run} exceeded the {}s deadline while {stage}", .limit.as_secs_f64())]
    Timeout {
        run: RunReference,
        stage: Stage,
        limit: Duration,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Stable, serializable name of a [`TriageError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    AuthError,
    FetchError,
    ModelError,
    PublishError,
    TimeoutError,
    ConfigError,
}

impl TriageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TriageError::NotFound { .. } => ErrorKind::NotFound,
            TriageError::Auth { .. } => ErrorKind::AuthError,
            TriageError::Fetch { .. } => ErrorKind::FetchError,
            TriageError::Model { .. } => ErrorKind::ModelError,
            TriageError::Publish { .. } => ErrorKind::PublishError,
            TriageError::Timeout { .. } => ErrorKind::TimeoutError,
            TriageError::Config(_) => ErrorKind::ConfigError,
        }
    }

    pub fn run(&self) -> Option<&RunReference> {
        match self {
            TriageError::NotFound { run }
            | TriageError::Auth { run, .. }
            | TriageError::Fetch { run, .. }
            | TriageError::Model { run, .. }
            | TriageError::Publish { run, .. }
            | TriageError::Timeout { run, .. } => Some(run),
            TriageError::Config(_) => None,
        }
    }
}

/// Error as reported to the caller in the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<RunReference>,
}

impl From<&TriageError> for ErrorReport {
    fn from(error: &TriageError) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            run: error.run().cloned(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;
