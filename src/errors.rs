use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::backup::artifact::DumpFormat;
use crate::restore::state::RestoreState;

/// One object (or plain-text statement) the engine refused to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedObject {
    pub kind: String,
    pub name: String,
    pub message: String,
}

impl fmt::Display for FailedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.name, self.message)
    }
}

fn object_names(failed: &[FailedObject]) -> String {
    failed
        .iter()
        .map(|obj| obj.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Cannot reach database server: {0}")]
    Connectivity(String),

    #[error("Insufficient privilege: {0}")]
    Authorization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Artifact format mismatch: recorded as {recorded}, but the file on disk is {detected}")]
    FormatMismatch {
        recorded: DumpFormat,
        detected: DumpFormat,
    },

    #[error("Restore partially failed, {} object(s) not restored: {}", .failed.len(), object_names(.failed))]
    PartialFailure { failed: Vec<FailedObject> },

    #[error("{tool} failed ({status}): {stderr}")]
    FatalEngine {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Illegal restore state transition {from:?} -> {to:?}")]
    IllegalTransition { from: RestoreState, to: RestoreState },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),
}

impl OrchestratorError {
    /// Nothing is retried automatically. Connectivity and authorization
    /// problems need an operator, and a failed restore needs a clean slate.
    pub fn is_retryable(&self) -> bool {
        false
    }

    /// Errors caught during validation, before anything destructive ran.
    pub fn is_caller_mistake(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Configuration(_) | OrchestratorError::FormatMismatch { .. }
        )
    }

    pub fn failed_objects(&self) -> &[FailedObject] {
        match self {
            OrchestratorError::PartialFailure { failed } => failed,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
