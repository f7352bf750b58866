//! Error taxonomy shared across the orchestration engine.
//!
//! Mirrors the kind/origin/handling table from the design doc: every
//! terminal `failed` execution carries one of these records, and every
//! completed execution carries none.

use serde::{Deserialize, Serialize};

/// Error kinds, mapped to behavior rather than to a specific type name —
/// inner engines translate their own errors into `StepFailed` at the
/// orchestration boundary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConfigInvalid,
    ResourceDenied,
    StepFailed,
    CheckpointCorrupted,
    HumanRejected,
    HumanTimeout,
    OperatorCancelled,
    StoreUnavailable,
    Cancelled,
}

/// A durable, serializable error record attached to a failed `Execution`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl OrchestratorErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: true,
        }
    }
}

impl std::fmt::Display for OrchestratorErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for OrchestratorErrorRecord {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = OrchestratorErrorRecord::new(ErrorKind::ResourceDenied, "cpu exceeded");
        assert_eq!(err.to_string(), "ResourceDenied: cpu exceeded");
    }

    #[test]
    fn retryable_sets_flag() {
        let err = OrchestratorErrorRecord::retryable(ErrorKind::StepFailed, "timeout");
        assert!(err.retryable);
    }
}
