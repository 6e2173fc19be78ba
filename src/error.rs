use std::fmt;

use crate::adapters::AdapterError;
use crate::model::{Phase, VersionId};

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Which bounded counter ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryScope {
    /// Consecutive failed attempts at producing this phase.
    Phase(Phase),
    /// Human rejections of the chapter as a whole.
    Rejections,
}

impl fmt::Display for RetryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Phase(phase) => write!(f, "phase {phase}"),
            Self::Rejections => f.write_str("human rejections"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("adapter timed out after {timeout_ms}ms while producing {phase}")]
    AdapterTimeout { phase: Phase, timeout_ms: u64 },

    #[error("adapter returned unusable output while producing {phase}: {reason}")]
    AdapterBadOutput { phase: Phase, reason: String },

    #[error("adapter failed while producing {phase}: {message}")]
    AdapterFailed { phase: Phase, message: String },

    #[error("retry limit exceeded for {subject} ({scope}) after {attempts} attempt(s): {last_error}")]
    RetryLimitExceeded {
        subject: String,
        scope: RetryScope,
        attempts: u32,
        last_error: String,
    },

    #[error("cannot {operation} chapter {chapter_id}: {detail}")]
    InvalidState {
        chapter_id: String,
        operation: &'static str,
        detail: String,
    },

    #[error("version {version_id} already has an open review request ({request_id})")]
    DuplicateOpenRequest {
        version_id: VersionId,
        request_id: String,
    },

    #[error("review request {request_id} is already resolved")]
    AlreadyResolved { request_id: String },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("incompatible similarity index: {detail}")]
    IncompatibleIndex { detail: String },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl WorkflowError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn invalid_state(
        chapter_id: impl Into<String>,
        operation: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self::InvalidState {
            chapter_id: chapter_id.into(),
            operation,
            detail: detail.into(),
        }
    }

    /// Maps an adapter failure onto the taxonomy, tagged with the phase the
    /// engine was trying to produce.
    pub fn from_adapter(phase: Phase, err: &AdapterError, timeout_ms: u64) -> Self {
        match err {
            AdapterError::Timeout => Self::AdapterTimeout { phase, timeout_ms },
            AdapterError::BadOutput(reason) => Self::AdapterBadOutput {
                phase,
                reason: reason.clone(),
            },
            AdapterError::Transient(message) | AdapterError::Fatal(message) => {
                Self::AdapterFailed {
                    phase,
                    message: message.clone(),
                }
            }
        }
    }

    /// True when the chapter was moved to `ABANDONED` by this error. Scrape
    /// exhaustion happens before a chapter exists, so it never abandons one.
    pub fn is_abandonment(&self) -> bool {
        match self {
            Self::RetryLimitExceeded { scope, .. } => *scope != RetryScope::Phase(Phase::Raw),
            _ => false,
        }
    }

    /// Caller misuse; never retried.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. } | Self::AlreadyResolved { .. }
        )
    }
}
