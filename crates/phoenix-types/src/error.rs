use std::fmt;

use serde::{Deserialize, Serialize};

/// Result alias used across the engine.
pub type VerifyResult<T> = Result<T, VerifyError>;

/// The kind of entity a lookup failed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Emulator,
    Workflow,
    Report,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session => write!(f, "session"),
            Self::Emulator => write!(f, "emulator"),
            Self::Workflow => write!(f, "workflow"),
            Self::Report => write!(f, "report"),
        }
    }
}

/// Errors surfaced by the verification engine.
///
/// `Validation`, `NotFound` and `StateConflict` are returned synchronously and
/// never leave state mutated. `Execution` and `Timeout` describe asynchronous
/// failures; they are recorded into session logs and results rather than
/// thrown back from `run`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Test {test_id} exceeded its {limit_secs}s execution budget")]
    Timeout { test_id: String, limit_secs: u64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl VerifyError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::StateConflict(msg.into())
    }

    /// Stable wire tag for the error class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::NotFound { .. } => "not_found",
            Self::StateConflict(_) => "state_conflict",
            Self::Execution(_) => "execution",
            Self::Timeout { .. } => "timeout",
            Self::Storage(_) => "storage",
        }
    }
}
