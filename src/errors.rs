//! Typed error hierarchy for the migration engine.
//!
//! `EngineError` is the single error type crossing module boundaries. Every
//! variant maps to an `ErrorKind`, which is what the retry policy and the
//! hybrid dispatcher branch on:
//! - `Transient` — retried up to the policy limit
//! - `NativeUnavailable` — absorbed by the dispatcher (switch to fallback)
//! - `Fatal` / `PlanValidation` — never retried, escalates to the scheduler
//! - `Rollback` — a compensating action failed; recorded, non-blocking
//! - `Cancelled` — the session cancellation signal fired

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error, used by `RetryPolicy` and surfaced in
/// `OperationResult` / failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Temporary condition (network timeout, resource exhaustion).
    Transient,
    /// The native performance binary is missing or misbehaving.
    NativeUnavailable,
    /// Permanent failure (validation, permission denial).
    Fatal,
    /// A compensating action failed during rollback.
    Rollback,
    /// The operation was cancelled by the session.
    Cancelled,
}

/// Errors from the orchestration and execution subsystems.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("native executor unavailable: {0}")]
    NativeUnavailable(String),

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("plan validation failed: {0}")]
    PlanValidation(String),

    #[error("compensating action for step {step_id} failed: {message}")]
    Rollback { step_id: String, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("step {step_id} timed out after {seconds}s")]
    StepTimeout { step_id: String, seconds: u64 },

    #[error("session {0} not found")]
    SessionNotFound(uuid::Uuid),

    #[error("session is {status}, cannot {action}")]
    InvalidSessionState { status: String, action: String },

    #[error("persistence failure at {path}: {source}")]
    Store {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    /// Classify this error for retry/dispatch decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) | Self::StepTimeout { .. } | Self::Store { .. } => {
                ErrorKind::Transient
            }
            Self::NativeUnavailable(_) => ErrorKind::NativeUnavailable,
            Self::Fatal(_)
            | Self::PlanValidation(_)
            | Self::SessionNotFound(_)
            | Self::InvalidSessionState { .. } => ErrorKind::Fatal,
            Self::Rollback { .. } => ErrorKind::Rollback,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Classify an I/O error from an executor. Missing files and permission
    /// problems are permanent; everything else is worth retrying.
    pub fn from_io(context: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::NotFound => {
                Self::Fatal(format!("{context}: {err}"))
            }
            _ => Self::Transient(format!("{context}: {err}")),
        }
    }
}
