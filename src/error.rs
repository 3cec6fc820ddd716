//! Closed error taxonomy for the snapshot & restore orchestration core.
//!
//! Every caller-facing error maps to exactly one of these variants before it
//! crosses a component boundary: the cloud client classifies every transport
//! outcome into this enum, the job store wraps constraint violations, and the
//! session provider never lets an auth failure escape unclassified.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Credential invalid. Fail fast, no retry.
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// Credential valid but lacks scope for the requested project.
    #[error("forbidden: {0}")]
    ForbiddenError(String),

    /// Remote resource is gone. Idempotent steps treat this as success.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotency conflict (duplicate port, stale IP, duplicate role grant).
    #[error("conflict: {0}")]
    ConflictError(String),

    /// Unique-index violation on `(vm_id, status in {PENDING, RUNNING})`.
    #[error("a restore is already in flight for vm {vm_id}")]
    ConcurrentRestore { vm_id: String },

    /// REPLACE-mode execute without the exact confirmation phrase.
    #[error("confirmation required: expected {expected:?}")]
    ConfirmationRequired { expected: String },

    /// VM is not boot-from-volume; restore is never attempted.
    #[error("vm {vm_id} is not boot-from-volume")]
    UnsupportedBootMode { vm_id: String },

    /// Live quota check failed at execute time. Terminal; triggers rollback.
    #[error("quota insufficient: {0}")]
    QuotaInsufficient(String),

    /// A step or wait exceeded its budget.
    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// HTTP 413 on snapshot creation. Recorded as `skipped`, never `failed`.
    #[error("snapshot rejected as oversized: {0}")]
    SizeRejected(String),

    /// Network error, 5xx, or 429 — retried per the cloud client's policy.
    #[error("transient error: {0}")]
    Transient(String),

    /// Planner boot-mode / lineage checks.
    #[error("snapshot {snapshot_id} not found")]
    SnapshotNotFound { snapshot_id: String },

    #[error("snapshot {snapshot_id} does not belong to a volume ever attached to vm {vm_id}")]
    SnapshotMismatch { snapshot_id: String, vm_id: String },

    #[error("vm {0} not found")]
    VMNotFound(String),

    /// Job store constraint or connection failures not covered above.
    #[error("job store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Malformed configuration, rule file, or startup credential resolution.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error (rule file load, etc).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Raw HTTP transport failure not yet classified by `cloud::retry`.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Anything unexpected. Logged; job transitions to FAILED; rollback runs.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors the cloud client's retry policy should retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Stable machine-readable tag surfaced in a restore job's `result.kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::AuthError(_) => "AuthError",
            Error::ForbiddenError(_) => "ForbiddenError",
            Error::NotFound(_) => "NotFound",
            Error::ConflictError(_) => "ConflictError",
            Error::ConcurrentRestore { .. } => "ConcurrentRestore",
            Error::ConfirmationRequired { .. } => "ConfirmationRequired",
            Error::UnsupportedBootMode { .. } => "UnsupportedBootMode",
            Error::QuotaInsufficient(_) => "QuotaInsufficient",
            Error::Timeout(_) => "Timeout",
            Error::SizeRejected(_) => "SizeRejected",
            Error::Transient(_) => "Transient",
            Error::SnapshotNotFound { .. } => "SnapshotNotFound",
            Error::SnapshotMismatch { .. } => "SnapshotMismatch",
            Error::VMNotFound(_) => "VMNotFound",
            Error::Store(_) => "Internal",
            Error::Config(_) => "Internal",
            Error::Io(_) => "Internal",
            Error::Transport(_) => "Transient",
            Error::Internal(_) => "Internal",
        }
    }

    /// True when the HTTP surface should render this as a 4xx, not a 5xx.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentRestore { .. }
                | Error::ConfirmationRequired { .. }
                | Error::UnsupportedBootMode { .. }
                | Error::SnapshotNotFound { .. }
                | Error::SnapshotMismatch { .. }
                | Error::VMNotFound(_)
                | Error::ForbiddenError(_)
                | Error::AuthError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_is_retriable() {
        assert!(Error::Transient("boom".into()).is_retriable());
        assert!(!Error::NotFound("x".into()).is_retriable());
    }

    #[test]
    fn kind_mapping_is_stable() {
        assert_eq!(Error::ConcurrentRestore { vm_id: "a".into() }.kind(), "ConcurrentRestore");
        assert_eq!(Error::SizeRejected("x".into()).kind(), "SizeRejected");
    }

    #[test]
    fn caller_fault_classification() {
        assert!(Error::ConcurrentRestore { vm_id: "a".into() }.is_caller_fault());
        assert!(!Error::Internal("boom".into()).is_caller_fault());
    }
}
