use crate::record::{IdempotencyKey, OperationState};

/// All errors that can be returned by an `OperationLog` or `SubjectStore`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No operation is recorded under this idempotency key.
    #[error("operation not found: {key}")]
    OperationNotFound { key: IdempotencyKey },

    /// The requested transition is not allowed from the operation's current state.
    /// Another writer moved the operation first, or the caller is out of date.
    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: IdempotencyKey,
        from: OperationState,
        to: OperationState,
    },

    /// No batch or product with this code exists in the relational store.
    #[error("subject not found: {code}")]
    SubjectNotFound { code: String },

    /// A subject with this code is already registered.
    #[error("subject already exists: {code}")]
    SubjectExists { code: String },

    /// A step with this number is already committed for the subject.
    #[error("step {step_number} already committed for {code}")]
    StepExists { code: String, step_number: u32 },

    /// The step number would leave a gap in the subject's sequence.
    #[error("step {step_number} for {code} is not contiguous (expected {expected})")]
    StepGap {
        code: String,
        step_number: u32,
        expected: u32,
    },

    /// A backend-specific storage error (I/O, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}
