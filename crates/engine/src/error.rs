use agritrace_ledger::{KeyError, SubmissionError};
use agritrace_storage::{IdempotencyKey, OperationState, StorageError, SubjectKind};

use crate::config::ConfigError;

/// Errors returned by the engine's entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The request failed preflight and was never enqueued.
    #[error(transparent)]
    Fatal(#[from] SubmissionError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("subject not found: {code}")]
    SubjectNotFound { code: String },

    #[error("subject {code} is not a {expected:?}")]
    WrongSubjectKind { code: String, expected: SubjectKind },

    #[error("step {step_number} is not committed for {code}")]
    StepNotCommitted { code: String, step_number: u32 },

    #[error("operation {key} is {state}, not abandoned")]
    NotAbandoned {
        key: IdempotencyKey,
        state: OperationState,
    },
}

impl EngineError {
    /// Whether the error means the named thing does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::SubjectNotFound { .. }
                | EngineError::StepNotCommitted { .. }
                | EngineError::Storage(StorageError::OperationNotFound { .. })
                | EngineError::Storage(StorageError::SubjectNotFound { .. })
        )
    }
}
