pub mod conformance;
mod error;
mod journal;
pub mod lifecycle;
mod memory;
mod payload;
mod record;
mod traits;

pub use error::StorageError;
pub use journal::read_journal;
pub use memory::{MemoryOperationLog, MemorySubjectStore};
pub use payload::{
    ActorType, BatchRegistration, OperationPayload, ProductRegistration, StepAction, StepRecord,
    TransactionType, TransferRecord, VerificationRequest,
};
pub use record::{
    BlockRef, IdempotencyKey, LedgerOperation, LedgerStatus, OperationKind, OperationState,
    Outcome, SubjectKind, SubjectRecord, SubmissionFailure, SupplyChainStep, Transition,
    WriteBackTarget,
};
pub use traits::{EnqueueOutcome, OperationLog, SubjectStore};
