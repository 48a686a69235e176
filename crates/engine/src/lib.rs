//! Provenance synchronization engine.
//!
//! Mirrors batches, products, transfers, supply-chain steps, and
//! verifications onto an external ledger without ever blocking the local
//! write on ledger finality:
//!
//! - [`ProvenanceFacade`] records the local fact and enqueues its mirror
//! - [`ReconciliationPolicy`] numbers steps and decides submit, retry, or abandon
//! - [`ConfirmationPoller`] observes receipts and records outcomes
//! - [`EngineBuilder`] wires the components and owns their lifecycle

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod policy;
pub mod poller;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ConfigError, EngineConfig, LedgerSettings, PollerSettings, RetrySettings, ServerSettings,
    StorageSettings, TimeoutSettings,
};
pub use engine::{connect, Components, Engine, EngineBuilder};
pub use error::EngineError;
pub use facade::{Disposition, OpStatus, ProvenanceFacade, Submission, SubjectLedgerStatus};
pub use policy::{Decision, NewStep, ReconciliationPolicy};
pub use poller::{ConfirmationPoller, PollReport};
