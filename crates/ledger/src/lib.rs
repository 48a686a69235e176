//! Ledger access for the provenance engine.
//!
//! Provides:
//! - [`LedgerGateway`]: typed single-shot calls to the external ledger
//! - [`JsonRpcGateway`]: the gateway over JSON-RPC/HTTP
//! - [`SimulatedLedger`]: an in-process ledger with fault injection
//! - [`NonceSequencer`]: per-account nonce claims with head-of-line release
//! - [`AccountSigner`]: the Ed25519 signing account

pub mod error;
pub mod gateway;
pub mod nonce;
pub mod rpc;
pub mod signer;
pub mod simulated;
pub mod transaction;

pub use error::{KeyError, SubmissionError};
pub use gateway::{
    LedgerGateway, LedgerInfo, LedgerRead, OnChainStep, OnChainSubject, ReceiptStatus,
};
pub use nonce::{HeadOfLineBlock, NonceDrift, NonceRelease, NonceSequencer, NonceSnapshot};
pub use rpc::{JsonRpcGateway, RpcSettings};
pub use signer::AccountSigner;
pub use simulated::SimulatedLedger;
pub use transaction::{ContractCall, GasSchedule, SignedTransaction, UnsignedTransaction};
