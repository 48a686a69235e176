//! In-process ledger for local development and tests.
//!
//! Applies signed transactions strictly in nonce order per account, keeps a
//! mempool for nonces that arrive early, and enforces the contract rules the
//! engine relies on (no duplicate registration, steps in order). Faults can
//! be injected to exercise the retry and confirmation paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use agritrace_storage::{BlockRef, LedgerOperation, SubjectKind};

use crate::error::SubmissionError;
use crate::gateway::{
    LedgerGateway, LedgerInfo, LedgerRead, OnChainStep, OnChainSubject, ReceiptStatus,
};
use crate::signer::AccountSigner;
use crate::transaction::{GasSchedule, SignedTransaction, UnsignedTransaction};

const CONTRACT: &str = "0x5afe000000000000000000000000000000000001";

const BATCH_FIELDS: &[&str] = &["batch_number", "seed_variety", "planting_date", "total_quantity"];
const PRODUCT_FIELDS: &[&str] = &[
    "qr_code",
    "name",
    "variety",
    "iron_content",
    "biofortified",
    "quantity",
    "harvest_date",
    "ipfs_hash",
];

#[derive(Debug, Clone)]
enum Inclusion {
    Applied(BlockRef),
    Reverted { block: BlockRef, reason: String },
}

#[derive(Debug, Default)]
struct Faults {
    outage: bool,
    unreachable_receipts: usize,
    drop_next: usize,
    lose_replies: usize,
    reject_next: Option<String>,
    hold_inclusion: bool,
}

#[derive(Debug, Default)]
struct ChainState {
    height: u64,
    clock: i64,
    /// Last consumed nonce per account.
    nonces: HashMap<String, u64>,
    /// Valid transactions waiting for inclusion, by (account, nonce).
    mempool: BTreeMap<(String, u64), (String, SignedTransaction)>,
    receipts: HashMap<String, Inclusion>,
    subjects: HashMap<String, OnChainSubject>,
    steps: HashMap<String, Vec<OnChainStep>>,
    verified: HashSet<String>,
    transfers: Vec<Value>,
    /// Sends that reached the ledger, per idempotency key.
    sends: HashMap<String, usize>,
    /// Applied (non-reverted) transactions, per idempotency key.
    effects: HashMap<String, usize>,
    faults: Faults,
}

/// A ledger living entirely in memory.
pub struct SimulatedLedger {
    signer: Option<AccountSigner>,
    gas: GasSchedule,
    chain: Mutex<ChainState>,
}

impl SimulatedLedger {
    pub fn new(signer: Option<AccountSigner>) -> Self {
        SimulatedLedger {
            signer,
            gas: GasSchedule::default(),
            chain: Mutex::new(ChainState::default()),
        }
    }

    /// A simulated ledger with a freshly generated signing account.
    pub fn with_random_account() -> Self {
        Self::new(Some(AccountSigner::generate()))
    }

    fn chain(&self) -> MutexGuard<'_, ChainState> {
        self.chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Fault injection ──────────────────────────────────────────────────

    /// While set, every call fails as if the node were unreachable.
    pub fn set_outage(&self, outage: bool) {
        self.chain().faults.outage = outage;
    }

    /// The next `n` receipt queries report the node unreachable.
    pub fn fail_receipt_polls(&self, n: usize) {
        self.chain().faults.unreachable_receipts = n;
    }

    /// The next `n` sends are acknowledged but silently discarded.
    pub fn drop_next_submissions(&self, n: usize) {
        self.chain().faults.drop_next = n;
    }

    /// The next `n` sends are accepted, but the caller is told the reply
    /// never arrived.
    pub fn lose_next_replies(&self, n: usize) {
        self.chain().faults.lose_replies = n;
    }

    /// The next send is rejected with `reason`.
    pub fn reject_next_submission(&self, reason: &str) {
        self.chain().faults.reject_next = Some(reason.to_string());
    }

    /// While set, accepted transactions stay in the mempool until [`mine`](Self::mine).
    pub fn hold_inclusion(&self, hold: bool) {
        self.chain().faults.hold_inclusion = hold;
    }

    /// Include everything includable in the mempool.
    pub fn mine(&self) {
        let mut chain = self.chain();
        let accounts: HashSet<String> = chain.mempool.keys().map(|(a, _)| a.clone()).collect();
        for account in accounts {
            chain.drain_mempool(&account);
        }
    }

    // ── Observation ──────────────────────────────────────────────────────

    /// Sends for `key` that reached the ledger, dropped or not.
    pub fn sends_for(&self, key: &str) -> usize {
        self.chain().sends.get(key).copied().unwrap_or(0)
    }

    /// Transactions for `key` the contract applied.
    pub fn effects_for(&self, key: &str) -> usize {
        self.chain().effects.get(key).copied().unwrap_or(0)
    }

    pub fn total_sends(&self) -> usize {
        self.chain().sends.values().sum()
    }

    pub fn height(&self) -> u64 {
        self.chain().height
    }

    pub fn transfers(&self) -> Vec<Value> {
        self.chain().transfers.clone()
    }

    /// Apply a transaction for `account` without going through `submit`,
    /// as another client sharing the key would.
    pub fn consume_nonce_externally(&self, account: &str) {
        let mut chain = self.chain();
        let next = chain.nonces.get(account).copied().unwrap_or(0) + 1;
        chain.nonces.insert(account.to_string(), next);
        chain.height += 1;
    }
}

fn str_arg(tx: &UnsignedTransaction, i: usize) -> String {
    match tx.call.args.get(i) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

impl ChainState {
    fn drain_mempool(&mut self, account: &str) {
        loop {
            let next = self.nonces.get(account).copied().unwrap_or(0) + 1;
            let Some((tx_id, signed)) = self.mempool.remove(&(account.to_string(), next)) else {
                break;
            };
            self.include(&tx_id, &signed);
        }
    }

    fn include(&mut self, tx_id: &str, signed: &SignedTransaction) {
        let tx = &signed.tx;
        self.nonces.insert(tx.from.clone(), tx.nonce);
        self.height += 1;
        self.clock += 12;
        let block = BlockRef {
            number: self.height,
            hash: format!(
                "0x{:x}",
                Sha256::digest(format!("{}:{}", self.height, tx_id).as_bytes())
            ),
        };
        match self.apply(tx) {
            Ok(()) => {
                *self.effects.entry(tx.memo.clone()).or_default() += 1;
                self.receipts.insert(tx_id.to_string(), Inclusion::Applied(block));
            }
            Err(reason) => {
                tracing::debug!(tx = tx_id, %reason, "simulated contract reverted");
                self.receipts
                    .insert(tx_id.to_string(), Inclusion::Reverted { block, reason });
            }
        }
    }

    fn apply(&mut self, tx: &UnsignedTransaction) -> Result<(), String> {
        let code = match tx.call.method.as_str() {
            "recordTransaction" => str_arg(tx, 1),
            _ => str_arg(tx, 0),
        };
        match tx.call.method.as_str() {
            "registerBatch" | "registerProduct" => {
                if self.subjects.contains_key(&code) {
                    return Err(format!("{} already registered", code));
                }
                let (kind, names) = if tx.call.method == "registerBatch" {
                    (SubjectKind::Batch, BATCH_FIELDS)
                } else {
                    (SubjectKind::Product, PRODUCT_FIELDS)
                };
                let mut details = serde_json::Map::new();
                for (name, value) in names.iter().zip(tx.call.args.iter()) {
                    details.insert(name.to_string(), value.clone());
                }
                details.insert("creator".to_string(), json!(tx.from));
                self.subjects.insert(
                    code.clone(),
                    OnChainSubject {
                        code,
                        kind,
                        creator: tx.from.clone(),
                        details: Value::Object(details),
                    },
                );
                Ok(())
            }
            "addSupplyChainStep" => {
                if !self.subjects.contains_key(&code) {
                    return Err(format!("{} is not registered", code));
                }
                let step_number = tx.call.args.get(1).and_then(Value::as_u64).unwrap_or(0);
                let steps = self.steps.entry(code.clone()).or_default();
                if step_number != steps.len() as u64 + 1 {
                    return Err(format!(
                        "step {} out of order for {}, expected {}",
                        step_number,
                        code,
                        steps.len() + 1
                    ));
                }
                steps.push(OnChainStep {
                    actor: tx.from.clone(),
                    action: str_arg(tx, 2),
                    description: str_arg(tx, 3),
                    timestamp: self.clock,
                    location: str_arg(tx, 4),
                });
                Ok(())
            }
            "recordTransaction" => {
                if !self.subjects.contains_key(&code) {
                    return Err(format!("{} is not registered", code));
                }
                self.transfers.push(json!({
                    "from": tx.from,
                    "to": str_arg(tx, 0),
                    "qr_code": code,
                    "quantity": str_arg(tx, 2),
                    "price": str_arg(tx, 3),
                    "transaction_type": str_arg(tx, 4),
                    "transfer_id": str_arg(tx, 5),
                }));
                Ok(())
            }
            "verifyProduct" => match self.subjects.get(&code) {
                Some(s) if s.kind == SubjectKind::Product => {
                    self.verified.insert(code);
                    Ok(())
                }
                _ => Err(format!("product {} is not registered", code)),
            },
            other => Err(format!("unknown method {}", other)),
        }
    }
}

#[async_trait]
impl LedgerGateway for SimulatedLedger {
    fn account(&self) -> Option<&str> {
        self.signer.as_ref().map(AccountSigner::address)
    }

    async fn submit(&self, op: &LedgerOperation, nonce: u64) -> Result<String, SubmissionError> {
        let signer = self
            .signer
            .as_ref()
            .ok_or_else(|| SubmissionError::Signing("no signing account configured".to_string()))?;
        let unsigned =
            UnsignedTransaction::for_operation(signer.address(), CONTRACT, &self.gas, op, nonce);
        let signed = signer.sign(unsigned).map_err(SubmissionError::Signing)?;
        let raw = signed.encode().map_err(SubmissionError::Signing)?;

        let mut chain = self.chain();
        if chain.faults.outage {
            return Err(SubmissionError::Transport("connection refused".to_string()));
        }
        if let Some(reason) = chain.faults.reject_next.take() {
            return Err(SubmissionError::Rejected(reason));
        }

        // Decode from the wire form, as a node would.
        let received = SignedTransaction::decode(&raw).map_err(SubmissionError::Rejected)?;
        received.verify().map_err(SubmissionError::Rejected)?;
        let tx_id = received.tx_id().map_err(SubmissionError::Rejected)?;
        let account = received.tx.from.clone();
        *chain.sends.entry(received.tx.memo.clone()).or_default() += 1;

        let consumed = chain.nonces.get(&account).copied().unwrap_or(0);
        if nonce <= consumed {
            return Err(SubmissionError::NonceConflict {
                nonce,
                message: format!("nonce too low, account at {}", consumed),
            });
        }
        if chain.mempool.contains_key(&(account.clone(), nonce)) {
            return Err(SubmissionError::NonceConflict {
                nonce,
                message: "nonce already pending".to_string(),
            });
        }
        if chain.faults.drop_next > 0 {
            chain.faults.drop_next -= 1;
            return Ok(tx_id);
        }

        chain
            .mempool
            .insert((account.clone(), nonce), (tx_id.clone(), received));
        if !chain.faults.hold_inclusion {
            chain.drain_mempool(&account);
        }
        if chain.faults.lose_replies > 0 {
            chain.faults.lose_replies -= 1;
            return Err(SubmissionError::Unacknowledged {
                tx_id,
                message: "reply lost".to_string(),
            });
        }
        Ok(tx_id)
    }

    async fn fetch_receipt(&self, tx_id: &str) -> ReceiptStatus {
        let mut chain = self.chain();
        if chain.faults.outage {
            return ReceiptStatus::Unreachable("connection refused".to_string());
        }
        if chain.faults.unreachable_receipts > 0 {
            chain.faults.unreachable_receipts -= 1;
            return ReceiptStatus::Unreachable("receipt query timed out".to_string());
        }
        match chain.receipts.get(tx_id) {
            Some(Inclusion::Applied(block)) => ReceiptStatus::Confirmed(block.clone()),
            Some(Inclusion::Reverted { block, reason }) => ReceiptStatus::Reverted {
                block: block.clone(),
                reason: reason.clone(),
            },
            None if chain.mempool.values().any(|(id, _)| id == tx_id) => {
                ReceiptStatus::StillPending
            }
            None => ReceiptStatus::NotFound,
        }
    }

    async fn account_nonce(&self, account: &str) -> LedgerRead<u64> {
        let chain = self.chain();
        if chain.faults.outage {
            return LedgerRead::Unknown("connection refused".to_string());
        }
        LedgerRead::Found(chain.nonces.get(account).copied().unwrap_or(0))
    }

    async fn get_subject(&self, code: &str) -> LedgerRead<OnChainSubject> {
        let chain = self.chain();
        if chain.faults.outage {
            return LedgerRead::Unknown("connection refused".to_string());
        }
        match chain.subjects.get(code) {
            Some(s) => LedgerRead::Found(s.clone()),
            None => LedgerRead::NotFound,
        }
    }

    async fn get_step_history(&self, code: &str) -> LedgerRead<Vec<OnChainStep>> {
        let chain = self.chain();
        if chain.faults.outage {
            return LedgerRead::Unknown("connection refused".to_string());
        }
        if !chain.subjects.contains_key(code) {
            return LedgerRead::NotFound;
        }
        LedgerRead::Found(chain.steps.get(code).cloned().unwrap_or_default())
    }

    async fn is_verified(&self, code: &str) -> LedgerRead<bool> {
        let chain = self.chain();
        if chain.faults.outage {
            return LedgerRead::Unknown("connection refused".to_string());
        }
        match chain.subjects.get(code) {
            Some(s) if s.kind == SubjectKind::Product => {
                LedgerRead::Found(chain.verified.contains(code))
            }
            _ => LedgerRead::NotFound,
        }
    }

    async fn ledger_info(&self) -> LedgerInfo {
        let chain = self.chain();
        LedgerInfo {
            connected: !chain.faults.outage,
            network: "simulated".to_string(),
            endpoint: "memory://".to_string(),
            account: self.account().map(str::to_string),
            balance: self.signer.as_ref().map(|_| "1000000".to_string()),
            contract_address: Some(CONTRACT.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agritrace_storage::{
        ActorType, BatchRegistration, OperationPayload, StepAction, StepRecord,
    };
    use rust_decimal::Decimal;
    use time::OffsetDateTime;

    fn batch_op(code: &str) -> LedgerOperation {
        LedgerOperation::new(
            OperationPayload::RegisterBatch(BatchRegistration {
                batch_number: code.to_string(),
                seed_variety: "NUA45".to_string(),
                planting_date: 1_700_000_000,
                total_quantity: Decimal::new(250, 0),
            }),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    fn step_op(code: &str, n: u32) -> LedgerOperation {
        LedgerOperation::new(
            OperationPayload::AppendStep(StepRecord {
                subject_code: code.to_string(),
                step_number: n,
                action: StepAction::Harvested,
                actor: "farmer-1".to_string(),
                actor_type: ActorType::Farmer,
                description: String::new(),
                location: Some("Kakamega".to_string()),
                temperature: None,
                humidity: None,
            }),
            OffsetDateTime::UNIX_EPOCH,
        )
    }

    #[tokio::test]
    async fn in_order_submission_confirms() {
        let ledger = SimulatedLedger::with_random_account();
        let tx = ledger.submit(&batch_op("B1"), 1).await.unwrap();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Confirmed(BlockRef { number: 1, .. })
        ));
        assert_eq!(ledger.effects_for("register_batch:B1"), 1);
        let account = ledger.account().unwrap().to_string();
        assert_eq!(ledger.account_nonce(&account).await, LedgerRead::Found(1));
    }

    #[tokio::test]
    async fn early_nonce_waits_in_mempool() {
        let ledger = SimulatedLedger::with_random_account();
        let tx2 = ledger.submit(&step_op("B1", 1), 2).await.unwrap();
        assert_eq!(ledger.fetch_receipt(&tx2).await, ReceiptStatus::StillPending);
        ledger.submit(&batch_op("B1"), 1).await.unwrap();
        assert!(matches!(
            ledger.fetch_receipt(&tx2).await,
            ReceiptStatus::Confirmed(_)
        ));
    }

    #[tokio::test]
    async fn reused_nonce_is_a_conflict() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.submit(&batch_op("B1"), 1).await.unwrap();
        let err = ledger.submit(&batch_op("B2"), 1).await.unwrap_err();
        assert!(matches!(err, SubmissionError::NonceConflict { nonce: 1, .. }));
    }

    #[tokio::test]
    async fn duplicate_registration_reverts_and_consumes_nonce() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.submit(&batch_op("B1"), 1).await.unwrap();
        let tx = ledger.submit(&batch_op("B1"), 2).await.unwrap();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Reverted { .. }
        ));
        assert_eq!(ledger.effects_for("register_batch:B1"), 1);
        assert_eq!(ledger.sends_for("register_batch:B1"), 2);
    }

    #[tokio::test]
    async fn dropped_transaction_is_not_found() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.drop_next_submissions(1);
        let tx = ledger.submit(&batch_op("B1"), 1).await.unwrap();
        assert_eq!(ledger.fetch_receipt(&tx).await, ReceiptStatus::NotFound);
        // The nonce was never consumed.
        ledger.submit(&batch_op("B1"), 1).await.unwrap();
    }

    #[tokio::test]
    async fn lost_reply_still_applies_the_transaction() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.lose_next_replies(1);
        let err = ledger.submit(&batch_op("B1"), 1).await.unwrap_err();
        let tx = err.possibly_sent().unwrap().to_string();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Confirmed(_)
        ));
        assert_eq!(ledger.effects_for("register_batch:B1"), 1);
    }

    #[tokio::test]
    async fn outage_affects_every_call() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.set_outage(true);
        assert!(ledger.submit(&batch_op("B1"), 1).await.unwrap_err().is_retryable());
        assert!(matches!(
            ledger.get_subject("B1").await,
            LedgerRead::Unknown(_)
        ));
        assert!(!ledger.ledger_info().await.connected);
        assert_eq!(ledger.total_sends(), 0);
    }

    #[tokio::test]
    async fn steps_must_arrive_in_order() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.submit(&batch_op("B1"), 1).await.unwrap();
        let tx = ledger.submit(&step_op("B1", 2), 2).await.unwrap();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Reverted { .. }
        ));
        let tx = ledger.submit(&step_op("B1", 1), 3).await.unwrap();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Confirmed(_)
        ));
        match ledger.get_step_history("B1").await {
            LedgerRead::Found(steps) => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].action, "harvested");
                assert_eq!(steps[0].location, "Kakamega");
            }
            other => panic!("expected history, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receipt_polls_can_be_made_to_fail() {
        let ledger = SimulatedLedger::with_random_account();
        let tx = ledger.submit(&batch_op("B1"), 1).await.unwrap();
        ledger.fail_receipt_polls(2);
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Unreachable(_)
        ));
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Unreachable(_)
        ));
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Confirmed(_)
        ));
    }

    #[tokio::test]
    async fn held_transactions_include_on_mine() {
        let ledger = SimulatedLedger::with_random_account();
        ledger.hold_inclusion(true);
        let tx = ledger.submit(&batch_op("B1"), 1).await.unwrap();
        assert_eq!(ledger.fetch_receipt(&tx).await, ReceiptStatus::StillPending);
        ledger.mine();
        assert!(matches!(
            ledger.fetch_receipt(&tx).await,
            ReceiptStatus::Confirmed(_)
        ));
    }
}
