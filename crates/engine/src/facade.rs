//! Provenance facade: the entry point the rest of the system calls.
//!
//! Every mutation returns as soon as the operation is recorded; the ledger
//! outcome is read back later through [`ProvenanceFacade::get_ledger_status`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use agritrace_ledger::{HeadOfLineBlock, LedgerInfo, LedgerRead};
use agritrace_storage::{
    BatchRegistration, EnqueueOutcome, IdempotencyKey, LedgerOperation, OperationKind,
    OperationPayload, OperationState, Outcome, ProductRegistration, StorageError, SubjectKind,
    SupplyChainStep, TransferRecord, VerificationRequest,
};

use crate::error::EngineError;
use crate::policy::{NewStep, ReconciliationPolicy};

/// How the log received a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Accepted,
    AlreadyPending,
    AlreadyConfirmed,
}

/// Immediate local result of a mirrored mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub key: IdempotencyKey,
    pub disposition: Disposition,
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_number: Option<u32>,
}

impl Submission {
    fn from_outcome(outcome: &EnqueueOutcome) -> Self {
        let op = outcome.operation();
        Submission {
            key: op.key.clone(),
            disposition: match outcome {
                EnqueueOutcome::Accepted(_) => Disposition::Accepted,
                EnqueueOutcome::AlreadyPending(_) => Disposition::AlreadyPending,
                EnqueueOutcome::AlreadyConfirmed(_) => Disposition::AlreadyConfirmed,
            },
            state: op.state,
            step_number: op.step_number(),
        }
    }
}

/// Lifecycle summary of one ledger operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpStatus {
    pub key: IdempotencyKey,
    pub state: OperationState,
    pub attempts: u32,
    pub tx_id: Option<String>,
    pub block: Option<u64>,
    pub last_error: Option<String>,
}

impl From<&LedgerOperation> for OpStatus {
    fn from(op: &LedgerOperation) -> Self {
        let block = match &op.outcome {
            Some(Outcome::Confirmed { block }) => Some(block.number),
            Some(Outcome::Failed { block, .. }) => block.as_ref().map(|b| b.number),
            _ => None,
        };
        OpStatus {
            key: op.key.clone(),
            state: op.state,
            attempts: op.attempts,
            tx_id: op.tx_id.clone(),
            block,
            last_error: op.last_error.clone(),
        }
    }
}

/// Everything the log knows about one subject's ledger mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectLedgerStatus {
    pub code: String,
    pub registration: Option<OpStatus>,
    pub steps: BTreeMap<u32, OpStatus>,
    pub transfers: Vec<OpStatus>,
    pub verification: Option<OpStatus>,
}

#[derive(Clone)]
pub struct ProvenanceFacade {
    policy: Arc<ReconciliationPolicy>,
}

impl ProvenanceFacade {
    pub fn new(policy: Arc<ReconciliationPolicy>) -> Self {
        ProvenanceFacade { policy }
    }

    // ── Mutations ────────────────────────────────────────────────────────

    pub async fn register_batch(&self, batch: BatchRegistration) -> Result<Submission, EngineError> {
        let code = batch.batch_number.clone();
        self.register(&code, SubjectKind::Batch, OperationPayload::RegisterBatch(batch))
            .await
    }

    pub async fn register_product(
        &self,
        product: ProductRegistration,
    ) -> Result<Submission, EngineError> {
        let code = product.qr_code.clone();
        self.register(
            &code,
            SubjectKind::Product,
            OperationPayload::RegisterProduct(product),
        )
        .await
    }

    async fn register(
        &self,
        code: &str,
        kind: SubjectKind,
        payload: OperationPayload,
    ) -> Result<Submission, EngineError> {
        self.policy.gateway.preflight(&payload)?;
        match self.policy.subjects.register_subject(code, kind).await {
            Ok(_) => {}
            // A retried registration finds its own row.
            Err(StorageError::SubjectExists { .. }) => {
                self.require_subject(code, Some(kind)).await?;
            }
            Err(e) => return Err(e.into()),
        }
        let outcome = self.policy.enqueue(payload).await?;
        Ok(Submission::from_outcome(&outcome))
    }

    pub async fn record_transfer(&self, transfer: TransferRecord) -> Result<Submission, EngineError> {
        self.require_subject(&transfer.qr_code, Some(SubjectKind::Product))
            .await?;
        let outcome = self
            .policy
            .enqueue(OperationPayload::RecordTransfer(transfer))
            .await?;
        Ok(Submission::from_outcome(&outcome))
    }

    /// Number and commit a step, then mirror it. The committed row is
    /// returned whatever happens on the ledger; if the mirror cannot even be
    /// recorded the row is left `Unsynced` for [`resync_step`](Self::resync_step).
    pub async fn append_step(
        &self,
        step: NewStep,
    ) -> Result<(SupplyChainStep, Submission), EngineError> {
        self.require_subject(&step.subject_code, None).await?;
        let (committed, outcome) = self.policy.append_step(step).await?;
        Ok((committed, Submission::from_outcome(&outcome)))
    }

    /// Concurrent calls for one product collapse onto a single operation.
    pub async fn mark_verified(&self, qr_code: &str) -> Result<Submission, EngineError> {
        self.require_subject(qr_code, Some(SubjectKind::Product))
            .await?;
        let outcome = self
            .policy
            .enqueue(OperationPayload::MarkVerified(VerificationRequest {
                qr_code: qr_code.to_string(),
            }))
            .await?;
        Ok(Submission::from_outcome(&outcome))
    }

    async fn require_subject(
        &self,
        code: &str,
        kind: Option<SubjectKind>,
    ) -> Result<(), EngineError> {
        let Some(subject) = self.policy.subjects.subject(code).await? else {
            return Err(EngineError::SubjectNotFound {
                code: code.to_string(),
            });
        };
        match kind {
            Some(expected) if subject.kind != expected => Err(EngineError::WrongSubjectKind {
                code: code.to_string(),
                expected,
            }),
            _ => Ok(()),
        }
    }

    // ── Status ───────────────────────────────────────────────────────────

    pub async fn get_ledger_status(&self, code: &str) -> Result<SubjectLedgerStatus, EngineError> {
        self.require_subject(code, None).await?;
        let mut status = SubjectLedgerStatus {
            code: code.to_string(),
            registration: None,
            steps: BTreeMap::new(),
            transfers: Vec::new(),
            verification: None,
        };
        for op in self.policy.log.list_for_subject(code).await? {
            let summary = OpStatus::from(&op);
            match op.kind {
                OperationKind::RegisterBatch | OperationKind::RegisterProduct => {
                    status.registration = Some(summary)
                }
                OperationKind::AppendStep => {
                    if let Some(n) = op.step_number() {
                        status.steps.insert(n, summary);
                    }
                }
                OperationKind::RecordTransfer => status.transfers.push(summary),
                OperationKind::MarkVerified => status.verification = Some(summary),
            }
        }
        Ok(status)
    }

    /// Direct ledger read; `Unknown` when the ledger cannot be asked.
    pub async fn is_verified_on_chain(&self, code: &str) -> LedgerRead<bool> {
        self.policy.gateway.is_verified(code).await
    }

    pub async fn ledger_info(&self) -> LedgerInfo {
        self.policy.gateway.ledger_info().await
    }

    // ── Operators ────────────────────────────────────────────────────────

    pub async fn operations(
        &self,
        state: Option<OperationState>,
    ) -> Result<Vec<LedgerOperation>, EngineError> {
        Ok(self.policy.log.list(state).await?)
    }

    pub async fn abandoned(&self) -> Result<Vec<LedgerOperation>, EngineError> {
        Ok(self.policy.log.list_abandoned().await?)
    }

    pub async fn operation(&self, key: &IdempotencyKey) -> Result<LedgerOperation, EngineError> {
        Ok(self.policy.log.get(key).await?)
    }

    pub async fn blocked_nonces(&self) -> Vec<HeadOfLineBlock> {
        self.policy.nonces.blocked_accounts().await
    }

    pub async fn resubmit_abandoned(
        &self,
        key: &IdempotencyKey,
    ) -> Result<LedgerOperation, EngineError> {
        self.policy.revive(key).await
    }

    /// Re-mirror a step that is already committed locally.
    ///
    /// A row that never got a log record is mirrored from its own columns.
    pub async fn resync_step(
        &self,
        code: &str,
        step_number: u32,
    ) -> Result<Submission, EngineError> {
        let committed = self.policy.subjects.steps(code).await?;
        let Some(row) = committed.iter().find(|s| s.step_number == step_number) else {
            return Err(EngineError::StepNotCommitted {
                code: code.to_string(),
                step_number,
            });
        };
        let key = IdempotencyKey::for_step(code, step_number);
        // Enqueue revives an abandoned record and leaves a live one alone.
        let outcome = match self.policy.log.get(&key).await {
            Ok(op) => self.policy.re_enqueue(&op).await?,
            Err(StorageError::OperationNotFound { .. }) => {
                tracing::info!(key = %key, "step has no ledger record, mirroring the committed row");
                self.policy
                    .enqueue(OperationPayload::AppendStep(row.ledger_record()))
                    .await?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Submission::from_outcome(&outcome))
    }

    /// Revive every abandoned operation, registrations before steps and
    /// steps in order. Returns the revived keys.
    pub async fn corrective_pass(&self) -> Result<Vec<IdempotencyKey>, EngineError> {
        let mut abandoned = self.policy.log.list_abandoned().await?;
        abandoned.sort_by(|a, b| {
            (&a.subject_code, !a.kind.is_registration(), a.step_number()).cmp(&(
                &b.subject_code,
                !b.kind.is_registration(),
                b.step_number(),
            ))
        });
        let mut revived = Vec::new();
        for op in abandoned {
            match self.policy.revive(&op.key).await {
                Ok(_) => revived.push(op.key),
                Err(e) => tracing::warn!(key = %op.key, error = %e, "corrective pass skipped operation"),
            }
        }
        tracing::info!(revived = revived.len(), "corrective pass finished");
        Ok(revived)
    }
}
