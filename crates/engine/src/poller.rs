//! Confirmation poller.
//!
//! The only component that records an outcome for a submitted transaction.
//! Each tick it:
//! 1. fetches receipts for operations submitted more than the grace period ago,
//! 2. hands unresolved Failed/Unknown operations to the policy,
//! 3. drives Pending operations whose backoff has elapsed,
//! 4. reports accounts with head-of-line nonce blocks,
//! 5. every few ticks, reconciles the nonce watermark with the ledger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::watch;

use agritrace_ledger::{HeadOfLineBlock, NonceDrift, NonceRelease, ReceiptStatus};
use agritrace_storage::{LedgerOperation, LedgerStatus, OperationState, Outcome};

use crate::config::{PollerSettings, TimeoutSettings};
use crate::error::EngineError;
use crate::policy::{Decision, ReconciliationPolicy};

/// What one tick observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub confirmed: usize,
    pub reverted: usize,
    pub still_pending: usize,
    pub timed_out: usize,
    pub unreachable: usize,
    pub submitted: usize,
    pub abandoned: usize,
    pub blocked: Vec<HeadOfLineBlock>,
    pub nonce_drift: Option<NonceDrift>,
}

pub struct ConfirmationPoller {
    policy: Arc<ReconciliationPolicy>,
    settings: PollerSettings,
    timeouts: TimeoutSettings,
    ticks: AtomicU64,
}

impl ConfirmationPoller {
    pub fn new(
        policy: Arc<ReconciliationPolicy>,
        settings: PollerSettings,
        timeouts: TimeoutSettings,
    ) -> Self {
        ConfirmationPoller {
            policy,
            settings,
            timeouts,
            ticks: AtomicU64::new(0),
        }
    }

    /// Tick on the configured interval until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.settings.interval_ms, "confirmation poller started");
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "poll tick failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("confirmation poller stopped");
    }

    /// One pass over the operation log.
    pub async fn tick(&self) -> Result<PollReport, EngineError> {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = &self.policy;
        let now = policy.clock.now();
        let mut report = PollReport::default();

        // Receipts, and Unknown operations nobody has decided on yet.
        let cutoff = now - self.timeouts.confirmation_grace();
        for op in policy.log.list_retryable(cutoff).await? {
            let result = match op.state {
                OperationState::Submitted => self.observe(&op, now, &mut report).await,
                OperationState::Unknown => self.drive(&op, &mut report).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                tracing::error!(key = %op.key, error = %e, "failed to process operation");
            }
        }
        for op in policy.log.list(Some(OperationState::Failed)).await? {
            if let Err(e) = self.drive(&op, &mut report).await {
                tracing::error!(key = %op.key, error = %e, "failed to process operation");
            }
        }

        // Pending work whose backoff has elapsed, predecessors first.
        let mut due: Vec<LedgerOperation> = policy
            .log
            .list(Some(OperationState::Pending))
            .await?
            .into_iter()
            .filter(|op| op.next_attempt_at.map_or(true, |t| t <= now))
            .collect();
        due.sort_by(|a, b| {
            (&a.subject_code, !a.kind.is_registration(), a.step_number(), a.created_at).cmp(&(
                &b.subject_code,
                !b.kind.is_registration(),
                b.step_number(),
                b.created_at,
            ))
        });
        for op in due {
            if let Err(e) = self.drive(&op, &mut report).await {
                tracing::error!(key = %op.key, error = %e, "failed to drive operation");
            }
        }

        report.blocked = policy.nonces.blocked_accounts().await;
        for block in &report.blocked {
            tracing::warn!(
                account = %block.account,
                nonce = block.blocking_nonce,
                waiting = block.waiting,
                "head-of-line nonce block"
            );
        }

        if tick % self.settings.nonce_reconcile_every.max(1) == 0 {
            if let Some(account) = policy.gateway.account().map(str::to_string) {
                report.nonce_drift = policy.reconcile_nonces(&account).await;
            }
        }

        Ok(report)
    }

    async fn drive(
        &self,
        op: &LedgerOperation,
        report: &mut PollReport,
    ) -> Result<(), EngineError> {
        match self.policy.drive(&op.key).await? {
            Decision::Submit => report.submitted += 1,
            Decision::Abandon(_) => report.abandoned += 1,
            _ => {}
        }
        Ok(())
    }

    /// Fetch the receipt of one submitted operation and record what it says.
    async fn observe(
        &self,
        op: &LedgerOperation,
        now: OffsetDateTime,
        report: &mut PollReport,
    ) -> Result<(), EngineError> {
        let policy = &self.policy;
        let Some(tx_id) = op.tx_id.as_deref() else {
            return Ok(());
        };
        let overdue = op
            .submitted_at
            .map_or(true, |t| t + self.timeouts.not_found() <= now);

        match policy.gateway.fetch_receipt(tx_id).await {
            ReceiptStatus::Confirmed(block) => {
                let hash = block.hash.clone();
                let number = block.number;
                policy
                    .log
                    .mark_resolved(&op.key, Outcome::Confirmed { block }, now)
                    .await?;
                self.release(op, NonceRelease::Consumed).await;
                policy.write_back(op, LedgerStatus::Synced, Some(&hash)).await;
                tracing::info!(key = %op.key, tx = %tx_id, block = number, "confirmed");
                report.confirmed += 1;
            }
            ReceiptStatus::Reverted { block, reason } => {
                tracing::warn!(key = %op.key, tx = %tx_id, block = block.number, %reason, "reverted");
                policy
                    .log
                    .mark_resolved(
                        &op.key,
                        Outcome::Failed {
                            block: Some(block),
                            reason,
                        },
                        now,
                    )
                    .await?;
                self.release(op, NonceRelease::Consumed).await;
                report.reverted += 1;
                self.drive(op, report).await?;
            }
            ReceiptStatus::StillPending if overdue => {
                // Waiting in the mempool, most likely behind a missing lower
                // nonce. The nonce stays claimed; the retry path re-checks
                // the receipt before sending anything.
                tracing::warn!(key = %op.key, tx = %tx_id, "transaction still pending, marking unknown");
                policy
                    .log
                    .mark_resolved(
                        &op.key,
                        Outcome::UnknownTimeout {
                            reason: format!(
                                "transaction {} still pending after {} ms",
                                tx_id, self.timeouts.not_found_ms
                            ),
                        },
                        now,
                    )
                    .await?;
                report.timed_out += 1;
                self.drive(op, report).await?;
            }
            ReceiptStatus::StillPending => report.still_pending += 1,
            ReceiptStatus::NotFound if overdue => {
                let reason = format!(
                    "transaction {} not found after {} ms",
                    tx_id, self.timeouts.not_found_ms
                );
                tracing::warn!(key = %op.key, tx = %tx_id, "receipt not found, marking unknown");
                policy
                    .log
                    .mark_resolved(&op.key, Outcome::UnknownTimeout { reason }, now)
                    .await?;
                // Dropped: the nonce never reached a block.
                self.release(op, NonceRelease::Void).await;
                report.timed_out += 1;
                self.drive(op, report).await?;
            }
            ReceiptStatus::NotFound => report.still_pending += 1,
            ReceiptStatus::Unreachable(reason) => {
                report.unreachable += 1;
                if overdue {
                    tracing::warn!(key = %op.key, tx = %tx_id, %reason, "receipt unobtainable, marking unknown");
                    // Whether the nonce was consumed is unknown; it stays
                    // outstanding until a receipt or reconciliation says.
                    policy
                        .log
                        .mark_resolved(
                            &op.key,
                            Outcome::UnknownTimeout {
                                reason: format!("receipt unobtainable: {}", reason),
                            },
                            now,
                        )
                        .await?;
                    report.timed_out += 1;
                    self.drive(op, report).await?;
                } else {
                    tracing::debug!(key = %op.key, tx = %tx_id, %reason, "receipt query failed");
                }
            }
        }
        Ok(())
    }

    async fn release(&self, op: &LedgerOperation, how: NonceRelease) {
        if let (Some(account), Some(nonce)) = (&op.account, op.nonce) {
            self.policy.nonces.release(account, nonce, how).await;
        }
    }
}
