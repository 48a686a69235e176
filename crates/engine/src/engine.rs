//! Engine lifecycle: build the components once, start the background tasks,
//! stop them on shutdown.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use agritrace_ledger::{
    AccountSigner, JsonRpcGateway, LedgerGateway, LedgerRead, NonceSequencer,
};
use agritrace_storage::{
    IdempotencyKey, MemoryOperationLog, MemorySubjectStore, OperationLog, OperationState,
    SubjectStore,
};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::facade::ProvenanceFacade;
use crate::poller::ConfirmationPoller;
use crate::policy::ReconciliationPolicy;

/// Build the JSON-RPC gateway described by `config`, loading the signing
/// key when one is configured.
pub fn connect(config: &EngineConfig) -> Result<JsonRpcGateway, EngineError> {
    let signer = match &config.ledger.signing_key_path {
        Some(path) => Some(Arc::new(AccountSigner::from_file(path)?)),
        None => {
            tracing::warn!("no signing key configured, ledger writes will be refused");
            None
        }
    };
    Ok(JsonRpcGateway::new(config.rpc_settings(), signer))
}

/// The wired components, with nothing running.
pub struct Components {
    pub facade: ProvenanceFacade,
    pub poller: ConfirmationPoller,
    pub policy: Arc<ReconciliationPolicy>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    gateway: Option<Arc<dyn LedgerGateway>>,
    log: Option<Arc<dyn OperationLog>>,
    subjects: Option<Arc<dyn SubjectStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        EngineBuilder {
            config,
            gateway: None,
            log: None,
            subjects: None,
            clock: None,
        }
    }

    pub fn gateway(mut self, gateway: Arc<dyn LedgerGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn log(mut self, log: Arc<dyn OperationLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn subjects(mut self, subjects: Arc<dyn SubjectStore>) -> Self {
        self.subjects = Some(subjects);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn wire(
        self,
        notify: Option<mpsc::UnboundedSender<IdempotencyKey>>,
    ) -> Result<Components, EngineError> {
        self.config.validate()?;
        let log: Arc<dyn OperationLog> = match self.log {
            Some(log) => log,
            None => match &self.config.storage.journal_path {
                Some(path) => Arc::new(MemoryOperationLog::open_journal(path)?),
                None => Arc::new(MemoryOperationLog::new()),
            },
        };
        let subjects = self
            .subjects
            .unwrap_or_else(|| Arc::new(MemorySubjectStore::new()));
        let gateway: Arc<dyn LedgerGateway> = match self.gateway {
            Some(gateway) => gateway,
            None => Arc::new(connect(&self.config)?),
        };
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let policy = Arc::new(ReconciliationPolicy::new(
            log,
            subjects,
            gateway,
            Arc::new(NonceSequencer::new()),
            clock,
            self.config.retry.clone(),
            self.config.timeouts.clone(),
            notify,
        ));
        Ok(Components {
            facade: ProvenanceFacade::new(Arc::clone(&policy)),
            poller: ConfirmationPoller::new(
                Arc::clone(&policy),
                self.config.poller.clone(),
                self.config.timeouts.clone(),
            ),
            policy,
        })
    }

    /// Wire everything without starting background work. Operations are
    /// driven only by explicit [`ConfirmationPoller::tick`] calls.
    pub fn assemble(self) -> Result<Components, EngineError> {
        self.wire(None)
    }

    /// Wire everything, restore nonce state, and start the dispatcher and
    /// the poller.
    pub async fn start(self) -> Result<Engine, EngineError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let components = self.wire(Some(tx))?;
        restore_nonces(&components.policy).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&components.policy),
            rx,
            shutdown_rx.clone(),
        ));
        let poller = Arc::new(components.poller);
        let poller_task = {
            let poller = Arc::clone(&poller);
            tokio::spawn(async move { poller.run(shutdown_rx).await })
        };
        tracing::info!(
            account = components.policy.gateway.account().unwrap_or("none"),
            "provenance engine started"
        );
        Ok(Engine {
            facade: components.facade,
            poller,
            shutdown: shutdown_tx,
            tasks: vec![dispatcher, poller_task],
        })
    }
}

/// Seed the sequencer from the ledger, then re-claim nonces of transactions
/// that were in flight when the process last stopped.
async fn restore_nonces(policy: &ReconciliationPolicy) -> Result<(), EngineError> {
    let Some(account) = policy.gateway.account().map(str::to_string) else {
        return Ok(());
    };
    match policy.gateway.account_nonce(&account).await {
        LedgerRead::Found(on_chain) => policy.nonces.seed(&account, on_chain).await,
        LedgerRead::NotFound => policy.nonces.seed(&account, 0).await,
        LedgerRead::Unknown(reason) => {
            tracing::warn!(%account, %reason, "ledger nonce unavailable at start, starting from zero")
        }
    }
    let mut adopted = 0usize;
    for op in policy.log.list(Some(OperationState::Submitted)).await? {
        if let (Some(owner), Some(nonce)) = (&op.account, op.nonce) {
            if *owner == account {
                policy.nonces.adopt(&account, nonce).await;
                adopted += 1;
            }
        }
    }
    if adopted > 0 {
        tracing::info!(%account, adopted, "in-flight nonces restored");
    }
    Ok(())
}

/// Drive newly enqueued operations right away instead of waiting for the
/// next poll.
async fn dispatch(
    policy: Arc<ReconciliationPolicy>,
    mut rx: mpsc::UnboundedReceiver<IdempotencyKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            next = rx.recv() => {
                let Some(key) = next else { break };
                let policy = Arc::clone(&policy);
                tokio::spawn(async move {
                    if let Err(e) = policy.drive(&key).await {
                        tracing::error!(key = %key, error = %e, "dispatch failed");
                    }
                });
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("dispatcher stopped");
}

/// A running engine.
pub struct Engine {
    facade: ProvenanceFacade,
    poller: Arc<ConfirmationPoller>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn facade(&self) -> &ProvenanceFacade {
        &self.facade
    }

    pub fn poller(&self) -> &ConfirmationPoller {
        &self.poller
    }

    /// Stop the background tasks and wait for them. Operations in flight stay
    /// in the log and resume on the next start.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "engine task ended abnormally");
            }
        }
        tracing::info!("provenance engine stopped");
    }
}
