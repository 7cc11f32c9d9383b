//! Sync coordinator
//!
//! Drains the pending mutation log to the server (push) and refreshes claims,
//! farms and fields from it (pull). At most one push and one pull run at a
//! time per installation. A push requested while one is running is folded
//! into the running push as an extra drain pass.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::outbox::{coalesce, MutationKind, PushBatch};
use super::protocol::{PushFailure, SyncUpResponse};
use super::transport::SyncTransport;
use crate::config::SyncConfig;
use crate::error::{ErrorCategory, SyncError};
use crate::storage::LocalStore;

/// What the background loop should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    Push,
    Pull,
    Full,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushReport {
    /// Push requests sent
    pub requests: usize,
    pub sessions: Vec<Uuid>,
    pub samples: Vec<Uuid>,
    pub failed: Vec<PushFailure>,
    /// Queue entries left after the push
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    Pushed(PushReport),
    /// Another push was running and will pick up the work
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PullReport {
    pub claims: usize,
    pub farms: usize,
    pub fields: usize,
    pub cursor: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Pulled(PullReport),
    Deferred,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub push: PushOutcome,
    pub pull: PullOutcome,
}

pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    config: SyncConfig,
    push_gate: Mutex<()>,
    push_requested: AtomicBool,
    pull_gate: Mutex<()>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>, config: SyncConfig) -> Self {
        Self {
            store,
            transport,
            config,
            push_gate: Mutex::new(()),
            push_requested: AtomicBool::new(false),
            pull_gate: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Push everything queued. Unacknowledged mutations stay queued on any error.
    pub async fn push(&self) -> Result<PushOutcome, SyncError> {
        let mut report = PushReport::default();
        let mut ran = false;

        loop {
            let gate = match self.push_gate.try_lock() {
                Ok(gate) => gate,
                Err(_) => {
                    self.push_requested.store(true, Ordering::SeqCst);
                    // The running push may have finished in between.
                    match self.push_gate.try_lock() {
                        Ok(gate) => gate,
                        Err(_) => break,
                    }
                }
            };
            ran = true;
            self.push_requested.store(false, Ordering::SeqCst);
            self.drain(&mut report).await?;
            drop(gate);

            if !self.push_requested.load(Ordering::SeqCst) {
                break;
            }
            debug!("Push requested while draining, running another pass");
        }

        if !ran {
            debug!("Push already running, coalesced");
            return Ok(PushOutcome::Deferred);
        }

        report.remaining = self.store.pending_count()?;
        info!(
            requests = report.requests,
            sessions = report.sessions.len(),
            samples = report.samples.len(),
            failed = report.failed.len(),
            remaining = report.remaining,
            "Push finished"
        );
        Ok(PushOutcome::Pushed(report))
    }

    /// One drain pass: send coalesced batches until nothing sendable is left.
    async fn drain(&self, report: &mut PushReport) -> Result<(), SyncError> {
        let max_batch = self.config.max_batch.max(1);
        let mut refused: HashSet<Uuid> = HashSet::new();

        loop {
            let mutations: Vec<_> = coalesce(self.store.pending()?)
                .into_iter()
                .filter(|m| !refused.contains(&m.entity_id))
                .take(max_batch)
                .collect();
            if mutations.is_empty() {
                return Ok(());
            }

            let batch = PushBatch::new(mutations);
            let request = batch.to_request()?;
            let response = self.bounded(self.transport.push(&request)).await?;
            report.requests += 1;

            let acked = self.acknowledge(&batch, &response, report)?;
            for failure in &response.failed {
                warn!(id = %failure.id, reason = %failure.reason, detail = ?failure.detail, "Server refused item");
            }
            report.failed.extend(response.failed);

            // Anything not acknowledged waits for the next sync.
            refused.extend(
                batch
                    .mutations
                    .iter()
                    .map(|m| m.entity_id)
                    .filter(|id| !acked.contains(id)),
            );
        }
    }

    fn acknowledge(
        &self,
        batch: &PushBatch,
        response: &SyncUpResponse,
        report: &mut PushReport,
    ) -> Result<HashSet<Uuid>, SyncError> {
        let completed = batch.completed_sessions();
        let mut acked = HashSet::new();

        for &id in &response.synced.sessions {
            let Some(seq) = batch.seq_for(MutationKind::SessionUpsert, id) else {
                continue;
            };
            self.store.acknowledge(MutationKind::SessionUpsert, id, seq)?;
            if completed.contains(&id) && self.store.mark_session_synced(id)? {
                debug!(session_id = %id, "Session synced");
            }
            acked.insert(id);
            report.sessions.push(id);
        }

        for &id in &response.synced.samples {
            let Some(seq) = batch.seq_for(MutationKind::SampleUpsert, id) else {
                continue;
            };
            self.store.acknowledge(MutationKind::SampleUpsert, id, seq)?;
            acked.insert(id);
            report.samples.push(id);
        }

        Ok(acked)
    }

    /// Pull claims, farms and fields changed since the stored cursor.
    pub async fn pull(&self) -> Result<PullOutcome, SyncError> {
        let Ok(_gate) = self.pull_gate.try_lock() else {
            debug!("Pull already running");
            return Ok(PullOutcome::Deferred);
        };

        let cursor = self.store.cursor()?;
        let response = self.bounded(self.transport.pull(cursor)).await?;
        self.store.apply_pull(&response)?;

        let report = PullReport {
            claims: response.claims.len(),
            farms: response.farms.len(),
            fields: response.fields.len(),
            cursor: response.timestamp,
        };
        info!(
            full = cursor.is_none(),
            claims = report.claims,
            farms = report.farms,
            fields = report.fields,
            cursor = %report.cursor,
            "Pull finished"
        );
        Ok(PullOutcome::Pulled(report))
    }

    /// Push, then pull.
    pub async fn sync_once(&self) -> Result<SyncReport, SyncError> {
        let push = self.push().await?;
        let pull = self.pull().await?;
        Ok(SyncReport { push, pull })
    }

    /// Background loop: sync on every interval tick and on demand.
    ///
    /// Returns once every trigger sender has been dropped.
    pub async fn run(self: Arc<Self>, mut triggers: mpsc::Receiver<SyncTrigger>) {
        let mut sync_timer = tokio::time::interval(self.config.sync_interval());

        loop {
            tokio::select! {
                _ = sync_timer.tick() => {
                    self.run_cycle(SyncTrigger::Full).await;
                }
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => self.run_cycle(trigger).await,
                    None => {
                        info!("Sync trigger channel closed, stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self, trigger: SyncTrigger) {
        let result = match trigger {
            SyncTrigger::Push => self.push().await.map(|_| ()),
            SyncTrigger::Pull => self.pull().await.map(|_| ()),
            SyncTrigger::Full => self.sync_once().await.map(|_| ()),
        };

        if let Err(e) = result {
            match e.category() {
                ErrorCategory::Connectivity => {
                    warn!(?trigger, error = %e, "Sync failed, mutations stay queued");
                }
                _ => error!(?trigger, error = %e, "Sync failed"),
            }
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        let limit = self.config.request_timeout();
        tokio::time::timeout(limit, call)
            .await
            .map_err(|_| SyncError::Timeout(limit))?
    }
}
