//! Ledger synchronization.
//!
//! Relational transitions enqueue ledger tasks in the same snapshot as the
//! change they mirror. [`LedgerSync`] drains those tasks after commit:
//! creations first (they carry the `chain_id` every append needs), then
//! appends in task order. Retryable failures back off; permanent failures
//! and exhausted retries leave the work chain-unconfirmed and visible in
//! [`LedgerSync::unconfirmed_report`]. Nothing here touches batch phase or
//! status.

use std::sync::Arc;
use std::time::Duration;

use lotline_core::Phase;
use lotline_ledger::{notes_hash, ChainBatchDraft, LedgerClient, LedgerError, LedgerRead};
use lotline_storage::{
    ConfirmOutcome, LedgerTask, LedgerTaskKind, LedgerTaskState, RecordStore, TaskFilter,
    TaskUpdate,
};
use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::RetryConfig;
use crate::error::EngineError;

/// Backoff policy for ledger writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

/// Delay before the next attempt after `failures` failed attempts (1-based).
///
/// `base * multiplier^(failures-1)`, capped at `max_delay`, then scaled by
/// a random factor in `[0.5, 1.5)` when jitter is on.
pub fn compute_backoff_delay(policy: &RetryPolicy, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent);
    let capped = raw.min(policy.max_delay.as_secs_f64());
    let scaled = if policy.jitter && capped > 0.0 {
        capped * rand::thread_rng().gen_range(0.5..1.5)
    } else {
        capped
    };
    Duration::from_secs_f64(scaled.max(0.0))
}

pub(crate) fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncPass {
    pub confirmed: usize,
    pub retried: usize,
    pub deferred: usize,
    pub exhausted: usize,
}

impl SyncPass {
    fn absorb(&mut self, step: Step) {
        match step {
            Step::Confirmed => self.confirmed += 1,
            Step::Retried => self.retried += 1,
            Step::Deferred => self.deferred += 1,
            Step::Exhausted => self.exhausted += 1,
        }
    }
}

enum Step {
    Confirmed,
    Retried,
    Deferred,
    Exhausted,
}

/// Chain-unconfirmed work, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnconfirmedReport {
    /// Still being retried.
    pub pending: Vec<LedgerTask>,
    /// Given up on; needs operator attention.
    pub exhausted: Vec<LedgerTask>,
}

pub struct LedgerSync<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    policy: RetryPolicy,
    batch_limit: usize,
    wake: Notify,
}

impl<S: RecordStore, L: LedgerClient> LedgerSync<S, L> {
    pub fn new(store: Arc<S>, ledger: Arc<L>, policy: RetryPolicy, batch_limit: usize) -> Self {
        LedgerSync {
            store,
            ledger,
            policy,
            batch_limit,
            wake: Notify::new(),
        }
    }

    /// Ask a running reconciler to start a pass now.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Process every due pending task once.
    pub async fn run_once(&self) -> Result<SyncPass, EngineError> {
        let now = now_ms();
        let tasks = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Pending),
                due_at_ms: Some(now),
                batch_id: None,
                limit: self.batch_limit,
            })
            .await?;

        let mut pass = SyncPass::default();
        for task in tasks {
            let step = match &task.kind {
                LedgerTaskKind::CreateBatch { batch_id } => self.sync_create(&task, batch_id).await?,
                LedgerTaskKind::AppendPhase {
                    batch_id,
                    record_id,
                } => self.sync_append(&task, batch_id, *record_id).await?,
            };
            pass.absorb(step);
        }
        if pass != SyncPass::default() {
            tracing::debug!(
                confirmed = pass.confirmed,
                retried = pass.retried,
                deferred = pass.deferred,
                exhausted = pass.exhausted,
                "ledger sync pass"
            );
        }
        Ok(pass)
    }

    /// Run passes until one confirms nothing.
    pub async fn flush(&self) -> Result<SyncPass, EngineError> {
        let mut total = SyncPass::default();
        loop {
            let pass = self.run_once().await?;
            total.confirmed += pass.confirmed;
            total.retried += pass.retried;
            total.deferred += pass.deferred;
            total.exhausted += pass.exhausted;
            if pass.confirmed == 0 {
                return Ok(total);
            }
        }
    }

    async fn sync_create(&self, task: &LedgerTask, batch_id: &str) -> Result<Step, EngineError> {
        let batch = self.store.get_batch(batch_id).await?;
        if batch.chain_id.is_some() {
            self.finish(task, LedgerTaskState::Confirmed, None).await?;
            return Ok(Step::Confirmed);
        }

        let notes = self
            .store
            .list_phase_records(batch_id)
            .await?
            .into_iter()
            .find(|r| r.phase == Phase::Collection && r.decision.is_none())
            .map(|r| r.notes)
            .unwrap_or_default();
        let draft = ChainBatchDraft {
            name: batch.name.clone(),
            lot_code: batch.lot_code.clone(),
            notes_hash: notes_hash(&notes),
        };

        match self.ledger.create_on_ledger(&draft).await {
            Ok(receipt) => match self.confirm_batch(batch_id, receipt.chain_id).await {
                Ok(()) => Ok(Step::Confirmed),
                Err(EngineError::Consistency(msg)) => {
                    self.finish(task, LedgerTaskState::Exhausted, Some(msg)).await?;
                    Ok(Step::Exhausted)
                }
                Err(e) => Err(e),
            },
            Err(e) => self.fail(task, e).await,
        }
    }

    async fn sync_append(
        &self,
        task: &LedgerTask,
        batch_id: &str,
        record_id: i64,
    ) -> Result<Step, EngineError> {
        let batch = self.store.get_batch(batch_id).await?;
        let Some(chain_id) = batch.chain_id else {
            return self.defer(task, batch_id, "waiting for ledger batch id").await;
        };

        let record = self.store.get_phase_record(record_id).await?;
        if record.chain_tx_hash.is_some() {
            self.finish(task, LedgerTaskState::Confirmed, None).await?;
            return Ok(Step::Confirmed);
        }
        let Some(decision) = record.decision else {
            self.finish(
                task,
                LedgerTaskState::Exhausted,
                Some("record carries no decision".to_string()),
            )
            .await?;
            return Ok(Step::Exhausted);
        };
        let phase_index = record.phase.index();
        if let Some(previous) = phase_index.checked_sub(1).and_then(Phase::from_index) {
            let previous_confirmed = self
                .store
                .list_phase_records(batch_id)
                .await?
                .iter()
                .any(|r| r.phase == previous && r.decision.is_some() && r.chain_tx_hash.is_some());
            if !previous_confirmed {
                return self
                    .defer(task, batch_id, "waiting for the previous phase entry")
                    .await;
            }
        }
        let code = decision.ledger_code();
        let hash = notes_hash(&record.notes);

        // An earlier attempt may have landed after reporting a timeout.
        let tx_hash = match self.ledger.read_phase(chain_id, phase_index).await {
            Ok(LedgerRead::Confirmed(entry)) => {
                if entry.decision_code != code || entry.notes_hash != hash {
                    let msg = format!(
                        "ledger holds a different entry for phase {} of chain batch {chain_id}",
                        record.phase
                    );
                    tracing::error!(record_id, chain_id, "{msg}");
                    self.finish(task, LedgerTaskState::Exhausted, Some(msg)).await?;
                    return Ok(Step::Exhausted);
                }
                tracing::info!(record_id, chain_id, "adopting existing ledger entry");
                entry.tx_hash
            }
            Ok(LedgerRead::Pending) => {
                return self
                    .fail(task, LedgerError::Timeout("entry awaiting confirmation".to_string()))
                    .await;
            }
            Ok(LedgerRead::NotFound) => {
                match self
                    .ledger
                    .append_phase_on_ledger(chain_id, phase_index, code, &hash)
                    .await
                {
                    Ok(tx_hash) => tx_hash,
                    Err(e) => return self.fail(task, e).await,
                }
            }
            Err(e) => return self.fail(task, e).await,
        };

        match self.confirm_record(record_id, &tx_hash).await {
            Ok(()) => Ok(Step::Confirmed),
            Err(EngineError::Consistency(msg)) => {
                self.finish(task, LedgerTaskState::Exhausted, Some(msg)).await?;
                Ok(Step::Exhausted)
            }
            Err(e) => Err(e),
        }
    }

    /// Appends wait for the mirrors before them without spending attempts,
    /// unless one of those was given up on.
    async fn defer(
        &self,
        task: &LedgerTask,
        batch_id: &str,
        reason: &str,
    ) -> Result<Step, EngineError> {
        let blocked = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Exhausted),
                batch_id: Some(batch_id.to_string()),
                ..TaskFilter::default()
            })
            .await?
            .iter()
            .any(|t| t.id < task.id);
        if blocked {
            self.finish(
                task,
                LedgerTaskState::Exhausted,
                Some("an earlier ledger write of this batch was given up on".to_string()),
            )
            .await?;
            return Ok(Step::Exhausted);
        }

        self.store
            .update_ledger_task(
                task.id,
                TaskUpdate {
                    state: LedgerTaskState::Pending,
                    attempts: task.attempts,
                    next_attempt_at_ms: now_ms() + self.policy.base_delay.as_millis() as i64,
                    last_error: Some(reason.to_string()),
                },
            )
            .await?;
        Ok(Step::Deferred)
    }

    async fn fail(&self, task: &LedgerTask, err: LedgerError) -> Result<Step, EngineError> {
        let attempts = task.attempts + 1;
        let batch_id = task.kind.batch_id();

        if err.is_retryable() && attempts < self.policy.max_attempts {
            let delay = compute_backoff_delay(&self.policy, attempts);
            tracing::warn!(
                task_id = task.id,
                batch_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "ledger write failed, will retry"
            );
            self.store
                .update_ledger_task(
                    task.id,
                    TaskUpdate {
                        state: LedgerTaskState::Pending,
                        attempts,
                        next_attempt_at_ms: now_ms() + delay.as_millis() as i64,
                        last_error: Some(err.to_string()),
                    },
                )
                .await?;
            return Ok(Step::Retried);
        }

        tracing::error!(
            task_id = task.id,
            batch_id,
            attempts,
            error = %err,
            "chain_unconfirmed: giving up on ledger write"
        );
        self.store
            .update_ledger_task(
                task.id,
                TaskUpdate {
                    state: LedgerTaskState::Exhausted,
                    attempts,
                    next_attempt_at_ms: task.next_attempt_at_ms,
                    last_error: Some(err.to_string()),
                },
            )
            .await?;
        self.exhaust_dependents(task).await?;
        Ok(Step::Exhausted)
    }

    /// Later mirrors of the same batch cannot land once `failed` is given up.
    async fn exhaust_dependents(&self, failed: &LedgerTask) -> Result<(), EngineError> {
        let pending = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Pending),
                batch_id: Some(failed.kind.batch_id().to_string()),
                ..TaskFilter::default()
            })
            .await?;
        for task in pending.iter().filter(|t| t.id > failed.id) {
            self.finish(
                task,
                LedgerTaskState::Exhausted,
                Some("an earlier ledger write of this batch was given up on".to_string()),
            )
            .await?;
        }
        Ok(())
    }

    async fn finish(
        &self,
        task: &LedgerTask,
        state: LedgerTaskState,
        last_error: Option<String>,
    ) -> Result<(), EngineError> {
        self.store
            .update_ledger_task(
                task.id,
                TaskUpdate {
                    state,
                    attempts: task.attempts,
                    next_attempt_at_ms: task.next_attempt_at_ms,
                    last_error: last_error.or_else(|| task.last_error.clone()),
                },
            )
            .await?;
        Ok(())
    }

    async fn close_tasks(
        &self,
        batch_id: &str,
        matches: impl Fn(&LedgerTaskKind) -> bool,
    ) -> Result<(), EngineError> {
        let tasks = self
            .store
            .list_ledger_tasks(TaskFilter {
                batch_id: Some(batch_id.to_string()),
                ..TaskFilter::default()
            })
            .await?;
        for task in tasks {
            if task.state != LedgerTaskState::Confirmed && matches(&task.kind) {
                self.finish(&task, LedgerTaskState::Confirmed, None).await?;
            }
        }
        Ok(())
    }

    /// Put a batch's exhausted ledger work back in the queue with a fresh
    /// attempt budget. Returns how many tasks were re-armed.
    pub async fn rearm(&self, batch_id: &str) -> Result<usize, EngineError> {
        let exhausted = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Exhausted),
                batch_id: Some(batch_id.to_string()),
                ..TaskFilter::default()
            })
            .await?;
        let now = now_ms();
        for task in &exhausted {
            self.store
                .update_ledger_task(
                    task.id,
                    TaskUpdate {
                        state: LedgerTaskState::Pending,
                        attempts: 0,
                        next_attempt_at_ms: now,
                        last_error: task.last_error.clone(),
                    },
                )
                .await?;
        }
        if !exhausted.is_empty() {
            tracing::info!(batch_id, tasks = exhausted.len(), "exhausted ledger work re-armed");
            self.notify();
        }
        Ok(exhausted.len())
    }

    /// Record a ledger transaction hash on a phase record.
    ///
    /// Idempotent for the same hash. A different hash for an already
    /// confirmed record is a `Consistency` error and changes nothing.
    pub async fn confirm_record(&self, record_id: i64, tx_hash: &str) -> Result<(), EngineError> {
        let record = self.store.get_phase_record(record_id).await?;
        if record.decision.is_none() {
            return Err(EngineError::invalid(
                "record_id",
                "pending placeholders are not mirrored to the ledger",
            ));
        }
        match self.store.set_record_tx_hash(record_id, tx_hash).await? {
            ConfirmOutcome::Applied => {
                tracing::info!(record_id, batch_id = %record.batch_id, tx_hash, "phase record confirmed on ledger");
            }
            ConfirmOutcome::Unchanged => {}
            ConfirmOutcome::Mismatch { existing } => {
                tracing::error!(
                    record_id,
                    existing = %existing,
                    received = tx_hash,
                    "conflicting ledger confirmation"
                );
                return Err(EngineError::Consistency(format!(
                    "record {record_id} is already confirmed with {existing}, got {tx_hash}"
                )));
            }
        }
        self.close_tasks(&record.batch_id, |kind| {
            matches!(kind, LedgerTaskKind::AppendPhase { record_id: id, .. } if *id == record_id)
        })
        .await?;
        self.notify();
        Ok(())
    }

    /// Record the ledger's id for a batch. Same idempotency rules as
    /// [`confirm_record`](Self::confirm_record).
    pub async fn confirm_batch(&self, batch_id: &str, chain_id: u64) -> Result<(), EngineError> {
        match self.store.set_batch_chain_id(batch_id, chain_id).await? {
            ConfirmOutcome::Applied => {
                tracing::info!(batch_id, chain_id, "batch created on ledger");
            }
            ConfirmOutcome::Unchanged => {}
            ConfirmOutcome::Mismatch { existing } => {
                tracing::error!(batch_id, existing, received = chain_id, "conflicting ledger batch id");
                return Err(EngineError::Consistency(format!(
                    "batch {batch_id} already has ledger id {existing}, got {chain_id}"
                )));
            }
        }
        self.close_tasks(batch_id, |kind| {
            matches!(kind, LedgerTaskKind::CreateBatch { .. })
        })
        .await?;
        // Appends waiting on this id can go now.
        self.notify();
        Ok(())
    }

    pub async fn unconfirmed_report(&self) -> Result<UnconfirmedReport, EngineError> {
        let pending = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Pending),
                ..TaskFilter::default()
            })
            .await?;
        let exhausted = self
            .store
            .list_ledger_tasks(TaskFilter {
                state: Some(LedgerTaskState::Exhausted),
                ..TaskFilter::default()
            })
            .await?;
        Ok(UnconfirmedReport { pending, exhausted })
    }

    /// Start the background reconciler.
    ///
    /// The loop wakes on the interval or on [`notify`](Self::notify), and
    /// runs a final [`flush`](Self::flush) when shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let handle = tokio::spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "ledger reconciler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = self.wake.notified() => {}
                    _ = shutdown_rx.recv() => {
                        tracing::info!("reconciler shutdown requested");
                        break;
                    }
                }
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "ledger sync pass failed");
                }
            }

            match self.flush().await {
                Ok(pass) => tracing::info!(
                    confirmed = pass.confirmed,
                    pending = pass.retried + pass.deferred,
                    "ledger reconciler stopped"
                ),
                Err(e) => tracing::error!(error = %e, "final ledger flush failed"),
            }
        });
        ReconcilerHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }
}

/// Handle to a running reconciler.
pub struct ReconcilerHandle {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop the loop after its final flush and wait for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "reconciler task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: bool) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = policy(false);
        assert_eq!(compute_backoff_delay(&p, 1), Duration::from_millis(500));
        assert_eq!(compute_backoff_delay(&p, 2), Duration::from_secs(1));
        assert_eq!(compute_backoff_delay(&p, 3), Duration::from_secs(2));
        assert_eq!(compute_backoff_delay(&p, 10), Duration::from_secs(4));
    }

    #[test]
    fn jitter_stays_within_half_to_one_and_a_half() {
        let p = policy(true);
        for _ in 0..100 {
            let d = compute_backoff_delay(&p, 2);
            assert!(d >= Duration::from_millis(500) && d < Duration::from_millis(1500), "{d:?}");
        }
    }

    #[test]
    fn zero_base_delay_retries_immediately() {
        let p = RetryPolicy {
            base_delay: Duration::ZERO,
            ..policy(true)
        };
        assert_eq!(compute_backoff_delay(&p, 3), Duration::ZERO);
    }

    #[test]
    fn policy_from_config() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.base_delay, Duration::from_millis(500));
        assert_eq!(p.max_delay, Duration::from_secs(30));
    }
}
