//! The phase state machine.
//!
//! Every transition is one storage snapshot: lock the batch row, re-check
//! phase and status, write the phase record, move the batch with a
//! version-checked update, and enqueue the ledger mirror. Ledger calls
//! happen only after commit, through [`LedgerSync`].

use std::sync::Arc;
use std::time::Duration;

use lotline_core::{
    transition, CollectionDetails, Decision, Evidence, FieldIssue, Fingerprint, Phase, Status,
};
use lotline_ledger::LedgerClient;
use lotline_storage::{
    Actor, BatchRecord, LedgerTaskKind, NewBatch, NewPhaseRecord, PhaseRecord, RecordStore,
    StorageError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::capture::{self, ProvenanceCapture};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::reader::TraceabilityReader;
use crate::sync::{LedgerSync, ReconcilerHandle, RetryPolicy, UnconfirmedReport};

/// Input for [`PhaseStateMachine::create_batch`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBatchRequest {
    pub name: String,
    pub lot_code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub details: CollectionDetails,
    pub notes: String,
    #[serde(default)]
    pub evidence: Evidence,
}

#[derive(Debug, Clone)]
pub struct CreatedBatch {
    pub batch: BatchRecord,
    /// The pending Collection placeholder.
    pub record: PhaseRecord,
    /// Verification artifact keyed by `batch.batch_id`.
    pub fingerprint: Fingerprint,
}

/// Input for [`PhaseStateMachine::submit_decision`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub batch_id: String,
    pub actor_id: String,
    /// The phase the actor believes they are deciding.
    pub actor_phase: Phase,
    pub decision: Decision,
    pub notes: String,
    #[serde(default)]
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    pub record: PhaseRecord,
    /// The batch as committed by this decision.
    pub batch: BatchRecord,
    /// Evidence readings that could not be captured.
    pub evidence_warnings: Vec<String>,
}

pub struct PhaseStateMachine<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
    sync: Arc<LedgerSync<S, L>>,
    capture: Option<Arc<dyn ProvenanceCapture>>,
    capture_timeout: Duration,
    reconciler_interval: Duration,
    reconciler: Mutex<Option<ReconcilerHandle>>,
}

impl<S: RecordStore, L: LedgerClient> PhaseStateMachine<S, L> {
    pub fn new(store: S, ledger: L, config: &EngineConfig) -> Self {
        let store = Arc::new(store);
        let ledger = Arc::new(ledger);
        let sync = Arc::new(LedgerSync::new(
            store.clone(),
            ledger.clone(),
            RetryPolicy::from(&config.retry),
            config.reconciler.batch_limit,
        ));
        PhaseStateMachine {
            store,
            ledger,
            sync,
            capture: None,
            capture_timeout: config.capture.timeout(),
            reconciler_interval: config.reconciler.interval(),
            reconciler: Mutex::new(None),
        }
    }

    /// Fill missing location and weather evidence from `capture`.
    pub fn with_capture(mut self, capture: Arc<dyn ProvenanceCapture>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn sync(&self) -> &Arc<LedgerSync<S, L>> {
        &self.sync
    }

    pub fn reader(&self) -> TraceabilityReader<S, L> {
        TraceabilityReader::new(self.store.clone(), self.ledger.clone())
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Connect to the ledger and start the background reconciler.
    ///
    /// An unreachable ledger is not fatal: transitions still commit and
    /// their mirrors wait in the outbox.
    pub async fn init(&self) -> Result<(), EngineError> {
        if let Err(e) = self.ready().await {
            tracing::warn!(error = %e, "ledger not reachable at startup, writes will queue");
        }
        let mut reconciler = self.reconciler.lock().await;
        if reconciler.is_none() {
            *reconciler = Some(self.sync.clone().spawn(self.reconciler_interval));
        }
        Ok(())
    }

    /// Whether the ledger accepts connections right now. Custody does not
    /// depend on it; only mirroring does.
    pub async fn ready(&self) -> Result<(), EngineError> {
        self.ledger
            .connect()
            .await
            .map_err(|e| EngineError::LedgerUnavailable(e.to_string()))
    }

    /// Stop the reconciler after a final flush of due ledger work.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let handle = self.reconciler.lock().await.take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => {
                self.sync.flush().await?;
            }
        }
        Ok(())
    }

    // ── Actors ───────────────────────────────────────────────────────────────

    pub async fn register_actor(&self, actor: Actor) -> Result<(), EngineError> {
        let mut issues = Vec::new();
        if actor.actor_id.trim().is_empty() {
            issues.push(FieldIssue::new("actor_id", "required"));
        }
        if !actor.email.contains('@') {
            issues.push(FieldIssue::new("email", "must be an email address"));
        }
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }
        tracing::info!(actor_id = %actor.actor_id, role = %actor.role, "actor registered");
        self.store.upsert_actor(actor).await?;
        Ok(())
    }

    async fn require_actor(&self, actor_id: &str, phase: Phase) -> Result<Actor, EngineError> {
        let actor = match self.store.get_actor(actor_id).await {
            Ok(actor) => actor,
            Err(StorageError::ActorNotFound { .. }) => {
                return Err(EngineError::invalid("actor_id", "unknown actor"));
            }
            Err(e) => return Err(e.into()),
        };
        if actor.role != phase {
            return Err(EngineError::invalid(
                "actor_id",
                format!("actor acts for {}, not {phase}", actor.role),
            ));
        }
        Ok(actor)
    }

    async fn capture_evidence(&self, evidence: Evidence) -> (Evidence, Vec<String>) {
        match &self.capture {
            Some(source) => {
                let outcome = capture::gather(source.as_ref(), self.capture_timeout, evidence).await;
                let warnings: Vec<String> =
                    outcome.warnings.iter().map(ToString::to_string).collect();
                (outcome.evidence, warnings)
            }
            None => (evidence, Vec::new()),
        }
    }

    // ── Transitions ──────────────────────────────────────────────────────────

    /// Create a batch at `Collection/Pending` with a pending placeholder
    /// record carrying the collector's notes and details.
    ///
    /// The Collection phase is decided afterwards through
    /// [`submit_decision`](Self::submit_decision) like any other phase.
    pub async fn create_batch(
        &self,
        actor_id: &str,
        request: CreateBatchRequest,
    ) -> Result<CreatedBatch, EngineError> {
        let mut issues = Vec::new();
        if request.name.trim().is_empty() {
            issues.push(FieldIssue::new("name", "required"));
        }
        if request.lot_code.trim().is_empty() {
            issues.push(FieldIssue::new("lot_code", "required"));
        }
        if request.notes.trim().is_empty() {
            issues.push(FieldIssue::new("notes", "required"));
        }
        let details = match request.details.validated() {
            Ok(details) => Some(details),
            Err(detail_issues) => {
                issues.extend(detail_issues);
                None
            }
        };
        issues.extend(request.evidence.validate(Phase::Collection));
        let details = match details {
            Some(details) if issues.is_empty() => details,
            _ => return Err(EngineError::Validation(issues)),
        };

        self.require_actor(actor_id, Phase::Collection).await?;
        let (evidence, warnings) = self.capture_evidence(request.evidence).await;

        let new_batch = NewBatch {
            name: request.name.trim().to_string(),
            lot_code: request.lot_code.trim().to_string(),
            description: request.description,
            created_by: actor_id.to_string(),
        };
        let mut snapshot = self.store.begin_snapshot().await?;
        let written = self
            .write_creation(&mut snapshot, new_batch, actor_id, request.notes, evidence, details)
            .await;
        let (batch, record) = match written {
            Ok(rows) => rows,
            Err(e) => {
                let _ = self.store.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        self.store.commit_snapshot(snapshot).await?;

        tracing::info!(
            batch_id = %batch.batch_id,
            lot_code = %batch.lot_code,
            actor_id,
            evidence_warnings = warnings.len(),
            "batch created"
        );
        self.sync.notify();

        let fingerprint = Fingerprint::generate(&batch.batch_id);
        Ok(CreatedBatch {
            batch,
            record,
            fingerprint,
        })
    }

    async fn write_creation(
        &self,
        snapshot: &mut S::Snapshot,
        new_batch: NewBatch,
        actor_id: &str,
        notes: String,
        evidence: Evidence,
        details: CollectionDetails,
    ) -> Result<(BatchRecord, PhaseRecord), EngineError> {
        let batch = self.store.insert_batch(snapshot, new_batch).await?;
        let record = self
            .store
            .insert_phase_record(
                snapshot,
                NewPhaseRecord {
                    batch_id: batch.batch_id.clone(),
                    phase: Phase::Collection,
                    handler_id: actor_id.to_string(),
                    decision: None,
                    notes,
                    evidence,
                    details: Some(details),
                },
            )
            .await?;
        self.store
            .insert_ledger_task(
                snapshot,
                LedgerTaskKind::CreateBatch {
                    batch_id: batch.batch_id.clone(),
                },
            )
            .await?;
        Ok((batch, record))
    }

    /// Decide the batch's current phase.
    ///
    /// Fails with `StaleState` when the batch is no longer at `actor_phase`
    /// with status `Pending`; of two racing decisions exactly one commits.
    /// Evidence capture failures are reported in the outcome, never as an
    /// error.
    pub async fn submit_decision(
        &self,
        request: DecisionRequest,
    ) -> Result<DecisionOutcome, EngineError> {
        let mut issues = Vec::new();
        if request.notes.trim().is_empty() {
            issues.push(FieldIssue::new("notes", "required"));
        }
        issues.extend(request.evidence.validate(request.actor_phase));
        if !issues.is_empty() {
            return Err(EngineError::Validation(issues));
        }
        self.require_actor(&request.actor_id, request.actor_phase)
            .await?;

        // Fail fast before spending time on capture; the snapshot re-checks.
        let current = self.store.get_batch(&request.batch_id).await?;
        ensure_decidable(&current, request.actor_phase)?;

        let (evidence, evidence_warnings) = self.capture_evidence(request.evidence).await;

        let mut snapshot = self.store.begin_snapshot().await?;
        let written = self
            .write_decision(
                &mut snapshot,
                &request.batch_id,
                &request.actor_id,
                request.actor_phase,
                request.decision,
                request.notes,
                evidence,
            )
            .await;
        let record = match written {
            Ok(record) => record,
            Err(e) => {
                let _ = self.store.abort_snapshot(snapshot).await;
                return Err(e);
            }
        };
        self.store.commit_snapshot(snapshot).await?;

        let batch = self.store.get_batch(&request.batch_id).await?;
        tracing::info!(
            batch_id = %batch.batch_id,
            record_id = record.id,
            phase = %request.actor_phase,
            decision = %request.decision,
            next_phase = %batch.current_phase,
            status = %batch.status,
            "decision recorded"
        );
        self.sync.notify();

        Ok(DecisionOutcome {
            record,
            batch,
            evidence_warnings,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn write_decision(
        &self,
        snapshot: &mut S::Snapshot,
        batch_id: &str,
        actor_id: &str,
        phase: Phase,
        decision: Decision,
        notes: String,
        evidence: Evidence,
    ) -> Result<PhaseRecord, EngineError> {
        let batch = self.store.get_batch_for_update(snapshot, batch_id).await?;
        ensure_decidable(&batch, phase)?;

        let (next_phase, next_status) = transition(phase, decision);
        if next_phase < batch.current_phase {
            return Err(EngineError::Consistency(format!(
                "transition would move batch {batch_id} back from {} to {next_phase}",
                batch.current_phase
            )));
        }

        let record = self
            .store
            .insert_phase_record(
                snapshot,
                NewPhaseRecord {
                    batch_id: batch_id.to_string(),
                    phase,
                    handler_id: actor_id.to_string(),
                    decision: Some(decision),
                    notes,
                    evidence,
                    details: None,
                },
            )
            .await?;
        self.store
            .update_batch_state(snapshot, batch_id, batch.version, next_phase, next_status)
            .await?;
        self.store
            .insert_ledger_task(
                snapshot,
                LedgerTaskKind::AppendPhase {
                    batch_id: batch_id.to_string(),
                    record_id: record.id,
                },
            )
            .await?;
        Ok(record)
    }

    // ── Ledger confirmations ─────────────────────────────────────────────────

    /// Attach a ledger transaction hash to a decided record.
    ///
    /// Repeating the same hash is a no-op; a different hash for an already
    /// confirmed record is a `Consistency` error.
    pub async fn confirm_ledger_write(
        &self,
        record_id: i64,
        tx_hash: &str,
    ) -> Result<(), EngineError> {
        if tx_hash.trim().is_empty() {
            return Err(EngineError::invalid("tx_hash", "required"));
        }
        self.sync.confirm_record(record_id, tx_hash).await
    }

    /// Attach the ledger's batch id. Same idempotency rules as
    /// [`confirm_ledger_write`](Self::confirm_ledger_write).
    pub async fn confirm_batch_on_ledger(
        &self,
        batch_id: &str,
        chain_id: u64,
    ) -> Result<(), EngineError> {
        self.store.get_batch(batch_id).await?;
        self.sync.confirm_batch(batch_id, chain_id).await
    }

    /// Retry a batch's given-up ledger writes, e.g. after an outage ends.
    pub async fn retry_ledger_writes(&self, batch_id: &str) -> Result<usize, EngineError> {
        self.store.get_batch(batch_id).await?;
        self.sync.rearm(batch_id).await
    }

    pub async fn unconfirmed_report(&self) -> Result<UnconfirmedReport, EngineError> {
        self.sync.unconfirmed_report().await
    }
}

fn ensure_decidable(batch: &BatchRecord, phase: Phase) -> Result<(), EngineError> {
    if batch.current_phase != phase {
        return Err(EngineError::StaleState(format!(
            "batch {} is at {}, not {phase}",
            batch.batch_id, batch.current_phase
        )));
    }
    if batch.status != Status::Pending {
        return Err(EngineError::StaleState(format!(
            "batch {} is already {} at {phase}",
            batch.batch_id, batch.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotline_ledger::MemoryLedger;
    use lotline_storage::MemoryStore;

    fn machine() -> PhaseStateMachine<MemoryStore, MemoryLedger> {
        PhaseStateMachine::new(MemoryStore::new(), MemoryLedger::new(), &EngineConfig::default())
    }

    fn collector() -> Actor {
        Actor {
            actor_id: "col-1".to_string(),
            display_name: Some("Field Collector".to_string()),
            email: "collector@example.com".to_string(),
            role: Phase::Collection,
            organization: None,
        }
    }

    fn request(lot_code: &str) -> CreateBatchRequest {
        CreateBatchRequest {
            name: "Cacao".to_string(),
            lot_code: lot_code.to_string(),
            description: None,
            details: CollectionDetails {
                harvest_date: Some("2025-02-14".to_string()),
                material_name: Some("Cacao pods".to_string()),
                ..CollectionDetails::default()
            },
            notes: "picked at dawn".to_string(),
            evidence: Evidence::default(),
        }
    }

    #[test]
    fn decidable_only_at_current_pending_phase() {
        let batch = BatchRecord {
            batch_id: "b".to_string(),
            chain_id: None,
            name: "n".to_string(),
            lot_code: "l".to_string(),
            description: None,
            current_phase: Phase::Testing,
            status: Status::Pending,
            version: 1,
            created_by: "c".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(ensure_decidable(&batch, Phase::Testing).is_ok());
        assert!(matches!(
            ensure_decidable(&batch, Phase::Collection),
            Err(EngineError::StaleState(_))
        ));
        let rejected = BatchRecord {
            status: Status::Rejected,
            ..batch
        };
        assert!(matches!(
            ensure_decidable(&rejected, Phase::Testing),
            Err(EngineError::StaleState(_))
        ));
    }

    #[tokio::test]
    async fn create_collects_every_validation_issue() {
        let m = machine();
        m.register_actor(collector()).await.unwrap();
        let mut bad = request(" ");
        bad.notes = String::new();
        bad.details.harvest_date = Some("14/02/2025".to_string());
        match m.create_batch("col-1", bad).await {
            Err(EngineError::Validation(issues)) => {
                let fields: Vec<&str> = issues.iter().map(|i| i.field.as_str()).collect();
                assert!(fields.contains(&"lot_code"), "{fields:?}");
                assert!(fields.contains(&"notes"), "{fields:?}");
                assert!(fields.contains(&"harvest_date"), "{fields:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
        assert!(m.store().list_batches(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_requires_a_collection_actor() {
        let m = machine();
        let err = m.create_batch("ghost", request("L-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let mut tester = collector();
        tester.actor_id = "lab-1".to_string();
        tester.role = Phase::Testing;
        m.register_actor(tester).await.unwrap();
        let err = m.create_batch("lab-1", request("L-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn create_writes_placeholder_and_fingerprint() {
        let m = machine();
        m.register_actor(collector()).await.unwrap();
        let created = m.create_batch("col-1", request("L-1")).await.unwrap();
        assert_eq!(created.batch.current_phase, Phase::Collection);
        assert_eq!(created.batch.status, Status::Pending);
        assert!(created.record.decision.is_none());
        assert!(created.record.details.is_some());
        assert_eq!(created.fingerprint, Fingerprint::generate(&created.batch.batch_id));
    }

    #[tokio::test]
    async fn duplicate_lot_code_is_a_conflict() {
        let m = machine();
        m.register_actor(collector()).await.unwrap();
        m.create_batch("col-1", request("L-1")).await.unwrap();
        let err = m.create_batch("col-1", request("L-1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)), "{err:?}");
    }

    #[tokio::test]
    async fn register_actor_validates() {
        let m = machine();
        let mut actor = collector();
        actor.email = "nope".to_string();
        assert!(matches!(
            m.register_actor(actor).await,
            Err(EngineError::Validation(_))
        ));
    }
}
