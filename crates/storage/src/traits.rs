use async_trait::async_trait;
use lotline_core::{Phase, Status};

use crate::error::StorageError;
use crate::record::{
    Actor, BatchRecord, ConfirmOutcome, LedgerTask, LedgerTaskKind, NewBatch, NewPhaseRecord,
    PhaseRecord, TaskFilter, TaskUpdate,
};

/// The storage trait for Lotline record backends.
///
/// A `RecordStore` provides durable, transactional storage for batches,
/// phase records, registered actors, and the ledger outbox.
///
/// ## Snapshot Semantics
///
/// All mutating operations that belong to a state transition take
/// `&mut Self::Snapshot`, a type representing an in-progress transaction.
/// The lifecycle is:
///
/// 1. `begin_snapshot()` - start a transaction, returns a `Snapshot`
/// 2. Call mutating methods with `&mut snapshot`
/// 3. `commit_snapshot(snapshot)` - commit and consume the transaction
///    OR `abort_snapshot(snapshot)` - roll back and consume the transaction
///
/// If a `Snapshot` is dropped without committing, the underlying transaction
/// MUST be rolled back.
///
/// Backends may serialize snapshots. Callers must not issue non-snapshot
/// calls against the same store while holding a snapshot.
///
/// ## OCC Conflict Detection
///
/// `update_batch_state` performs an optimistic concurrency check:
/// `UPDATE WHERE version = expected_version`. If zero rows are affected,
/// the method returns `Err(StorageError::ConcurrentConflict { ... })`.
///
/// ## Confirmation fields
///
/// `chain_id` and `chain_tx_hash` are written by single-row set-if-null
/// updates outside any snapshot. They are the only fields of a batch or
/// phase record that change after the owning transition commits.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// The snapshot (transaction) type used by this storage backend.
    type Snapshot: Send;

    // ── Snapshot lifecycle ────────────────────────────────────────────────────

    /// Begin a new snapshot (transaction).
    async fn begin_snapshot(&self) -> Result<Self::Snapshot, StorageError>;

    /// Commit a snapshot, making all mutations durable.
    async fn commit_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    /// Abort (roll back) a snapshot, discarding all mutations.
    async fn abort_snapshot(&self, snapshot: Self::Snapshot) -> Result<(), StorageError>;

    // ── Transition writes (within snapshot) ──────────────────────────────────

    /// Insert a batch at `Collection/Pending`, version 0.
    ///
    /// Returns `Err(StorageError::DuplicateLotCode)` if the lot code is taken.
    async fn insert_batch(
        &self,
        snapshot: &mut Self::Snapshot,
        batch: NewBatch,
    ) -> Result<BatchRecord, StorageError>;

    /// Read a batch, locking the row for update.
    ///
    /// Returns `Err(StorageError::BatchNotFound)` if the batch does not exist.
    async fn get_batch_for_update(
        &self,
        snapshot: &mut Self::Snapshot,
        batch_id: &str,
    ) -> Result<BatchRecord, StorageError>;

    /// Apply a version-validated UPDATE to a batch's phase and status (OCC).
    ///
    /// Returns the new version number on success.
    async fn update_batch_state(
        &self,
        snapshot: &mut Self::Snapshot,
        batch_id: &str,
        expected_version: i64,
        new_phase: Phase,
        new_status: Status,
    ) -> Result<i64, StorageError>;

    /// Insert a phase record.
    ///
    /// A record with a decision is unique per `(batch_id, phase)`; a second
    /// one returns `Err(StorageError::DuplicateDecision)`. Placeholders
    /// (no decision) are not constrained.
    async fn insert_phase_record(
        &self,
        snapshot: &mut Self::Snapshot,
        record: NewPhaseRecord,
    ) -> Result<PhaseRecord, StorageError>;

    /// Enqueue a ledger task in the same transaction as the change it mirrors.
    async fn insert_ledger_task(
        &self,
        snapshot: &mut Self::Snapshot,
        kind: LedgerTaskKind,
    ) -> Result<LedgerTask, StorageError>;

    // ── Single-row conditional updates (outside snapshot) ────────────────────

    /// Set `chain_id` on a batch if it is still null.
    async fn set_batch_chain_id(
        &self,
        batch_id: &str,
        chain_id: u64,
    ) -> Result<ConfirmOutcome<u64>, StorageError>;

    /// Set `chain_tx_hash` on a phase record if it is still null.
    async fn set_record_tx_hash(
        &self,
        record_id: i64,
        tx_hash: &str,
    ) -> Result<ConfirmOutcome<String>, StorageError>;

    /// Overwrite the mutable fields of a ledger task.
    async fn update_ledger_task(
        &self,
        task_id: i64,
        update: TaskUpdate,
    ) -> Result<(), StorageError>;

    /// Insert or replace an actor.
    async fn upsert_actor(&self, actor: Actor) -> Result<(), StorageError>;

    // ── Query operations (outside snapshot) ──────────────────────────────────

    /// Returns `Err(StorageError::BatchNotFound)` if the batch does not exist.
    async fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, StorageError>;

    /// `Ok(None)` when no batch carries the lot code.
    async fn find_batch_by_lot_code(
        &self,
        lot_code: &str,
    ) -> Result<Option<BatchRecord>, StorageError>;

    /// List batches, optionally filtered by phase and status, in creation order.
    async fn list_batches(
        &self,
        phase: Option<Phase>,
        status: Option<Status>,
    ) -> Result<Vec<BatchRecord>, StorageError>;

    /// All records of a batch ordered by `created_at`, then id.
    async fn list_phase_records(&self, batch_id: &str) -> Result<Vec<PhaseRecord>, StorageError>;

    /// Returns `Err(StorageError::RecordNotFound)` if the record does not exist.
    async fn get_phase_record(&self, record_id: i64) -> Result<PhaseRecord, StorageError>;

    /// Returns `Err(StorageError::ActorNotFound)` if the actor does not exist.
    async fn get_actor(&self, actor_id: &str) -> Result<Actor, StorageError>;

    /// List ledger tasks matching `filter`, ordered by id.
    async fn list_ledger_tasks(&self, filter: TaskFilter) -> Result<Vec<LedgerTask>, StorageError>;
}
