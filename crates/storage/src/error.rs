use lotline_core::Phase;

/// All errors that can be returned by a RecordStore implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict: another transaction moved
    /// the batch first. The expected version was not found.
    #[error("concurrent conflict on batch {batch_id}: expected version {expected_version}")]
    ConcurrentConflict {
        batch_id: String,
        expected_version: i64,
    },

    /// No batch row with the given id.
    #[error("batch not found: {batch_id}")]
    BatchNotFound { batch_id: String },

    /// No phase record with the given id.
    #[error("phase record not found: {record_id}")]
    RecordNotFound { record_id: i64 },

    /// No ledger task with the given id.
    #[error("ledger task not found: {task_id}")]
    TaskNotFound { task_id: i64 },

    /// No actor with the given id.
    #[error("actor not found: {actor_id}")]
    ActorNotFound { actor_id: String },

    /// Unique constraint on `lot_code` violated.
    #[error("lot code already in use: {lot_code}")]
    DuplicateLotCode { lot_code: String },

    /// Unique constraint on `(batch_id, phase)` for decided records violated.
    #[error("phase {phase} of batch {batch_id} already has a decision")]
    DuplicateDecision { batch_id: String, phase: Phase },

    /// A backend-specific storage error (connection, serialization, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}
