use lotline_core::{CollectionDetails, Decision, Evidence, Phase, Status};
use serde::{Deserialize, Serialize};

/// The current relational view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Store-assigned, stable. Also the public fingerprint identifier.
    pub batch_id: String,
    /// Ledger handle, assigned once the ledger confirms creation.
    pub chain_id: Option<u64>,
    pub name: String,
    pub lot_code: String,
    pub description: Option<String>,
    pub current_phase: Phase,
    pub status: Status,
    /// Bumped on every state update; the CAS token for `update_batch_state`.
    pub version: i64,
    pub created_by: String,
    /// RFC 3339, millisecond precision.
    pub created_at: String,
    pub updated_at: String,
}

/// Insert payload for a batch. The store assigns id, version and timestamps.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub name: String,
    pub lot_code: String,
    pub description: Option<String>,
    pub created_by: String,
}

/// One immutable entry per decision (or pending placeholder) at a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub id: i64,
    pub batch_id: String,
    pub phase: Phase,
    pub handler_id: String,
    /// `None` for a pending placeholder.
    pub decision: Option<Decision>,
    pub notes: String,
    pub evidence: Evidence,
    /// Collection-phase details; `None` at other phases.
    pub details: Option<CollectionDetails>,
    /// Present once the ledger mirror is confirmed.
    pub chain_tx_hash: Option<String>,
    /// RFC 3339, millisecond precision.
    pub created_at: String,
}

/// Insert payload for a phase record.
#[derive(Debug, Clone)]
pub struct NewPhaseRecord {
    pub batch_id: String,
    pub phase: Phase,
    pub handler_id: String,
    pub decision: Option<Decision>,
    pub notes: String,
    pub evidence: Evidence,
    pub details: Option<CollectionDetails>,
}

/// A registered handler and the phase they act for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub display_name: Option<String>,
    pub email: String,
    pub role: Phase,
    pub organization: Option<String>,
}

/// What a ledger task mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerTaskKind {
    CreateBatch { batch_id: String },
    AppendPhase { batch_id: String, record_id: i64 },
}

impl LedgerTaskKind {
    pub fn batch_id(&self) -> &str {
        match self {
            LedgerTaskKind::CreateBatch { batch_id } => batch_id,
            LedgerTaskKind::AppendPhase { batch_id, .. } => batch_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTaskState {
    Pending,
    Confirmed,
    /// Retries used up; the mirror is left chain-unconfirmed.
    Exhausted,
}

/// Outbox row: a ledger write owed for a committed relational change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTask {
    pub id: i64,
    pub kind: LedgerTaskKind,
    pub state: LedgerTaskState,
    pub attempts: u32,
    /// Unix milliseconds before which the task is not retried.
    pub next_attempt_at_ms: i64,
    pub last_error: Option<String>,
    pub created_at: String,
}

/// New mutable fields of a ledger task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskUpdate {
    pub state: LedgerTaskState,
    pub attempts: u32,
    pub next_attempt_at_ms: i64,
    pub last_error: Option<String>,
}

/// Filter for listing ledger tasks. Results are ordered by task id.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<LedgerTaskState>,
    /// Only tasks with `next_attempt_at_ms <= due_at_ms`.
    pub due_at_ms: Option<i64>,
    pub batch_id: Option<String>,
    /// 0 = no limit.
    pub limit: usize,
}

/// Outcome of a set-if-null update of a ledger confirmation field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome<T> {
    /// The field was null and now holds the new value.
    Applied,
    /// The field already held the same value.
    Unchanged,
    /// The field already held a different value; nothing was written.
    Mismatch { existing: T },
}
