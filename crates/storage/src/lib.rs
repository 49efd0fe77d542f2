pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::{timestamp_now, MemorySnapshot, MemoryStore};
pub use record::{
    Actor, BatchRecord, ConfirmOutcome, LedgerTask, LedgerTaskKind, LedgerTaskState, NewBatch,
    NewPhaseRecord, PhaseRecord, TaskFilter, TaskUpdate,
};
pub use traits::RecordStore;
