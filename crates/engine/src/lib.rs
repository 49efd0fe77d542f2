//! lotline-engine: the custody workflow over a [`RecordStore`] and a
//! [`LedgerClient`].
//!
//! - [`PhaseStateMachine`] creates batches and records phase decisions
//!   transactionally, one winner per phase
//! - [`LedgerSync`] mirrors committed changes to the ledger with bounded
//!   retries and idempotent confirmation
//! - [`TraceabilityReader`] answers lot lookups and cross-checks the
//!   store against the ledger
//!
//! [`RecordStore`]: lotline_storage::RecordStore
//! [`LedgerClient`]: lotline_ledger::LedgerClient

pub mod capture;
pub mod config;
pub mod error;
pub mod machine;
pub mod reader;
pub mod sync;

pub use capture::{CaptureError, OpenMeteoCapture, ProvenanceCapture, StaticCapture};
pub use config::{read_engine_config, EngineConfig};
pub use error::EngineError;
pub use machine::{
    CreateBatchRequest, CreatedBatch, DecisionOutcome, DecisionRequest, PhaseStateMachine,
};
pub use reader::{
    ActorActivity, ChainStatus, CrossCheck, HandlerInfo, PhaseCheck, StatusSummary, Trace,
    TraceEntry, TraceabilityReader,
};
pub use sync::{
    compute_backoff_delay, LedgerSync, ReconcilerHandle, RetryPolicy, SyncPass,
    UnconfirmedReport,
};
