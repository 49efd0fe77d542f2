//! Application state.

use lotline_engine::{PhaseStateMachine, TraceabilityReader};
use lotline_ledger::MemoryLedger;
use lotline_storage::MemoryStore;

pub(crate) type Machine = PhaseStateMachine<MemoryStore, MemoryLedger>;

/// Application state shared across request handlers.
pub(crate) struct AppState {
    pub(crate) machine: Machine,
    pub(crate) reader: TraceabilityReader<MemoryStore, MemoryLedger>,
    /// Optional API key for authentication. None = no auth required.
    pub(crate) api_key: Option<String>,
}

impl AppState {
    pub(crate) fn new(machine: Machine, api_key: Option<String>) -> Self {
        let reader = machine.reader();
        AppState {
            machine,
            reader,
            api_key,
        }
    }
}
