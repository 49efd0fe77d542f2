//! Ledger mirror for Lotline.
//!
//! The ledger is an external append-only system of record. Each batch is
//! created once (keyed by lot code) and receives at most one decision entry
//! per phase, in phase order. Writes may be slow, ambiguous or fail; reads
//! distinguish "not yet confirmed" from "does not exist".

mod client;
mod error;
mod memory;

pub use client::{
    notes_hash, ChainBatch, ChainBatchDraft, ChainPhaseEntry, CreateReceipt, LedgerClient,
    LedgerRead,
};
pub use error::LedgerError;
pub use memory::MemoryLedger;
