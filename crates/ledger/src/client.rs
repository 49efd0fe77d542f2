use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

/// Payload for creating a batch on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBatchDraft {
    pub name: String,
    /// Creation is idempotent per lot code.
    pub lot_code: String,
    /// Hash of the Collection notes, see [`notes_hash`].
    pub notes_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateReceipt {
    pub chain_id: u64,
    pub tx_hash: String,
}

/// A confirmed batch as the ledger sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBatch {
    pub chain_id: u64,
    pub name: String,
    pub lot_code: String,
    pub notes_hash: String,
    pub tx_hash: String,
}

/// A confirmed decision entry for one phase of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainPhaseEntry {
    pub chain_id: u64,
    pub phase_index: u8,
    /// 1 = approved, 2 = rejected.
    pub decision_code: u8,
    pub notes_hash: String,
    pub tx_hash: String,
}

/// Answer of a ledger read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum LedgerRead<T> {
    Confirmed(T),
    /// Known to the ledger but not yet confirmed.
    Pending,
    NotFound,
}

impl<T> LedgerRead<T> {
    pub fn confirmed(self) -> Option<T> {
        match self {
            LedgerRead::Confirmed(value) => Some(value),
            LedgerRead::Pending | LedgerRead::NotFound => None,
        }
    }
}

/// Lowercase hex SHA-256 of a notes text, as stored on the ledger.
pub fn notes_hash(notes: &str) -> String {
    hex::encode(Sha256::digest(notes.as_bytes()))
}

/// Client for the external immutable ledger.
///
/// Implementations must make `create_on_ledger` idempotent per lot code and
/// `append_phase_on_ledger` idempotent per `(chain_id, phase_index)` when the
/// same decision and notes hash are re-sent. Reads never fail with
/// `Rejected`; a missing batch is `LedgerRead::NotFound`.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
    /// Acquire connection and signing keys.
    async fn connect(&self) -> Result<(), LedgerError>;

    async fn create_on_ledger(&self, draft: &ChainBatchDraft)
        -> Result<CreateReceipt, LedgerError>;

    /// Returns the transaction hash of the appended entry.
    async fn append_phase_on_ledger(
        &self,
        chain_id: u64,
        phase_index: u8,
        decision_code: u8,
        notes_hash: &str,
    ) -> Result<String, LedgerError>;

    async fn read_batch(&self, chain_id: u64) -> Result<LedgerRead<ChainBatch>, LedgerError>;

    async fn read_phase(
        &self,
        chain_id: u64,
        phase_index: u8,
    ) -> Result<LedgerRead<ChainPhaseEntry>, LedgerError>;

    /// All confirmed phase entries of a batch in phase order.
    async fn read_full_history(
        &self,
        chain_id: u64,
    ) -> Result<LedgerRead<Vec<ChainPhaseEntry>>, LedgerError>;
}
