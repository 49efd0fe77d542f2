//! In-process ledger used by tests and the default server.
//!
//! Behaves like the contract the chain client is expected to provide:
//! creation is idempotent per lot code, each `(chain_id, phase)` holds at
//! most one entry, entries are appended in phase order and only after the
//! previous phase was approved. Faults and delayed confirmation can be
//! injected to exercise retry and reconciliation paths.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use lotline_core::{Decision, Phase};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::client::{
    ChainBatch, ChainBatchDraft, ChainPhaseEntry, CreateReceipt, LedgerClient, LedgerRead,
};
use crate::error::LedgerError;

struct Slot<T> {
    value: T,
    sealed: bool,
}

#[derive(Default)]
struct Chain {
    batches: BTreeMap<u64, Slot<ChainBatch>>,
    lot_index: HashMap<String, u64>,
    phases: BTreeMap<(u64, u8), Slot<ChainPhaseEntry>>,
    next_chain_id: u64,
    nonce: u64,
    /// Applied to the next writes, one per call.
    faults: VecDeque<LedgerError>,
    /// Applied to every call while set.
    outage: Option<LedgerError>,
    hold_confirmations: bool,
    writes: usize,
}

impl Chain {
    fn write_fault(&mut self) -> Option<LedgerError> {
        self.outage.clone().or_else(|| self.faults.pop_front())
    }

    fn read_fault(&self) -> Option<LedgerError> {
        self.outage.clone()
    }

    fn tx_hash(&mut self, payload: &str) -> String {
        self.nonce += 1;
        let digest = Sha256::digest(format!("{payload}:{}", self.nonce).as_bytes());
        format!("0x{}", hex::encode(digest))
    }

    /// Result of a write that was accepted but may not be confirmed yet.
    fn receipt<T>(&self, sealed: bool, value: T) -> Result<T, LedgerError> {
        if sealed {
            Ok(value)
        } else {
            Err(LedgerError::Timeout(
                "write submitted, confirmation pending".to_string(),
            ))
        }
    }
}

/// Shared in-memory ledger. Clones observe the same chain.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    chain: Arc<Mutex<Chain>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` writes with `error`.
    pub async fn fail_next(&self, count: usize, error: LedgerError) {
        let mut chain = self.chain.lock().await;
        chain
            .faults
            .extend(std::iter::repeat(error).take(count));
    }

    /// Fail every call, reads included, until cleared with `None`.
    pub async fn set_outage(&self, error: Option<LedgerError>) {
        self.chain.lock().await.outage = error;
    }

    /// While held, accepted writes stay unconfirmed and the writer gets a
    /// `Timeout`. Releasing confirms everything written in the meantime.
    pub async fn hold_confirmations(&self, hold: bool) {
        let mut chain = self.chain.lock().await;
        chain.hold_confirmations = hold;
        if !hold {
            for slot in chain.batches.values_mut() {
                slot.sealed = true;
            }
            for slot in chain.phases.values_mut() {
                slot.sealed = true;
            }
        }
    }

    /// Number of distinct writes accepted so far.
    pub async fn write_count(&self) -> usize {
        self.chain.lock().await.writes
    }

    pub async fn chain_id_for(&self, lot_code: &str) -> Option<u64> {
        self.chain.lock().await.lot_index.get(lot_code).copied()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn connect(&self) -> Result<(), LedgerError> {
        match self.chain.lock().await.read_fault() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_on_ledger(
        &self,
        draft: &ChainBatchDraft,
    ) -> Result<CreateReceipt, LedgerError> {
        let mut chain = self.chain.lock().await;
        if let Some(err) = chain.write_fault() {
            return Err(err);
        }
        if draft.lot_code.is_empty() {
            return Err(LedgerError::Rejected("empty lot code".to_string()));
        }

        if let Some(chain_id) = chain.lot_index.get(&draft.lot_code).copied() {
            let slot = chain
                .batches
                .get(&chain_id)
                .ok_or_else(|| LedgerError::Unavailable("lot index out of sync".to_string()))?;
            let receipt = CreateReceipt {
                chain_id,
                tx_hash: slot.value.tx_hash.clone(),
            };
            return chain.receipt(slot.sealed, receipt);
        }

        chain.next_chain_id += 1;
        let chain_id = chain.next_chain_id;
        let tx_hash = chain.tx_hash(&format!("create:{}", draft.lot_code));
        let sealed = !chain.hold_confirmations;
        chain.batches.insert(
            chain_id,
            Slot {
                value: ChainBatch {
                    chain_id,
                    name: draft.name.clone(),
                    lot_code: draft.lot_code.clone(),
                    notes_hash: draft.notes_hash.clone(),
                    tx_hash: tx_hash.clone(),
                },
                sealed,
            },
        );
        chain.lot_index.insert(draft.lot_code.clone(), chain_id);
        chain.writes += 1;
        chain.receipt(sealed, CreateReceipt { chain_id, tx_hash })
    }

    async fn append_phase_on_ledger(
        &self,
        chain_id: u64,
        phase_index: u8,
        decision_code: u8,
        notes_hash: &str,
    ) -> Result<String, LedgerError> {
        let mut chain = self.chain.lock().await;
        if let Some(err) = chain.write_fault() {
            return Err(err);
        }
        if Decision::from_ledger_code(decision_code).is_none() {
            return Err(LedgerError::Rejected(format!(
                "invalid decision code {decision_code}"
            )));
        }
        if Phase::from_index(phase_index).is_none() {
            return Err(LedgerError::Rejected(format!(
                "invalid phase index {phase_index}"
            )));
        }
        if !chain.batches.contains_key(&chain_id) {
            return Err(LedgerError::Rejected(format!("unknown chain id {chain_id}")));
        }

        if let Some(slot) = chain.phases.get(&(chain_id, phase_index)) {
            if slot.value.decision_code == decision_code && slot.value.notes_hash == notes_hash {
                return chain.receipt(slot.sealed, slot.value.tx_hash.clone());
            }
            return Err(LedgerError::Rejected(format!(
                "phase {phase_index} of batch {chain_id} already recorded"
            )));
        }

        if phase_index > 0 {
            let previous_approved = chain
                .phases
                .get(&(chain_id, phase_index - 1))
                .is_some_and(|slot| {
                    slot.value.decision_code == Decision::Approved.ledger_code()
                });
            if !previous_approved {
                return Err(LedgerError::Rejected(format!(
                    "phase {} of batch {chain_id} is not approved",
                    phase_index - 1
                )));
            }
        }

        let tx_hash = chain.tx_hash(&format!("append:{chain_id}:{phase_index}:{decision_code}"));
        let sealed = !chain.hold_confirmations;
        chain.phases.insert(
            (chain_id, phase_index),
            Slot {
                value: ChainPhaseEntry {
                    chain_id,
                    phase_index,
                    decision_code,
                    notes_hash: notes_hash.to_string(),
                    tx_hash: tx_hash.clone(),
                },
                sealed,
            },
        );
        chain.writes += 1;
        chain.receipt(sealed, tx_hash)
    }

    async fn read_batch(&self, chain_id: u64) -> Result<LedgerRead<ChainBatch>, LedgerError> {
        let chain = self.chain.lock().await;
        if let Some(err) = chain.read_fault() {
            return Err(err);
        }
        Ok(match chain.batches.get(&chain_id) {
            Some(slot) if slot.sealed => LedgerRead::Confirmed(slot.value.clone()),
            Some(_) => LedgerRead::Pending,
            None => LedgerRead::NotFound,
        })
    }

    async fn read_phase(
        &self,
        chain_id: u64,
        phase_index: u8,
    ) -> Result<LedgerRead<ChainPhaseEntry>, LedgerError> {
        let chain = self.chain.lock().await;
        if let Some(err) = chain.read_fault() {
            return Err(err);
        }
        Ok(match chain.phases.get(&(chain_id, phase_index)) {
            Some(slot) if slot.sealed => LedgerRead::Confirmed(slot.value.clone()),
            Some(_) => LedgerRead::Pending,
            None => LedgerRead::NotFound,
        })
    }

    async fn read_full_history(
        &self,
        chain_id: u64,
    ) -> Result<LedgerRead<Vec<ChainPhaseEntry>>, LedgerError> {
        let chain = self.chain.lock().await;
        if let Some(err) = chain.read_fault() {
            return Err(err);
        }
        match chain.batches.get(&chain_id) {
            None => Ok(LedgerRead::NotFound),
            Some(slot) if !slot.sealed => Ok(LedgerRead::Pending),
            Some(_) => Ok(LedgerRead::Confirmed(
                chain
                    .phases
                    .range((chain_id, 0)..=(chain_id, u8::MAX))
                    .filter(|(_, slot)| slot.sealed)
                    .map(|(_, slot)| slot.value.clone())
                    .collect(),
            )),
        }
    }
}
