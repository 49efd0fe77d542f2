//! Read side: public lot lookup, worklists, and ledger cross-checks.

use std::collections::HashMap;
use std::sync::Arc;

use lotline_core::{is_terminal_state, Phase, Status};
use lotline_ledger::{notes_hash, ChainPhaseEntry, LedgerClient, LedgerRead};
use lotline_storage::{Actor, BatchRecord, PhaseRecord, RecordStore, StorageError};
use serde::Serialize;

use crate::error::EngineError;

/// Public handler details shown next to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerInfo {
    /// Display name, falling back to the email address.
    pub name: String,
    pub email: String,
    pub organization: Option<String>,
}

impl From<Actor> for HandlerInfo {
    fn from(actor: Actor) -> Self {
        let name = actor
            .display_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| actor.email.clone());
        HandlerInfo {
            name,
            email: actor.email,
            organization: actor.organization,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEntry {
    #[serde(flatten)]
    pub record: PhaseRecord,
    /// `None` when the handler is no longer registered.
    pub handler: Option<HandlerInfo>,
}

/// A batch and its full history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Trace {
    pub batch: BatchRecord,
    pub terminal: bool,
    /// Oldest first.
    pub entries: Vec<TraceEntry>,
}

impl Trace {
    /// Decided records that carry no ledger transaction hash yet.
    pub fn unconfirmed_record_ids(&self) -> Vec<i64> {
        self.entries
            .iter()
            .filter(|e| e.record.decision.is_some() && e.record.chain_tx_hash.is_none())
            .map(|e| e.record.id)
            .collect()
    }
}

/// How one record compares with the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChainStatus {
    Confirmed { tx_hash: String },
    /// The ledger has the write but has not confirmed it.
    Pending,
    /// The batch itself is not on the ledger yet.
    AwaitingBatch,
    /// The ledger has no entry for this phase.
    Missing,
    Mismatch { detail: String },
    Unavailable { error: String },
    /// Pending placeholder; never mirrored.
    NotMirrored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseCheck {
    pub record_id: i64,
    pub phase: Phase,
    pub status: ChainStatus,
}

/// Store history compared entry by entry with the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossCheck {
    pub trace: Trace,
    pub phases: Vec<PhaseCheck>,
    /// Decided records without a confirmed ledger hash.
    pub unconfirmed: Vec<i64>,
    /// Disagreements between store and ledger. Empty when consistent.
    pub discrepancies: Vec<String>,
    pub ledger_reachable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
}

/// How much custody work an actor has done. Collectors are credited with
/// the batches they created; every other role with the decisions it made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActorActivity {
    pub actor_id: String,
    pub role: Phase,
    pub count: usize,
}

pub struct TraceabilityReader<S, L> {
    store: Arc<S>,
    ledger: Arc<L>,
}

impl<S, L> Clone for TraceabilityReader<S, L> {
    fn clone(&self) -> Self {
        TraceabilityReader {
            store: self.store.clone(),
            ledger: self.ledger.clone(),
        }
    }
}

impl<S: RecordStore, L: LedgerClient> TraceabilityReader<S, L> {
    pub fn new(store: Arc<S>, ledger: Arc<L>) -> Self {
        TraceabilityReader { store, ledger }
    }

    /// Look a batch up by lot code.
    ///
    /// `Ok(None)` means no such lot. A found batch always has a trace, even
    /// when its history is empty.
    pub async fn lookup(&self, lot_code: &str) -> Result<Option<Trace>, EngineError> {
        let lot_code = lot_code.trim();
        if lot_code.is_empty() {
            return Ok(None);
        }
        match self.store.find_batch_by_lot_code(lot_code).await? {
            Some(batch) => Ok(Some(self.trace(batch).await?)),
            None => Ok(None),
        }
    }

    pub async fn lookup_batch(&self, batch_id: &str) -> Result<Option<Trace>, EngineError> {
        match self.store.get_batch(batch_id).await {
            Ok(batch) => Ok(Some(self.trace(batch).await?)),
            Err(StorageError::BatchNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn trace(&self, batch: BatchRecord) -> Result<Trace, EngineError> {
        let records = self.store.list_phase_records(&batch.batch_id).await?;
        let mut handlers: HashMap<String, Option<HandlerInfo>> = HashMap::new();
        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            if !handlers.contains_key(&record.handler_id) {
                let info = match self.store.get_actor(&record.handler_id).await {
                    Ok(actor) => Some(HandlerInfo::from(actor)),
                    Err(StorageError::ActorNotFound { .. }) => None,
                    Err(e) => return Err(e.into()),
                };
                handlers.insert(record.handler_id.clone(), info);
            }
            let handler = handlers.get(&record.handler_id).cloned().flatten();
            entries.push(TraceEntry { record, handler });
        }
        Ok(Trace {
            terminal: is_terminal_state(batch.current_phase, batch.status),
            batch,
            entries,
        })
    }

    /// Batches waiting for a decision at `phase`, oldest first.
    pub async fn worklist(&self, phase: Phase) -> Result<Vec<BatchRecord>, EngineError> {
        Ok(self
            .store
            .list_batches(Some(phase), Some(Status::Pending))
            .await?)
    }

    pub async fn status_summary(&self, phase: Option<Phase>) -> Result<StatusSummary, EngineError> {
        let batches = self.store.list_batches(phase, None).await?;
        let mut summary = StatusSummary {
            total: batches.len(),
            ..StatusSummary::default()
        };
        for batch in &batches {
            match batch.status {
                Status::Pending => summary.pending += 1,
                Status::Approved => summary.approved += 1,
                Status::Rejected => summary.rejected += 1,
            }
        }
        Ok(summary)
    }

    pub async fn actor_activity(&self, actor_id: &str) -> Result<ActorActivity, EngineError> {
        let actor = self.store.get_actor(actor_id).await?;
        let batches = self.store.list_batches(None, None).await?;
        let count = if actor.role == Phase::Collection {
            batches.iter().filter(|b| b.created_by == actor.actor_id).count()
        } else {
            let mut handled = 0;
            for batch in &batches {
                handled += self
                    .store
                    .list_phase_records(&batch.batch_id)
                    .await?
                    .iter()
                    .filter(|r| r.decision.is_some() && r.handler_id == actor.actor_id)
                    .count();
            }
            handled
        };
        Ok(ActorActivity {
            actor_id: actor.actor_id,
            role: actor.role,
            count,
        })
    }

    /// Compare a lot's store history with the ledger.
    pub async fn cross_check(&self, lot_code: &str) -> Result<Option<CrossCheck>, EngineError> {
        let Some(trace) = self.lookup(lot_code).await? else {
            return Ok(None);
        };

        let mut discrepancies = Vec::new();
        let mut ledger_reachable = true;
        let chain_entries: Option<Vec<ChainPhaseEntry>> = match trace.batch.chain_id {
            None => None,
            Some(chain_id) => match self.ledger.read_full_history(chain_id).await {
                Ok(LedgerRead::Confirmed(entries)) => Some(entries),
                Ok(LedgerRead::Pending) => Some(Vec::new()),
                Ok(LedgerRead::NotFound) => {
                    discrepancies.push(format!(
                        "store holds chain id {chain_id} but the ledger has no such batch"
                    ));
                    Some(Vec::new())
                }
                Err(e) => {
                    tracing::warn!(lot_code, chain_id, error = %e, "ledger unreachable during cross-check");
                    ledger_reachable = false;
                    None
                }
            },
        };

        let mut phases = Vec::with_capacity(trace.entries.len());
        for entry in &trace.entries {
            let record = &entry.record;
            let status = match (record.decision, &chain_entries) {
                (None, _) => ChainStatus::NotMirrored,
                (Some(_), None) if !ledger_reachable => ChainStatus::Unavailable {
                    error: "ledger unreachable".to_string(),
                },
                (Some(_), None) => ChainStatus::AwaitingBatch,
                (Some(decision), Some(chain)) => {
                    match chain.iter().find(|c| c.phase_index == record.phase.index()) {
                        None if record.chain_tx_hash.is_some() => {
                            discrepancies.push(format!(
                                "{} decision has tx {} but no ledger entry",
                                record.phase,
                                record.chain_tx_hash.as_deref().unwrap_or_default()
                            ));
                            ChainStatus::Missing
                        }
                        None => ChainStatus::Pending,
                        Some(found) => {
                            let expected_hash = notes_hash(&record.notes);
                            if found.decision_code != decision.ledger_code()
                                || found.notes_hash != expected_hash
                            {
                                let detail = format!(
                                    "store has {decision} at {}, ledger has code {}",
                                    record.phase, found.decision_code
                                );
                                discrepancies.push(detail.clone());
                                ChainStatus::Mismatch { detail }
                            } else if let Some(stored) = record
                                .chain_tx_hash
                                .as_deref()
                                .filter(|h| *h != found.tx_hash)
                            {
                                let detail = format!(
                                    "store has tx {stored} at {}, ledger has tx {}",
                                    record.phase, found.tx_hash
                                );
                                discrepancies.push(detail.clone());
                                ChainStatus::Mismatch { detail }
                            } else {
                                ChainStatus::Confirmed {
                                    tx_hash: found.tx_hash.clone(),
                                }
                            }
                        }
                    }
                }
            };
            phases.push(PhaseCheck {
                record_id: record.id,
                phase: record.phase,
                status,
            });
        }

        if let Some(chain) = &chain_entries {
            for found in chain {
                let decided = trace.entries.iter().any(|e| {
                    e.record.decision.is_some() && e.record.phase.index() == found.phase_index
                });
                if !decided {
                    discrepancies.push(format!(
                        "ledger has an entry for phase index {} the store never decided",
                        found.phase_index
                    ));
                }
            }
        }

        Ok(Some(CrossCheck {
            unconfirmed: trace.unconfirmed_record_ids(),
            trace,
            phases,
            discrepancies,
            ledger_reachable,
        }))
    }
}
