//! In-memory `RecordStore` backend.
//!
//! Snapshots are serialized: `begin_snapshot` takes an owned lock on the
//! tables and holds it until commit or abort, so every transaction sees
//! committed data only and a `get_batch_for_update` read is a true row
//! lock. Writes are applied in place and recorded in an undo log that is
//! replayed on abort or when the snapshot is dropped uncommitted.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use lotline_core::{Phase, Status};
use time::macros::format_description;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::StorageError;
use crate::record::{
    Actor, BatchRecord, ConfirmOutcome, LedgerTask, LedgerTaskKind, LedgerTaskState, NewBatch,
    NewPhaseRecord, PhaseRecord, TaskFilter, TaskUpdate,
};
use crate::traits::RecordStore;

#[derive(Default)]
struct Tables {
    batches: HashMap<String, BatchRecord>,
    /// Creation sequence per batch, for stable listing order.
    batch_seq: HashMap<String, u64>,
    lot_index: HashMap<String, String>,
    records: BTreeMap<i64, PhaseRecord>,
    /// `(batch_id, phase)` pairs that already carry a decision.
    decided: HashSet<(String, Phase)>,
    tasks: BTreeMap<i64, LedgerTask>,
    actors: HashMap<String, Actor>,
    next_batch_seq: u64,
    next_record_id: i64,
    next_task_id: i64,
}

enum Undo {
    Batch {
        batch_id: String,
        previous: Option<BatchRecord>,
    },
    Record(i64),
    Task(i64),
}

/// Transaction handle for [`MemoryStore`].
pub struct MemorySnapshot {
    tables: OwnedMutexGuard<Tables>,
    undo: Vec<Undo>,
    open: bool,
}

impl MemorySnapshot {
    fn rollback(&mut self) {
        while let Some(step) = self.undo.pop() {
            match step {
                Undo::Batch {
                    batch_id,
                    previous: Some(previous),
                } => {
                    self.tables.batches.insert(batch_id, previous);
                }
                Undo::Batch {
                    batch_id,
                    previous: None,
                } => {
                    if let Some(batch) = self.tables.batches.remove(&batch_id) {
                        self.tables.lot_index.remove(&batch.lot_code);
                    }
                    self.tables.batch_seq.remove(&batch_id);
                }
                Undo::Record(id) => {
                    if let Some(record) = self.tables.records.remove(&id) {
                        if record.decision.is_some() {
                            self.tables.decided.remove(&(record.batch_id, record.phase));
                        }
                    }
                }
                Undo::Task(id) => {
                    self.tables.tasks.remove(&id);
                }
            }
        }
        self.open = false;
    }
}

impl Drop for MemorySnapshot {
    fn drop(&mut self) {
        if self.open {
            self.rollback();
        }
    }
}

/// Process-local store. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Current UTC time as fixed-width RFC 3339 with milliseconds, so string
/// order matches time order.
pub fn timestamp_now() -> String {
    let format =
        format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");
    time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000Z".to_string())
}

fn batch_not_found(batch_id: &str) -> StorageError {
    StorageError::BatchNotFound {
        batch_id: batch_id.to_string(),
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    type Snapshot = MemorySnapshot;

    async fn begin_snapshot(&self) -> Result<MemorySnapshot, StorageError> {
        let tables = self.tables.clone().lock_owned().await;
        Ok(MemorySnapshot {
            tables,
            undo: Vec::new(),
            open: true,
        })
    }

    async fn commit_snapshot(&self, mut snapshot: MemorySnapshot) -> Result<(), StorageError> {
        snapshot.undo.clear();
        snapshot.open = false;
        Ok(())
    }

    async fn abort_snapshot(&self, mut snapshot: MemorySnapshot) -> Result<(), StorageError> {
        snapshot.rollback();
        Ok(())
    }

    async fn insert_batch(
        &self,
        snapshot: &mut MemorySnapshot,
        batch: NewBatch,
    ) -> Result<BatchRecord, StorageError> {
        if snapshot.tables.lot_index.contains_key(&batch.lot_code) {
            return Err(StorageError::DuplicateLotCode {
                lot_code: batch.lot_code,
            });
        }
        let now = timestamp_now();
        let record = BatchRecord {
            batch_id: uuid::Uuid::new_v4().to_string(),
            chain_id: None,
            name: batch.name,
            lot_code: batch.lot_code,
            description: batch.description,
            current_phase: Phase::Collection,
            status: Status::Pending,
            version: 0,
            created_by: batch.created_by,
            created_at: now.clone(),
            updated_at: now,
        };

        let tables = &mut *snapshot.tables;
        let seq = tables.next_batch_seq;
        tables.next_batch_seq += 1;
        tables.batch_seq.insert(record.batch_id.clone(), seq);
        tables
            .lot_index
            .insert(record.lot_code.clone(), record.batch_id.clone());
        tables
            .batches
            .insert(record.batch_id.clone(), record.clone());
        snapshot.undo.push(Undo::Batch {
            batch_id: record.batch_id.clone(),
            previous: None,
        });
        Ok(record)
    }

    async fn get_batch_for_update(
        &self,
        snapshot: &mut MemorySnapshot,
        batch_id: &str,
    ) -> Result<BatchRecord, StorageError> {
        snapshot
            .tables
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| batch_not_found(batch_id))
    }

    async fn update_batch_state(
        &self,
        snapshot: &mut MemorySnapshot,
        batch_id: &str,
        expected_version: i64,
        new_phase: Phase,
        new_status: Status,
    ) -> Result<i64, StorageError> {
        let batch = snapshot
            .tables
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| batch_not_found(batch_id))?;
        if batch.version != expected_version {
            return Err(StorageError::ConcurrentConflict {
                batch_id: batch_id.to_string(),
                expected_version,
            });
        }
        let previous = batch.clone();
        batch.current_phase = new_phase;
        batch.status = new_status;
        batch.version += 1;
        batch.updated_at = timestamp_now();
        let version = batch.version;
        snapshot.undo.push(Undo::Batch {
            batch_id: batch_id.to_string(),
            previous: Some(previous),
        });
        Ok(version)
    }

    async fn insert_phase_record(
        &self,
        snapshot: &mut MemorySnapshot,
        record: NewPhaseRecord,
    ) -> Result<PhaseRecord, StorageError> {
        let tables = &mut *snapshot.tables;
        if !tables.batches.contains_key(&record.batch_id) {
            return Err(batch_not_found(&record.batch_id));
        }
        if record.decision.is_some()
            && !tables
                .decided
                .insert((record.batch_id.clone(), record.phase))
        {
            return Err(StorageError::DuplicateDecision {
                batch_id: record.batch_id,
                phase: record.phase,
            });
        }

        tables.next_record_id += 1;
        let stored = PhaseRecord {
            id: tables.next_record_id,
            batch_id: record.batch_id,
            phase: record.phase,
            handler_id: record.handler_id,
            decision: record.decision,
            notes: record.notes,
            evidence: record.evidence,
            details: record.details,
            chain_tx_hash: None,
            created_at: timestamp_now(),
        };
        tables.records.insert(stored.id, stored.clone());
        snapshot.undo.push(Undo::Record(stored.id));
        Ok(stored)
    }

    async fn insert_ledger_task(
        &self,
        snapshot: &mut MemorySnapshot,
        kind: LedgerTaskKind,
    ) -> Result<LedgerTask, StorageError> {
        let tables = &mut *snapshot.tables;
        if !tables.batches.contains_key(kind.batch_id()) {
            return Err(batch_not_found(kind.batch_id()));
        }
        tables.next_task_id += 1;
        let task = LedgerTask {
            id: tables.next_task_id,
            kind,
            state: LedgerTaskState::Pending,
            attempts: 0,
            next_attempt_at_ms: 0,
            last_error: None,
            created_at: timestamp_now(),
        };
        tables.tasks.insert(task.id, task.clone());
        snapshot.undo.push(Undo::Task(task.id));
        Ok(task)
    }

    async fn set_batch_chain_id(
        &self,
        batch_id: &str,
        chain_id: u64,
    ) -> Result<ConfirmOutcome<u64>, StorageError> {
        let mut tables = self.tables.lock().await;
        let batch = tables
            .batches
            .get_mut(batch_id)
            .ok_or_else(|| batch_not_found(batch_id))?;
        Ok(match batch.chain_id {
            None => {
                batch.chain_id = Some(chain_id);
                ConfirmOutcome::Applied
            }
            Some(existing) if existing == chain_id => ConfirmOutcome::Unchanged,
            Some(existing) => ConfirmOutcome::Mismatch { existing },
        })
    }

    async fn set_record_tx_hash(
        &self,
        record_id: i64,
        tx_hash: &str,
    ) -> Result<ConfirmOutcome<String>, StorageError> {
        let mut tables = self.tables.lock().await;
        let record = tables
            .records
            .get_mut(&record_id)
            .ok_or(StorageError::RecordNotFound { record_id })?;
        Ok(match &record.chain_tx_hash {
            None => {
                record.chain_tx_hash = Some(tx_hash.to_string());
                ConfirmOutcome::Applied
            }
            Some(existing) if existing == tx_hash => ConfirmOutcome::Unchanged,
            Some(existing) => ConfirmOutcome::Mismatch {
                existing: existing.clone(),
            },
        })
    }

    async fn update_ledger_task(
        &self,
        task_id: i64,
        update: TaskUpdate,
    ) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        let task = tables
            .tasks
            .get_mut(&task_id)
            .ok_or(StorageError::TaskNotFound { task_id })?;
        task.state = update.state;
        task.attempts = update.attempts;
        task.next_attempt_at_ms = update.next_attempt_at_ms;
        task.last_error = update.last_error;
        Ok(())
    }

    async fn upsert_actor(&self, actor: Actor) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().await;
        tables.actors.insert(actor.actor_id.clone(), actor);
        Ok(())
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchRecord, StorageError> {
        let tables = self.tables.lock().await;
        tables
            .batches
            .get(batch_id)
            .cloned()
            .ok_or_else(|| batch_not_found(batch_id))
    }

    async fn find_batch_by_lot_code(
        &self,
        lot_code: &str,
    ) -> Result<Option<BatchRecord>, StorageError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .lot_index
            .get(lot_code)
            .and_then(|id| tables.batches.get(id))
            .cloned())
    }

    async fn list_batches(
        &self,
        phase: Option<Phase>,
        status: Option<Status>,
    ) -> Result<Vec<BatchRecord>, StorageError> {
        let tables = self.tables.lock().await;
        let mut batches: Vec<&BatchRecord> = tables
            .batches
            .values()
            .filter(|b| phase.map_or(true, |p| b.current_phase == p))
            .filter(|b| status.map_or(true, |s| b.status == s))
            .collect();
        batches.sort_by_key(|b| tables.batch_seq.get(&b.batch_id).copied());
        Ok(batches.into_iter().cloned().collect())
    }

    async fn list_phase_records(&self, batch_id: &str) -> Result<Vec<PhaseRecord>, StorageError> {
        let tables = self.tables.lock().await;
        let mut records: Vec<PhaseRecord> = tables
            .records
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn get_phase_record(&self, record_id: i64) -> Result<PhaseRecord, StorageError> {
        let tables = self.tables.lock().await;
        tables
            .records
            .get(&record_id)
            .cloned()
            .ok_or(StorageError::RecordNotFound { record_id })
    }

    async fn get_actor(&self, actor_id: &str) -> Result<Actor, StorageError> {
        let tables = self.tables.lock().await;
        tables
            .actors
            .get(actor_id)
            .cloned()
            .ok_or_else(|| StorageError::ActorNotFound {
                actor_id: actor_id.to_string(),
            })
    }

    async fn list_ledger_tasks(&self, filter: TaskFilter) -> Result<Vec<LedgerTask>, StorageError> {
        let tables = self.tables.lock().await;
        let matching = tables
            .tasks
            .values()
            .filter(|t| filter.state.map_or(true, |s| t.state == s))
            .filter(|t| filter.due_at_ms.map_or(true, |due| t.next_attempt_at_ms <= due))
            .filter(|t| {
                filter
                    .batch_id
                    .as_deref()
                    .map_or(true, |id| t.kind.batch_id() == id)
            })
            .cloned();
        Ok(if filter.limit == 0 {
            matching.collect()
        } else {
            matching.take(filter.limit).collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotline_core::{Decision, Evidence};

    fn new_batch(lot_code: &str) -> NewBatch {
        NewBatch {
            name: "Green coffee".to_string(),
            lot_code: lot_code.to_string(),
            description: None,
            created_by: "collector-1".to_string(),
        }
    }

    fn decided(batch_id: &str, phase: Phase) -> NewPhaseRecord {
        NewPhaseRecord {
            batch_id: batch_id.to_string(),
            phase,
            handler_id: "h".to_string(),
            decision: Some(Decision::Approved),
            notes: "ok".to_string(),
            evidence: Evidence::default(),
            details: None,
        }
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let ts = timestamp_now();
        assert_eq!(ts.len(), "2024-01-01T00:00:00.000Z".len());
        assert!(ts.ends_with('Z'));
    }

    #[tokio::test]
    async fn dropped_snapshot_rolls_back() {
        let store = MemoryStore::new();
        {
            let mut snap = store.begin_snapshot().await.unwrap();
            store.insert_batch(&mut snap, new_batch("L-1")).await.unwrap();
            // dropped without commit
        }
        assert!(store.find_batch_by_lot_code("L-1").await.unwrap().is_none());
        assert!(store.list_batches(None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_releases_decision_slot() {
        let store = MemoryStore::new();
        let mut snap = store.begin_snapshot().await.unwrap();
        let batch = store.insert_batch(&mut snap, new_batch("L-2")).await.unwrap();
        store.commit_snapshot(snap).await.unwrap();

        let mut snap = store.begin_snapshot().await.unwrap();
        store
            .insert_phase_record(&mut snap, decided(&batch.batch_id, Phase::Collection))
            .await
            .unwrap();
        store.abort_snapshot(snap).await.unwrap();

        let mut snap = store.begin_snapshot().await.unwrap();
        store
            .insert_phase_record(&mut snap, decided(&batch.batch_id, Phase::Collection))
            .await
            .unwrap();
        store.commit_snapshot(snap).await.unwrap();
        assert_eq!(store.list_phase_records(&batch.batch_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_batches_keeps_creation_order() {
        let store = MemoryStore::new();
        let mut snap = store.begin_snapshot().await.unwrap();
        for i in 0..5 {
            store
                .insert_batch(&mut snap, new_batch(&format!("L-{i}")))
                .await
                .unwrap();
        }
        store.commit_snapshot(snap).await.unwrap();
        let lots: Vec<String> = store
            .list_batches(None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.lot_code)
            .collect();
        assert_eq!(lots, vec!["L-0", "L-1", "L-2", "L-3", "L-4"]);
    }
}
