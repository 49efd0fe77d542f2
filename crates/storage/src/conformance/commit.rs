//! Atomic commit conformance tests.
//!
//! A state transition writes the batch row, a phase record and an outbox
//! task in one snapshot. All of them become visible together.

use std::future::Future;

use lotline_core::{Decision, Phase, Status};

use super::{make_new_batch, make_record, seed_batch, TestResult};
use crate::{LedgerTaskKind, LedgerTaskState, RecordStore, StorageError, TaskFilter};

pub(super) async fn run_commit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "commit",
        "create_pipeline_all_committed",
        create_pipeline_all_committed(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "decision_pipeline_all_committed",
        decision_pipeline_all_committed(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "record_fields_preserved",
        record_fields_preserved(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "second_decision_same_phase_rejected",
        second_decision_same_phase_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "placeholders_do_not_claim_decision_slot",
        placeholders_do_not_claim_decision_slot(factory).await,
    ));
    results.push(TestResult::from_result(
        "commit",
        "records_listed_in_creation_order",
        records_listed_in_creation_order(factory).await,
    ));

    results
}

async fn create_pipeline_all_committed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let batch = storage
        .insert_batch(&mut snap, make_new_batch("LOT-1"))
        .await
        .map_err(|e| format!("insert batch: {e}"))?;
    storage
        .insert_phase_record(&mut snap, make_record(&batch.batch_id, Phase::Collection, None))
        .await
        .map_err(|e| format!("insert placeholder: {e}"))?;
    storage
        .insert_ledger_task(
            &mut snap,
            LedgerTaskKind::CreateBatch {
                batch_id: batch.batch_id.clone(),
            },
        )
        .await
        .map_err(|e| format!("insert task: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get batch: {e}"))?;
    let records = storage
        .list_phase_records(&batch.batch_id)
        .await
        .map_err(|e| format!("list records: {e}"))?;
    if records.len() != 1 || records[0].decision.is_some() {
        return Err(format!("expected one placeholder, got {records:?}"));
    }
    let tasks = storage
        .list_ledger_tasks(TaskFilter::default())
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    match tasks.as_slice() {
        [task]
            if task.state == LedgerTaskState::Pending
                && task.attempts == 0
                && task.kind
                    == (LedgerTaskKind::CreateBatch {
                        batch_id: batch.batch_id.clone(),
                    }) =>
        {
            Ok(())
        }
        other => Err(format!("expected one pending create task, got {other:?}")),
    }
}

async fn decision_pipeline_all_committed<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let locked = storage
        .get_batch_for_update(&mut snap, &batch.batch_id)
        .await
        .map_err(|e| format!("lock: {e}"))?;
    let record = storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
        )
        .await
        .map_err(|e| format!("insert record: {e}"))?;
    let version = storage
        .update_batch_state(
            &mut snap,
            &batch.batch_id,
            locked.version,
            Phase::Testing,
            Status::Pending,
        )
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .insert_ledger_task(
            &mut snap,
            LedgerTaskKind::AppendPhase {
                batch_id: batch.batch_id.clone(),
                record_id: record.id,
            },
        )
        .await
        .map_err(|e| format!("insert task: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.current_phase != Phase::Testing || after.version != version {
        return Err(format!("batch not advanced: {after:?}"));
    }
    let stored = storage
        .get_phase_record(record.id)
        .await
        .map_err(|e| format!("get record: {e}"))?;
    if stored != record {
        return Err(format!("record changed after commit: {stored:?}"));
    }
    let tasks = storage
        .list_ledger_tasks(TaskFilter {
            batch_id: Some(batch.batch_id.clone()),
            ..TaskFilter::default()
        })
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if tasks.len() != 1 {
        return Err(format!("expected 1 task, got {}", tasks.len()));
    }
    Ok(())
}

async fn record_fields_preserved<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let mut new_record = make_record(&batch.batch_id, Phase::Collection, Some(Decision::Rejected));
    new_record.notes = "moisture above threshold".to_string();
    new_record.evidence.test_results = Some(serde_json::json!({"moisture": 14.2}));

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let record = storage
        .insert_phase_record(&mut snap, new_record.clone())
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let stored = storage
        .get_phase_record(record.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.notes != new_record.notes
        || stored.decision != Some(Decision::Rejected)
        || stored.evidence != new_record.evidence
        || stored.handler_id != new_record.handler_id
        || stored.chain_tx_hash.is_some()
    {
        return Err(format!("fields not preserved: {stored:?}"));
    }
    if stored.created_at.is_empty() {
        return Err("created_at not set".to_string());
    }
    Ok(())
}

async fn second_decision_same_phase_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
        )
        .await
        .map_err(|e| format!("first: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin second: {e}"))?;
    let second = storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Rejected)),
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match second {
        Err(StorageError::DuplicateDecision { phase, .. }) if phase == Phase::Collection => Ok(()),
        other => Err(format!("expected DuplicateDecision, got {other:?}")),
    }
}

async fn placeholders_do_not_claim_decision_slot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .insert_phase_record(&mut snap, make_record(&batch.batch_id, Phase::Collection, None))
        .await
        .map_err(|e| format!("placeholder: {e}"))?;
    storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
        )
        .await
        .map_err(|e| format!("decision after placeholder: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn records_listed_in_creation_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    for phase in Phase::ALL {
        storage
            .insert_phase_record(
                &mut snap,
                make_record(&batch.batch_id, phase, Some(Decision::Approved)),
            )
            .await
            .map_err(|e| format!("insert {phase}: {e}"))?;
    }
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let phases: Vec<Phase> = storage
        .list_phase_records(&batch.batch_id)
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .map(|r| r.phase)
        .collect();
    if phases != Phase::ALL.to_vec() {
        return Err(format!("expected phase order, got {phases:?}"));
    }
    Ok(())
}
