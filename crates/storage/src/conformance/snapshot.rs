//! Snapshot lifecycle conformance tests.
//!
//! Verifies that committed writes are visible and that aborted or dropped
//! snapshots discard every write they made.

use std::future::Future;

use lotline_core::{Decision, Phase, Status};

use super::{make_new_batch, make_record, seed_batch, TestResult};
use crate::{LedgerTaskKind, RecordStore, StorageError, TaskFilter};

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "commit_empty_snapshot",
        commit_empty_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_new_batch",
        abort_discards_new_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "abort_discards_state_update",
        abort_discards_state_update(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "drop_discards_record_and_task",
        drop_discards_record_and_task(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "aborted_lot_code_is_reusable",
        aborted_lot_code_is_reusable(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "sequential_snapshots_see_prior_commits",
        sequential_snapshots_see_prior_commits(factory).await,
    ));

    results
}

async fn commit_empty_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn abort_discards_new_batch<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .insert_batch(&mut snap, make_new_batch("LOT-ABORT"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    match storage.get_batch(&batch.batch_id).await {
        Err(StorageError::BatchNotFound { .. }) => {}
        other => return Err(format!("expected BatchNotFound after abort, got {other:?}")),
    }
    match storage.find_batch_by_lot_code("LOT-ABORT").await {
        Ok(None) => Ok(()),
        other => Err(format!("lot code still indexed after abort: {other:?}")),
    }
}

async fn abort_discards_state_update<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .update_batch_state(&mut snap, &batch.batch_id, 0, Phase::Testing, Status::Pending)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.current_phase != Phase::Collection || after.version != 0 {
        return Err(format!(
            "expected collection at version 0, got {} at {}",
            after.current_phase, after.version
        ));
    }
    Ok(())
}

async fn drop_discards_record_and_task<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    {
        let mut snap = storage
            .begin_snapshot()
            .await
            .map_err(|e| format!("begin: {e}"))?;
        let record = storage
            .insert_phase_record(
                &mut snap,
                make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
            )
            .await
            .map_err(|e| format!("insert record: {e}"))?;
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
        // snapshot dropped here without commit
    }

    let records = storage
        .list_phase_records(&batch.batch_id)
        .await
        .map_err(|e| format!("list records: {e}"))?;
    if !records.is_empty() {
        return Err(format!("expected no records after drop, got {}", records.len()));
    }
    let tasks = storage
        .list_ledger_tasks(TaskFilter::default())
        .await
        .map_err(|e| format!("list tasks: {e}"))?;
    if !tasks.is_empty() {
        return Err(format!("expected no tasks after drop, got {}", tasks.len()));
    }

    // The decision slot must be free again.
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin again: {e}"))?;
    storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
        )
        .await
        .map_err(|e| format!("re-insert after drop: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))
}

async fn aborted_lot_code_is_reusable<S, F, Fut>(factory: &F) -> Result<(), String>
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
    storage
        .insert_batch(&mut snap, make_new_batch("LOT-R"))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .abort_snapshot(snap)
        .await
        .map_err(|e| format!("abort: {e}"))?;

    seed_batch(&storage, "LOT-R").await.map(|_| ())
}

async fn sequential_snapshots_see_prior_commits<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .update_batch_state(&mut snap, &batch.batch_id, 0, Phase::Testing, Status::Pending)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin second: {e}"))?;
    let locked = storage
        .get_batch_for_update(&mut snap, &batch.batch_id)
        .await;
    let _ = storage.abort_snapshot(snap).await;
    let locked = locked.map_err(|e| format!("get_for_update: {e}"))?;
    if locked.current_phase != Phase::Testing || locked.version != 1 {
        return Err(format!(
            "expected testing at version 1, got {} at {}",
            locked.current_phase, locked.version
        ));
    }
    Ok(())
}
