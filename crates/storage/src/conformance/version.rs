use std::future::Future;

use lotline_core::{Phase, Status};

use super::{seed_batch, TestResult};
use crate::{RecordStore, StorageError};

pub(super) async fn run_version_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "version",
        "version_increments_sequentially",
        version_increments_sequentially(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "update_with_wrong_version_returns_conflict",
        update_with_wrong_version_returns_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "stale_version_after_intervening_commit",
        stale_version_after_intervening_commit(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "conflict_has_correct_fields",
        conflict_has_correct_fields(factory).await,
    ));
    results.push(TestResult::from_result(
        "version",
        "conflict_leaves_state_unchanged",
        conflict_leaves_state_unchanged(factory).await,
    ));

    results
}

async fn update_once<S: RecordStore>(
    storage: &S,
    batch_id: &str,
    expected_version: i64,
    phase: Phase,
    status: Status,
) -> Result<i64, StorageError> {
    let mut snap = storage.begin_snapshot().await?;
    match storage
        .update_batch_state(&mut snap, batch_id, expected_version, phase, status)
        .await
    {
        Ok(version) => {
            storage.commit_snapshot(snap).await?;
            Ok(version)
        }
        Err(e) => {
            let _ = storage.abort_snapshot(snap).await;
            Err(e)
        }
    }
}

async fn version_increments_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let steps = [
        (Phase::Testing, Status::Pending),
        (Phase::Processing, Status::Pending),
        (Phase::Manufacturing, Status::Pending),
        (Phase::Manufacturing, Status::Approved),
    ];
    for (i, (phase, status)) in steps.into_iter().enumerate() {
        let expected = i as i64;
        let version = update_once(&storage, &batch.batch_id, expected, phase, status)
            .await
            .map_err(|e| format!("step {i}: {e}"))?;
        if version != expected + 1 {
            return Err(format!("step {i}: expected version {}, got {version}", expected + 1));
        }
    }
    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.version != 4 || after.status != Status::Approved {
        return Err(format!("unexpected final batch: {after:?}"));
    }
    Ok(())
}

async fn update_with_wrong_version_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;
    for wrong in [-1, 1, 7] {
        match update_once(&storage, &batch.batch_id, wrong, Phase::Testing, Status::Pending).await
        {
            Err(StorageError::ConcurrentConflict { .. }) => {}
            other => {
                return Err(format!(
                    "version {wrong}: expected ConcurrentConflict, got {other:?}"
                ))
            }
        }
    }
    Ok(())
}

async fn stale_version_after_intervening_commit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    update_once(&storage, &batch.batch_id, 0, Phase::Testing, Status::Pending)
        .await
        .map_err(|e| format!("first update: {e}"))?;
    match update_once(&storage, &batch.batch_id, 0, Phase::Collection, Status::Rejected).await {
        Err(StorageError::ConcurrentConflict { .. }) => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {other:?}")),
    }
}

async fn conflict_has_correct_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;
    match update_once(&storage, &batch.batch_id, 3, Phase::Testing, Status::Pending).await {
        Err(StorageError::ConcurrentConflict {
            batch_id,
            expected_version,
        }) if batch_id == batch.batch_id && expected_version == 3 => Ok(()),
        other => Err(format!("unexpected conflict payload: {other:?}")),
    }
}

async fn conflict_leaves_state_unchanged<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;
    let _ = update_once(&storage, &batch.batch_id, 9, Phase::Testing, Status::Pending).await;
    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after != batch {
        return Err(format!("batch changed after conflict: {after:?}"));
    }
    Ok(())
}
