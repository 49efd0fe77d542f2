use std::future::Future;
use std::sync::Arc;

use lotline_core::{Decision, Phase, Status};

use super::{make_new_batch, make_record, seed_batch, TestResult};
use crate::{RecordStore, StorageError};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_decisions_exactly_one_wins",
        concurrent_decisions_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_lot_code_exactly_one_wins",
        concurrent_lot_code_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_different_batches_all_succeed",
        concurrent_updates_different_batches_all_succeed(factory).await,
    ));

    results
}

// ── Concurrent decisions: exactly one wins ──────────────────────────────────

/// N tasks each record a decision on the same batch and move it from
/// version 0. Exactly one commit succeeds; the rest must be refused by the
/// version check or the per-phase decision constraint, and exactly one
/// decided record survives.
async fn concurrent_decisions_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let batch = seed_batch(storage.as_ref(), "LOT-RACE").await?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        let batch_id = batch.batch_id.clone();
        handles.push(tokio::spawn(async move {
            let decision = if i % 2 == 0 {
                Decision::Approved
            } else {
                Decision::Rejected
            };
            let mut snap = s.begin_snapshot().await?;
            let result = async {
                s.insert_phase_record(
                    &mut snap,
                    make_record(&batch_id, Phase::Collection, Some(decision)),
                )
                .await?;
                s.update_batch_state(&mut snap, &batch_id, 0, Phase::Testing, Status::Pending)
                    .await
            }
            .await;
            match result {
                Ok(_) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true) // won the race
                }
                Err(StorageError::ConcurrentConflict { .. })
                | Err(StorageError::DuplicateDecision { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false) // lost the race
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let records = storage
        .list_phase_records(&batch.batch_id)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if records.len() != 1 {
        return Err(format!("expected 1 surviving record, got {}", records.len()));
    }
    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.version != 1 {
        return Err(format!("expected version 1, got {}", after.version));
    }
    Ok(())
}

// ── Concurrent creation: exactly one lot code owner ─────────────────────────

async fn concurrent_lot_code_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            match s.insert_batch(&mut snap, make_new_batch("LOT-SAME")).await {
                Ok(_) => {
                    s.commit_snapshot(snap).await?;
                    Ok(true)
                }
                Err(StorageError::DuplicateLotCode { .. }) => {
                    s.abort_snapshot(snap).await?;
                    Ok(false)
                }
                Err(e) => {
                    let _ = s.abort_snapshot(snap).await;
                    Err(e)
                }
            }
        }));
    }

    let mut winners = 0usize;
    for handle in handles {
        if handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e: StorageError| format!("storage error: {e}"))?
        {
            winners += 1;
        }
    }
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    let all = storage
        .list_batches(None, None)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if all.len() != 1 {
        return Err(format!("expected 1 batch, got {}", all.len()));
    }
    Ok(())
}

// ── Concurrent updates to different batches: all succeed ────────────────────

/// No false conflicts when there is no contention.
async fn concurrent_updates_different_batches_all_succeed<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    let mut ids = Vec::new();
    for i in 0..N {
        ids.push(seed_batch(storage.as_ref(), &format!("LOT-{i}")).await?.batch_id);
    }

    let mut handles = Vec::new();
    for batch_id in ids.clone() {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut snap = s.begin_snapshot().await?;
            s.update_batch_state(&mut snap, &batch_id, 0, Phase::Testing, Status::Pending)
                .await?;
            s.commit_snapshot(snap).await?;
            Ok::<(), StorageError>(())
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .map_err(|e| format!("task {i} panic: {e}"))?
            .map_err(|e| format!("task {i} failed: {e}"))?;
    }

    for batch_id in &ids {
        let batch = storage
            .get_batch(batch_id)
            .await
            .map_err(|e| format!("get {batch_id}: {e}"))?;
        if batch.current_phase != Phase::Testing || batch.version != 1 {
            return Err(format!("{batch_id}: unexpected state {batch:?}"));
        }
    }
    Ok(())
}
