use std::future::Future;

use lotline_core::{Phase, Status};

use super::{make_record, TestResult};
use crate::{LedgerTaskKind, LedgerTaskState, RecordStore, StorageError, TaskUpdate};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_batch_nonexistent",
        get_batch_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "get_batch_for_update_nonexistent",
        get_batch_for_update_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "update_batch_state_nonexistent",
        update_batch_state_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "find_batch_by_unknown_lot_code_is_none",
        find_batch_by_unknown_lot_code_is_none(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_record_for_missing_batch",
        insert_record_for_missing_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_task_for_missing_batch",
        insert_task_for_missing_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "missing_record_task_and_actor",
        missing_record_task_and_actor(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "list_records_empty_for_nonexistent",
        list_records_empty_for_nonexistent(factory).await,
    ));

    results
}

async fn get_batch_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_batch("missing").await {
        Err(StorageError::BatchNotFound { batch_id }) if batch_id == "missing" => Ok(()),
        other => Err(format!("expected BatchNotFound, got {other:?}")),
    }
}

async fn get_batch_for_update_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage.get_batch_for_update(&mut snap, "missing").await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::BatchNotFound { batch_id }) if batch_id == "missing" => Ok(()),
        other => Err(format!("expected BatchNotFound, got {other:?}")),
    }
}

async fn update_batch_state_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .update_batch_state(&mut snap, "missing", 0, Phase::Testing, Status::Pending)
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::BatchNotFound { .. }) => Ok(()),
        other => Err(format!("expected BatchNotFound, got {other:?}")),
    }
}

async fn find_batch_by_unknown_lot_code_is_none<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.find_batch_by_lot_code("NOPE").await {
        Ok(None) => Ok(()),
        other => Err(format!("expected Ok(None), got {other:?}")),
    }
}

async fn insert_record_for_missing_batch<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .insert_phase_record(&mut snap, make_record("missing", Phase::Collection, None))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::BatchNotFound { .. }) => Ok(()),
        other => Err(format!("expected BatchNotFound, got {other:?}")),
    }
}

async fn insert_task_for_missing_batch<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let result = storage
        .insert_ledger_task(
            &mut snap,
            LedgerTaskKind::CreateBatch {
                batch_id: "missing".to_string(),
            },
        )
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match result {
        Err(StorageError::BatchNotFound { .. }) => Ok(()),
        other => Err(format!("expected BatchNotFound, got {other:?}")),
    }
}

async fn missing_record_task_and_actor<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    match storage.get_phase_record(404).await {
        Err(StorageError::RecordNotFound { record_id: 404 }) => {}
        other => return Err(format!("expected RecordNotFound, got {other:?}")),
    }
    match storage.set_record_tx_hash(404, "0xabc").await {
        Err(StorageError::RecordNotFound { .. }) => {}
        other => return Err(format!("expected RecordNotFound on confirm, got {other:?}")),
    }
    let update = TaskUpdate {
        state: LedgerTaskState::Confirmed,
        attempts: 1,
        next_attempt_at_ms: 0,
        last_error: None,
    };
    match storage.update_ledger_task(404, update).await {
        Err(StorageError::TaskNotFound { task_id: 404 }) => {}
        other => return Err(format!("expected TaskNotFound, got {other:?}")),
    }
    match storage.get_actor("nobody").await {
        Err(StorageError::ActorNotFound { actor_id }) if actor_id == "nobody" => Ok(()),
        other => Err(format!("expected ActorNotFound, got {other:?}")),
    }
}

async fn list_records_empty_for_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let records = storage
        .list_phase_records("missing")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !records.is_empty() {
        return Err(format!("expected no records, got {}", records.len()));
    }
    Ok(())
}
