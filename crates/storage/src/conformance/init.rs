use std::future::Future;

use lotline_core::{Phase, Status};

use super::{make_new_batch, seed_batch, TestResult};
use crate::{RecordStore, StorageError};

pub(super) async fn run_init_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "init",
        "insert_batch_starts_at_collection_pending",
        insert_batch_starts_at_collection_pending(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "insert_batch_assigns_unique_ids",
        insert_batch_assigns_unique_ids(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "inserted_batch_readable_by_id_and_lot_code",
        inserted_batch_readable_by_id_and_lot_code(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "duplicate_lot_code_in_same_snapshot",
        duplicate_lot_code_in_same_snapshot(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "duplicate_lot_code_across_snapshots",
        duplicate_lot_code_across_snapshots(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "list_batches_filters_by_phase_and_status",
        list_batches_filters_by_phase_and_status(factory).await,
    ));
    results.push(TestResult::from_result(
        "init",
        "actor_upsert_replaces",
        actor_upsert_replaces(factory).await,
    ));

    results
}

async fn insert_batch_starts_at_collection_pending<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;
    if batch.current_phase != Phase::Collection || batch.status != Status::Pending {
        return Err(format!(
            "expected collection/pending, got {}/{}",
            batch.current_phase, batch.status
        ));
    }
    if batch.version != 0 {
        return Err(format!("expected version 0, got {}", batch.version));
    }
    if batch.chain_id.is_some() {
        return Err("new batch must not carry a chain id".to_string());
    }
    Ok(())
}

async fn insert_batch_assigns_unique_ids<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let a = seed_batch(&storage, "LOT-A").await?;
    let b = seed_batch(&storage, "LOT-B").await?;
    if a.batch_id.is_empty() || a.batch_id == b.batch_id {
        return Err(format!("ids not unique: {} / {}", a.batch_id, b.batch_id));
    }
    Ok(())
}

async fn inserted_batch_readable_by_id_and_lot_code<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-READ").await?;

    let by_id = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get_batch: {e}"))?;
    if by_id != batch {
        return Err(format!("get_batch mismatch: {by_id:?}"));
    }
    let by_lot = storage
        .find_batch_by_lot_code("LOT-READ")
        .await
        .map_err(|e| format!("find_batch_by_lot_code: {e}"))?;
    if by_lot.as_ref() != Some(&batch) {
        return Err(format!("find_batch_by_lot_code mismatch: {by_lot:?}"));
    }
    Ok(())
}

async fn duplicate_lot_code_in_same_snapshot<S, F, Fut>(factory: &F) -> Result<(), String>
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
        .insert_batch(&mut snap, make_new_batch("LOT-DUP"))
        .await
        .map_err(|e| format!("first insert: {e}"))?;
    let second = storage
        .insert_batch(&mut snap, make_new_batch("LOT-DUP"))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match second {
        Err(StorageError::DuplicateLotCode { lot_code }) if lot_code == "LOT-DUP" => Ok(()),
        other => Err(format!("expected DuplicateLotCode, got {other:?}")),
    }
}

async fn duplicate_lot_code_across_snapshots<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    seed_batch(&storage, "LOT-DUP").await?;
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let second = storage
        .insert_batch(&mut snap, make_new_batch("LOT-DUP"))
        .await;
    let _ = storage.abort_snapshot(snap).await;
    match second {
        Err(StorageError::DuplicateLotCode { .. }) => Ok(()),
        other => Err(format!("expected DuplicateLotCode, got {other:?}")),
    }
}

async fn list_batches_filters_by_phase_and_status<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let a = seed_batch(&storage, "LOT-1").await?;
    seed_batch(&storage, "LOT-2").await?;

    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    storage
        .update_batch_state(&mut snap, &a.batch_id, 0, Phase::Testing, Status::Pending)
        .await
        .map_err(|e| format!("update: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let all = storage
        .list_batches(None, None)
        .await
        .map_err(|e| format!("list all: {e}"))?;
    if all.len() != 2 {
        return Err(format!("expected 2 batches, got {}", all.len()));
    }
    let testing = storage
        .list_batches(Some(Phase::Testing), Some(Status::Pending))
        .await
        .map_err(|e| format!("list testing: {e}"))?;
    if testing.len() != 1 || testing[0].batch_id != a.batch_id {
        return Err(format!("expected only {} at testing, got {testing:?}", a.batch_id));
    }
    let rejected = storage
        .list_batches(None, Some(Status::Rejected))
        .await
        .map_err(|e| format!("list rejected: {e}"))?;
    if !rejected.is_empty() {
        return Err(format!("expected no rejected batches, got {}", rejected.len()));
    }
    Ok(())
}

async fn actor_upsert_replaces<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut actor = crate::Actor {
        actor_id: "tester-1".to_string(),
        display_name: None,
        email: "lab@example.com".to_string(),
        role: Phase::Testing,
        organization: None,
    };
    storage
        .upsert_actor(actor.clone())
        .await
        .map_err(|e| format!("upsert: {e}"))?;
    actor.display_name = Some("Lab Tech".to_string());
    storage
        .upsert_actor(actor.clone())
        .await
        .map_err(|e| format!("second upsert: {e}"))?;
    let stored = storage
        .get_actor("tester-1")
        .await
        .map_err(|e| format!("get_actor: {e}"))?;
    if stored != actor {
        return Err(format!("expected replaced actor, got {stored:?}"));
    }
    Ok(())
}
