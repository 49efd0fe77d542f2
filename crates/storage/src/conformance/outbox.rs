//! Ledger outbox and confirmation-field conformance tests.

use std::future::Future;

use lotline_core::{Decision, Phase};

use super::{make_record, seed_batch, TestResult};
use crate::{
    ConfirmOutcome, LedgerTaskKind, LedgerTaskState, RecordStore, TaskFilter, TaskUpdate,
};

pub(super) async fn run_outbox_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "outbox",
        "tasks_listed_in_id_order",
        tasks_listed_in_id_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "outbox",
        "task_filter_by_state_due_and_batch",
        task_filter_by_state_due_and_batch(factory).await,
    ));
    results.push(TestResult::from_result(
        "outbox",
        "task_update_overwrites_fields",
        task_update_overwrites_fields(factory).await,
    ));
    results.push(TestResult::from_result(
        "outbox",
        "chain_id_set_if_null",
        chain_id_set_if_null(factory).await,
    ));
    results.push(TestResult::from_result(
        "outbox",
        "tx_hash_set_if_null",
        tx_hash_set_if_null(factory).await,
    ));

    results
}

async fn enqueue<S: RecordStore>(storage: &S, kind: LedgerTaskKind) -> Result<i64, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let task = storage
        .insert_ledger_task(&mut snap, kind)
        .await
        .map_err(|e| format!("insert task: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    Ok(task.id)
}

fn create_task(batch_id: &str) -> LedgerTaskKind {
    LedgerTaskKind::CreateBatch {
        batch_id: batch_id.to_string(),
    }
}

async fn tasks_listed_in_id_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let mut expected = Vec::new();
    for i in 0..4 {
        let batch = seed_batch(&storage, &format!("LOT-{i}")).await?;
        expected.push(enqueue(&storage, create_task(&batch.batch_id)).await?);
    }
    let ids: Vec<i64> = storage
        .list_ledger_tasks(TaskFilter::default())
        .await
        .map_err(|e| format!("list: {e}"))?
        .into_iter()
        .map(|t| t.id)
        .collect();
    if ids != expected {
        return Err(format!("expected {expected:?}, got {ids:?}"));
    }
    let limited = storage
        .list_ledger_tasks(TaskFilter {
            limit: 2,
            ..TaskFilter::default()
        })
        .await
        .map_err(|e| format!("list limited: {e}"))?;
    if limited.len() != 2 || limited[0].id != expected[0] {
        return Err(format!("limit not honored: {limited:?}"));
    }
    Ok(())
}

async fn task_filter_by_state_due_and_batch<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let a = seed_batch(&storage, "LOT-A").await?;
    let b = seed_batch(&storage, "LOT-B").await?;
    let task_a = enqueue(&storage, create_task(&a.batch_id)).await?;
    let task_b = enqueue(&storage, create_task(&b.batch_id)).await?;

    storage
        .update_ledger_task(
            task_b,
            TaskUpdate {
                state: LedgerTaskState::Pending,
                attempts: 1,
                next_attempt_at_ms: 10_000,
                last_error: Some("timeout".to_string()),
            },
        )
        .await
        .map_err(|e| format!("update: {e}"))?;

    let due: Vec<i64> = storage
        .list_ledger_tasks(TaskFilter {
            state: Some(LedgerTaskState::Pending),
            due_at_ms: Some(5_000),
            ..TaskFilter::default()
        })
        .await
        .map_err(|e| format!("list due: {e}"))?
        .into_iter()
        .map(|t| t.id)
        .collect();
    if due != vec![task_a] {
        return Err(format!("expected only {task_a} due, got {due:?}"));
    }

    let for_b = storage
        .list_ledger_tasks(TaskFilter {
            batch_id: Some(b.batch_id.clone()),
            ..TaskFilter::default()
        })
        .await
        .map_err(|e| format!("list by batch: {e}"))?;
    if for_b.len() != 1 || for_b[0].id != task_b {
        return Err(format!("batch filter wrong: {for_b:?}"));
    }

    let confirmed = storage
        .list_ledger_tasks(TaskFilter {
            state: Some(LedgerTaskState::Confirmed),
            ..TaskFilter::default()
        })
        .await
        .map_err(|e| format!("list confirmed: {e}"))?;
    if !confirmed.is_empty() {
        return Err(format!("expected no confirmed tasks, got {}", confirmed.len()));
    }
    Ok(())
}

async fn task_update_overwrites_fields<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;
    let task_id = enqueue(&storage, create_task(&batch.batch_id)).await?;

    let update = TaskUpdate {
        state: LedgerTaskState::Exhausted,
        attempts: 5,
        next_attempt_at_ms: 42,
        last_error: Some("ledger unavailable".to_string()),
    };
    storage
        .update_ledger_task(task_id, update.clone())
        .await
        .map_err(|e| format!("update: {e}"))?;

    let tasks = storage
        .list_ledger_tasks(TaskFilter::default())
        .await
        .map_err(|e| format!("list: {e}"))?;
    let task = tasks
        .iter()
        .find(|t| t.id == task_id)
        .ok_or_else(|| "task vanished".to_string())?;
    if task.state != update.state
        || task.attempts != update.attempts
        || task.next_attempt_at_ms != update.next_attempt_at_ms
        || task.last_error != update.last_error
    {
        return Err(format!("update not applied: {task:?}"));
    }
    Ok(())
}

async fn chain_id_set_if_null<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = factory().await;
    let batch = seed_batch(&storage, "LOT-1").await?;

    let steps = [
        (7, ConfirmOutcome::Applied),
        (7, ConfirmOutcome::Unchanged),
        (8, ConfirmOutcome::Mismatch { existing: 7 }),
    ];
    for (chain_id, expected) in steps {
        let outcome = storage
            .set_batch_chain_id(&batch.batch_id, chain_id)
            .await
            .map_err(|e| format!("set {chain_id}: {e}"))?;
        if outcome != expected {
            return Err(format!("set {chain_id}: expected {expected:?}, got {outcome:?}"));
        }
    }
    let after = storage
        .get_batch(&batch.batch_id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if after.chain_id != Some(7) || after.version != batch.version {
        return Err(format!("unexpected batch after confirmation: {after:?}"));
    }
    Ok(())
}

async fn tx_hash_set_if_null<S, F, Fut>(factory: &F) -> Result<(), String>
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
    let record = storage
        .insert_phase_record(
            &mut snap,
            make_record(&batch.batch_id, Phase::Collection, Some(Decision::Approved)),
        )
        .await
        .map_err(|e| format!("insert: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;

    let first = storage
        .set_record_tx_hash(record.id, "0xaa")
        .await
        .map_err(|e| format!("first: {e}"))?;
    let again = storage
        .set_record_tx_hash(record.id, "0xaa")
        .await
        .map_err(|e| format!("again: {e}"))?;
    let other = storage
        .set_record_tx_hash(record.id, "0xbb")
        .await
        .map_err(|e| format!("other: {e}"))?;
    if first != ConfirmOutcome::Applied || again != ConfirmOutcome::Unchanged {
        return Err(format!("unexpected outcomes: {first:?}, {again:?}"));
    }
    match other {
        ConfirmOutcome::Mismatch { existing } if existing == "0xaa" => {}
        other => return Err(format!("expected Mismatch, got {other:?}")),
    }
    let stored = storage
        .get_phase_record(record.id)
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.chain_tx_hash.as_deref() != Some("0xaa") {
        return Err(format!("hash not kept: {:?}", stored.chain_tx_hash));
    }
    Ok(())
}
