//! Ledger mirroring: retries, exhaustion, ambiguous timeouts, idempotent
//! confirmation, cross-checks and the background reconciler.

mod common;

use common::*;
use lotline_core::{Decision, Phase, Status};
use lotline_engine::{ChainStatus, EngineError};
use lotline_ledger::{notes_hash, LedgerClient, LedgerError, MemoryLedger};
use lotline_storage::{LedgerTaskKind, LedgerTaskState, RecordStore, TaskFilter};

fn outage() -> LedgerError {
    LedgerError::Unavailable("rpc endpoint down".to_string())
}

#[tokio::test]
async fn outage_never_blocks_custody_and_leaves_work_unconfirmed() {
    let ledger = MemoryLedger::new();
    ledger.set_outage(Some(outage())).await;
    let m = machine_with(ledger).await;

    let id = create(&m, "LOT-DOWN").await.batch.batch_id;
    approve_all(&m, &id).await;

    for _ in 0..5 {
        m.sync().run_once().await.unwrap();
    }

    let batch = m.store().get_batch(&id).await.unwrap();
    assert_eq!(batch.current_phase, Phase::Manufacturing);
    assert_eq!(batch.status, Status::Approved);
    assert!(batch.chain_id.is_none());

    let records = m.store().list_phase_records(&id).await.unwrap();
    assert!(records.iter().all(|r| r.chain_tx_hash.is_none()));

    let report = m.unconfirmed_report().await.unwrap();
    assert!(report.pending.is_empty());
    assert_eq!(report.exhausted.len(), 5);
    let create_task = report
        .exhausted
        .iter()
        .find(|t| matches!(t.kind, LedgerTaskKind::CreateBatch { .. }))
        .unwrap();
    assert_eq!(create_task.attempts, 3);
    assert!(create_task.last_error.as_deref().unwrap().contains("rpc endpoint down"));

    let check = m.reader().cross_check("LOT-DOWN").await.unwrap().unwrap();
    assert_eq!(check.unconfirmed.len(), 4);
    let awaiting = check
        .phases
        .iter()
        .filter(|p| p.status == ChainStatus::AwaitingBatch)
        .count();
    assert_eq!(awaiting, 4);
}

#[tokio::test]
async fn appends_wait_for_the_batch_without_spending_attempts() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-WAIT").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;

    ledger.fail_next(1, outage()).await;
    let pass = m.sync().run_once().await.unwrap();
    assert_eq!((pass.retried, pass.deferred), (1, 1), "{pass:?}");

    let tasks = m
        .store()
        .list_ledger_tasks(TaskFilter {
            batch_id: Some(id.clone()),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    let append = tasks
        .iter()
        .find(|t| matches!(t.kind, LedgerTaskKind::AppendPhase { .. }))
        .unwrap();
    assert_eq!(append.attempts, 0);
    assert_eq!(append.state, LedgerTaskState::Pending);

    let pass = m.sync().flush().await.unwrap();
    assert_eq!(pass.confirmed, 2, "{pass:?}");
    let tasks = m
        .store()
        .list_ledger_tasks(TaskFilter {
            batch_id: Some(id),
            ..TaskFilter::default()
        })
        .await
        .unwrap();
    assert!(tasks.iter().all(|t| t.state == LedgerTaskState::Confirmed));
    assert_eq!(tasks[0].attempts, 1);
}

#[tokio::test]
async fn rejected_write_is_not_retried() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    create(&m, "LOT-REJECTED").await;

    ledger
        .fail_next(1, LedgerError::Rejected("bad signature".to_string()))
        .await;
    let pass = m.sync().run_once().await.unwrap();
    assert_eq!(pass.exhausted, 1);

    let report = m.unconfirmed_report().await.unwrap();
    assert_eq!(report.exhausted.len(), 1);
    assert_eq!(report.exhausted[0].attempts, 1);
}

#[tokio::test]
async fn ambiguous_timeouts_are_adopted_without_a_second_write() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-SLOW").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;

    // Creation lands but is not confirmed in time.
    ledger.hold_confirmations(true).await;
    m.sync().run_once().await.unwrap();
    m.sync().run_once().await.unwrap();
    assert_eq!(ledger.write_count().await, 1);
    assert!(m.store().get_batch(&id).await.unwrap().chain_id.is_none());

    ledger.hold_confirmations(false).await;
    m.sync().flush().await.unwrap();
    assert_eq!(ledger.write_count().await, 2);
    let chain_id = m.store().get_batch(&id).await.unwrap().chain_id.unwrap();

    // Same for an append: the retry reads the entry instead of rewriting it.
    ledger.hold_confirmations(true).await;
    let outcome = decide(&m, &id, Phase::Testing, Decision::Approved).await;
    m.sync().run_once().await.unwrap();
    m.sync().run_once().await.unwrap();
    assert_eq!(ledger.write_count().await, 3);

    ledger.hold_confirmations(false).await;
    let pass = m.sync().flush().await.unwrap();
    assert_eq!(pass.confirmed, 1);
    assert_eq!(ledger.write_count().await, 3);

    let record = m.store().get_phase_record(outcome.record.id).await.unwrap();
    let entry = ledger
        .read_phase(chain_id, Phase::Testing.index())
        .await
        .unwrap()
        .confirmed()
        .unwrap();
    assert_eq!(record.chain_tx_hash.as_deref(), Some(entry.tx_hash.as_str()));
}

#[tokio::test]
async fn confirmations_are_idempotent_and_never_overwritten() {
    let m = machine().await;
    let created = create(&m, "LOT-CONFIRM").await;
    let id = created.batch.batch_id.clone();
    let outcome = decide(&m, &id, Phase::Collection, Decision::Approved).await;
    m.sync().flush().await.unwrap();

    let record = m.store().get_phase_record(outcome.record.id).await.unwrap();
    let tx = record.chain_tx_hash.clone().unwrap();
    m.confirm_ledger_write(record.id, &tx).await.unwrap();

    let err = m
        .confirm_ledger_write(record.id, "0xdifferent")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Consistency(_)), "{err:?}");
    let after = m.store().get_phase_record(record.id).await.unwrap();
    assert_eq!(after.chain_tx_hash, Some(tx));

    let chain_id = m.store().get_batch(&id).await.unwrap().chain_id.unwrap();
    m.confirm_batch_on_ledger(&id, chain_id).await.unwrap();
    let err = m
        .confirm_batch_on_ledger(&id, chain_id + 100)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Consistency(_)));

    assert!(matches!(
        m.confirm_ledger_write(created.record.id, "0xabc").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        m.confirm_ledger_write(record.id, " ").await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        m.confirm_batch_on_ledger("missing", 1).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn manual_confirmation_closes_exhausted_work() {
    let ledger = MemoryLedger::new();
    ledger.set_outage(Some(outage())).await;
    let m = machine_with(ledger).await;
    let id = create(&m, "LOT-MANUAL").await.batch.batch_id;
    for _ in 0..3 {
        m.sync().run_once().await.unwrap();
    }
    assert_eq!(m.unconfirmed_report().await.unwrap().exhausted.len(), 1);

    m.confirm_batch_on_ledger(&id, 77).await.unwrap();
    assert!(m.unconfirmed_report().await.unwrap().exhausted.is_empty());
    assert_eq!(m.store().get_batch(&id).await.unwrap().chain_id, Some(77));
}

#[tokio::test]
async fn exhausted_work_can_be_rearmed_after_an_outage() {
    let ledger = MemoryLedger::new();
    ledger.set_outage(Some(outage())).await;
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-REARM").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    for _ in 0..3 {
        m.sync().run_once().await.unwrap();
    }
    assert_eq!(m.unconfirmed_report().await.unwrap().exhausted.len(), 2);

    // Re-armed tasks go back to pending with a fresh budget.
    assert_eq!(m.retry_ledger_writes(&id).await.unwrap(), 2);
    assert!(m.unconfirmed_report().await.unwrap().exhausted.is_empty());

    ledger.set_outage(None).await;
    m.sync().flush().await.unwrap();
    let report = m.unconfirmed_report().await.unwrap();
    assert!(report.pending.is_empty() && report.exhausted.is_empty());
    let trace = m.reader().lookup("LOT-REARM").await.unwrap().unwrap();
    assert!(trace.batch.chain_id.is_some());
    assert!(trace.unconfirmed_record_ids().is_empty());

    assert_eq!(m.retry_ledger_writes(&id).await.unwrap(), 0);
    assert!(matches!(
        m.retry_ledger_writes("missing").await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn cross_check_reports_a_diverging_ledger_entry() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-DIVERGE").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    m.sync().flush().await.unwrap();
    let chain_id = m.store().get_batch(&id).await.unwrap().chain_id.unwrap();

    // Someone else decided Testing on the ledger first.
    ledger
        .append_phase_on_ledger(
            chain_id,
            Phase::Testing.index(),
            Decision::Rejected.ledger_code(),
            &notes_hash("rejected elsewhere"),
        )
        .await
        .unwrap();
    decide(&m, &id, Phase::Testing, Decision::Approved).await;
    let pass = m.sync().flush().await.unwrap();
    assert_eq!(pass.exhausted, 1);

    let check = m.reader().cross_check("LOT-DIVERGE").await.unwrap().unwrap();
    assert_eq!(check.discrepancies.len(), 1, "{:?}", check.discrepancies);
    assert_eq!(check.unconfirmed.len(), 1);
    let testing = check
        .phases
        .iter()
        .find(|p| p.phase == Phase::Testing)
        .unwrap();
    assert!(matches!(testing.status, ChainStatus::Mismatch { .. }));
}

#[tokio::test]
async fn cross_check_reports_a_wrong_stored_tx_hash() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-BOGUS-TX").await.batch.batch_id;
    m.sync().flush().await.unwrap();
    let chain_id = m.store().get_batch(&id).await.unwrap().chain_id.unwrap();

    let outcome = decide(&m, &id, Phase::Collection, Decision::Approved).await;
    let real_tx = ledger
        .append_phase_on_ledger(
            chain_id,
            Phase::Collection.index(),
            Decision::Approved.ledger_code(),
            &notes_hash(&outcome.record.notes),
        )
        .await
        .unwrap();
    m.confirm_ledger_write(outcome.record.id, "0xbogus")
        .await
        .unwrap();

    let check = m.reader().cross_check("LOT-BOGUS-TX").await.unwrap().unwrap();
    assert_eq!(check.discrepancies.len(), 1, "{:?}", check.discrepancies);
    assert!(check.discrepancies[0].contains("0xbogus"));
    assert!(check.discrepancies[0].contains(&real_tx));
    let collection = check
        .phases
        .iter()
        .find(|p| p.record_id == outcome.record.id)
        .unwrap();
    assert!(
        matches!(collection.status, ChainStatus::Mismatch { .. }),
        "{:?}",
        collection.status
    );
}

#[tokio::test]
async fn cross_check_survives_an_unreachable_ledger() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    let id = create(&m, "LOT-DARK").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    m.sync().flush().await.unwrap();

    ledger.set_outage(Some(outage())).await;
    let check = m.reader().cross_check("LOT-DARK").await.unwrap().unwrap();
    assert!(!check.ledger_reachable);
    assert!(check
        .phases
        .iter()
        .filter(|p| p.phase == Phase::Collection)
        .any(|p| matches!(p.status, ChainStatus::Unavailable { .. })));
    assert!(check.unconfirmed.is_empty());
}

#[tokio::test]
async fn reconciler_flushes_on_shutdown() {
    let m = machine().await;
    m.init().await.unwrap();
    let id = create(&m, "LOT-BG").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    m.shutdown().await.unwrap();

    let trace = m.reader().lookup("LOT-BG").await.unwrap().unwrap();
    assert!(trace.batch.chain_id.is_some());
    assert!(trace.unconfirmed_record_ids().is_empty());
}

#[tokio::test]
async fn ready_reports_ledger_outage_as_unavailable() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;
    m.ready().await.unwrap();

    ledger.set_outage(Some(outage())).await;
    let err = m.ready().await.unwrap_err();
    assert!(matches!(err, EngineError::LedgerUnavailable(_)), "{err:?}");

    // Custody still moves while the ledger is down.
    let id = create(&m, "LOT-NOT-READY").await.batch.batch_id;
    let outcome = decide(&m, &id, Phase::Collection, Decision::Approved).await;
    assert_eq!(outcome.batch.current_phase, Phase::Testing);
}

#[tokio::test]
async fn init_tolerates_an_unreachable_ledger() {
    let ledger = MemoryLedger::new();
    ledger.set_outage(Some(outage())).await;
    let m = machine_with(ledger).await;
    m.init().await.unwrap();
    create(&m, "LOT-OFFLINE").await;
    m.shutdown().await.unwrap();
    let report = m.unconfirmed_report().await.unwrap();
    assert_eq!(report.pending.len() + report.exhausted.len(), 1);
}
