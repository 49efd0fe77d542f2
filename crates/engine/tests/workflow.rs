//! End-to-end custody workflow over the in-memory store and ledger.
//!
//! Covers batch creation, the four decision phases, decision races,
//! phase monotonicity, public lookup, and evidence capture failures.

mod common;

use std::sync::Arc;

use common::*;
use lotline_core::{Decision, Evidence, Fingerprint, Location, Phase, Status, WeatherReading};
use lotline_engine::{ChainStatus, EngineError, StaticCapture};
use lotline_ledger::MemoryLedger;
use lotline_storage::RecordStore;

// ──────────────────────────────────────────────
// Happy path
// ──────────────────────────────────────────────

#[tokio::test]
async fn batch_moves_through_every_phase_and_mirrors_to_ledger() {
    let ledger = MemoryLedger::new();
    let m = machine_with(ledger.clone()).await;

    let created = create(&m, "BATCH-1").await;
    assert_eq!(created.batch.current_phase, Phase::Collection);
    assert_eq!(created.batch.status, Status::Pending);
    assert_eq!(
        created.fingerprint,
        Fingerprint::generate(&created.batch.batch_id)
    );

    let batch_id = created.batch.batch_id.clone();
    let expected = [
        (Phase::Collection, Phase::Testing, Status::Pending),
        (Phase::Testing, Phase::Processing, Status::Pending),
        (Phase::Processing, Phase::Manufacturing, Status::Pending),
        (Phase::Manufacturing, Phase::Manufacturing, Status::Approved),
    ];
    for (phase, next, status) in expected {
        let outcome = decide(&m, &batch_id, phase, Decision::Approved).await;
        assert_eq!(outcome.record.phase, phase);
        assert_eq!(outcome.record.decision, Some(Decision::Approved));
        assert_eq!(outcome.batch.current_phase, next);
        assert_eq!(outcome.batch.status, status);
        assert!(outcome.evidence_warnings.is_empty());
    }

    let pass = m.sync().flush().await.unwrap();
    assert_eq!(pass.confirmed, 5, "{pass:?}");
    assert_eq!(pass.exhausted, 0);

    let trace = m.reader().lookup("BATCH-1").await.unwrap().unwrap();
    assert!(trace.terminal);
    assert!(trace.batch.chain_id.is_some());
    // Placeholder plus four decisions.
    assert_eq!(trace.entries.len(), 5);
    assert!(trace.unconfirmed_record_ids().is_empty());

    let chain_id = trace.batch.chain_id.unwrap();
    assert_eq!(ledger.chain_id_for("BATCH-1").await, Some(chain_id));

    let check = m.reader().cross_check("BATCH-1").await.unwrap().unwrap();
    assert!(check.ledger_reachable);
    assert!(check.discrepancies.is_empty(), "{:?}", check.discrepancies);
    assert!(check.unconfirmed.is_empty());
    let confirmed = check
        .phases
        .iter()
        .filter(|p| matches!(p.status, ChainStatus::Confirmed { .. }))
        .count();
    assert_eq!(confirmed, 4);

    let report = m.unconfirmed_report().await.unwrap();
    assert!(report.pending.is_empty());
    assert!(report.exhausted.is_empty());
}

#[tokio::test]
async fn lookup_distinguishes_unknown_lot_from_found_batch() {
    let m = machine().await;
    assert!(m.reader().lookup("NOPE").await.unwrap().is_none());
    assert!(m.reader().lookup("  ").await.unwrap().is_none());

    create(&m, "LOT-7").await;
    let trace = m.reader().lookup("LOT-7").await.unwrap().unwrap();
    assert!(!trace.terminal);
    assert_eq!(trace.entries.len(), 1);
    let placeholder = &trace.entries[0];
    assert!(placeholder.record.decision.is_none());
    let handler = placeholder.handler.as_ref().unwrap();
    assert_eq!(handler.name, "collection handler");
    assert_eq!(handler.organization.as_deref(), Some("Lotline Co-op"));
}

#[tokio::test]
async fn history_is_returned_oldest_first() {
    let m = machine().await;
    let created = create(&m, "LOT-ORDER").await;
    approve_all(&m, &created.batch.batch_id).await;

    let trace = m
        .reader()
        .lookup_batch(&created.batch.batch_id)
        .await
        .unwrap()
        .unwrap();
    let phases: Vec<Phase> = trace.entries.iter().map(|e| e.record.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Collection,
            Phase::Collection,
            Phase::Testing,
            Phase::Processing,
            Phase::Manufacturing
        ]
    );
    assert!(m.reader().lookup_batch("missing").await.unwrap().is_none());
}

// ──────────────────────────────────────────────
// Decision rules
// ──────────────────────────────────────────────

#[tokio::test]
async fn rejection_halts_the_batch() {
    let m = machine().await;
    let id = create(&m, "LOT-REJ").await.batch.batch_id;
    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    let outcome = decide(&m, &id, Phase::Testing, Decision::Rejected).await;
    assert_eq!(outcome.batch.current_phase, Phase::Testing);
    assert_eq!(outcome.batch.status, Status::Rejected);

    let err = m
        .submit_decision(decision(&id, Phase::Testing, Decision::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleState(_)), "{err:?}");
    let err = m
        .submit_decision(decision(&id, Phase::Processing, Decision::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleState(_)), "{err:?}");

    let trace = m.reader().lookup("LOT-REJ").await.unwrap().unwrap();
    assert!(trace.terminal);
}

#[tokio::test]
async fn phases_cannot_be_skipped_or_revisited() {
    let m = machine().await;
    let id = create(&m, "LOT-MONO").await.batch.batch_id;

    let err = m
        .submit_decision(decision(&id, Phase::Processing, Decision::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleState(_)));

    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    let err = m
        .submit_decision(decision(&id, Phase::Collection, Decision::Rejected))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StaleState(_)));

    let batch = m.store().get_batch(&id).await.unwrap();
    assert_eq!(batch.current_phase, Phase::Testing);
    assert_eq!(batch.status, Status::Pending);
}

#[tokio::test]
async fn racing_decisions_have_exactly_one_winner() {
    let m = Arc::new(machine().await);
    let id = create(&m, "LOT-RACE").await.batch.batch_id;

    let mut handles = Vec::new();
    for i in 0..8 {
        let m = m.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let verdict = if i % 2 == 0 {
                Decision::Approved
            } else {
                Decision::Rejected
            };
            m.submit_decision(decision(&id, Phase::Collection, verdict))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::StaleState(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(winners, 1);

    let decided = m
        .store()
        .list_phase_records(&id)
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.decision.is_some())
        .count();
    assert_eq!(decided, 1);
}

#[tokio::test]
async fn actor_must_act_for_the_phase() {
    let m = machine().await;
    let id = create(&m, "LOT-ROLE").await.batch.batch_id;
    let mut request = decision(&id, Phase::Collection, Decision::Approved);
    request.actor_id = actor_for(Phase::Testing).to_string();
    let err = m.submit_decision(request).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)), "{err:?}");
}

#[tokio::test]
async fn test_results_only_at_testing() {
    let m = machine().await;
    let id = create(&m, "LOT-RESULTS").await.batch.batch_id;

    let mut request = decision(&id, Phase::Collection, Decision::Approved);
    request.evidence.test_results = Some(serde_json::json!({"moisture": 11.5}));
    let err = m.submit_decision(request).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    decide(&m, &id, Phase::Collection, Decision::Approved).await;
    let mut request = decision(&id, Phase::Testing, Decision::Approved);
    request.evidence.test_results = Some(serde_json::json!({"moisture": 11.5}));
    let outcome = m.submit_decision(request).await.unwrap();
    assert!(outcome.record.evidence.test_results.is_some());
}

#[tokio::test]
async fn empty_notes_are_rejected() {
    let m = machine().await;
    let id = create(&m, "LOT-NOTES").await.batch.batch_id;
    let mut request = decision(&id, Phase::Collection, Decision::Approved);
    request.notes = "   ".to_string();
    assert!(matches!(
        m.submit_decision(request).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_batch_is_not_found() {
    let m = machine().await;
    let err = m
        .submit_decision(decision("nope", Phase::Collection, Decision::Approved))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn duplicate_lot_code_leaves_one_batch() {
    let m = machine().await;
    create(&m, "LOT-DUP").await;
    let err = m
        .create_batch(actor_for(Phase::Collection), batch_request("LOT-DUP"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(m.store().list_batches(None, None).await.unwrap().len(), 1);
}

// ──────────────────────────────────────────────
// Worklists and summaries
// ──────────────────────────────────────────────

#[tokio::test]
async fn worklist_and_summary_follow_batch_state() {
    let m = machine().await;
    let a = create(&m, "LOT-A").await.batch.batch_id;
    let b = create(&m, "LOT-B").await.batch.batch_id;
    create(&m, "LOT-C").await;

    decide(&m, &a, Phase::Collection, Decision::Approved).await;
    decide(&m, &b, Phase::Collection, Decision::Rejected).await;

    let reader = m.reader();
    let collection = reader.worklist(Phase::Collection).await.unwrap();
    assert_eq!(collection.len(), 1);
    assert_eq!(collection[0].lot_code, "LOT-C");
    let testing = reader.worklist(Phase::Testing).await.unwrap();
    assert_eq!(testing.len(), 1);
    assert_eq!(testing[0].batch_id, a);

    let all = reader.status_summary(None).await.unwrap();
    assert_eq!((all.total, all.pending, all.rejected), (3, 2, 1));
    let at_collection = reader.status_summary(Some(Phase::Collection)).await.unwrap();
    assert_eq!((at_collection.total, at_collection.rejected), (2, 1));
}

#[tokio::test]
async fn actor_activity_counts_batches_or_decisions_by_role() {
    let m = machine().await;
    let a = create(&m, "LOT-ACT-A").await.batch.batch_id;
    let b = create(&m, "LOT-ACT-B").await.batch.batch_id;
    approve_all(&m, &a).await;
    decide(&m, &b, Phase::Collection, Decision::Approved).await;
    decide(&m, &b, Phase::Testing, Decision::Rejected).await;

    let reader = m.reader();
    let collector = reader.actor_activity("col-1").await.unwrap();
    assert_eq!((collector.role, collector.count), (Phase::Collection, 2));
    let lab = reader.actor_activity("lab-1").await.unwrap();
    assert_eq!((lab.role, lab.count), (Phase::Testing, 2));
    let processor = reader.actor_activity("proc-1").await.unwrap();
    assert_eq!(processor.count, 1);

    assert!(matches!(
        reader.actor_activity("nobody").await,
        Err(EngineError::NotFound(_))
    ));
}

// ──────────────────────────────────────────────
// Evidence capture
// ──────────────────────────────────────────────

#[tokio::test]
async fn capture_failure_does_not_block_a_decision() {
    let m = machine()
        .await
        .with_capture(Arc::new(StaticCapture::unavailable()));
    let id = create(&m, "LOT-CAPTURE").await.batch.batch_id;

    let outcome = decide(&m, &id, Phase::Collection, Decision::Approved).await;
    assert_eq!(outcome.batch.current_phase, Phase::Testing);
    assert_eq!(outcome.evidence_warnings.len(), 1);
    assert!(
        outcome.evidence_warnings[0].starts_with("evidence unavailable: location"),
        "{:?}",
        outcome.evidence_warnings
    );
    assert!(outcome.record.evidence.location.is_none());
}

#[tokio::test]
async fn captured_readings_are_stored_with_the_record() {
    let site = Location {
        latitude: -8.4,
        longitude: 115.2,
    };
    let weather = WeatherReading {
        temperature: 24.0,
        humidity: 70.0,
        conditions: "Clear".to_string(),
        description: "Clear sky".to_string(),
        wind_speed: None,
        pressure: None,
        observed_at: "2025-03-01T06:00".to_string(),
        source: "static".to_string(),
    };
    let m = machine()
        .await
        .with_capture(Arc::new(StaticCapture::new(Some(site), Some(weather.clone()))));
    let id = create(&m, "LOT-WX").await.batch.batch_id;

    let mut request = decision(&id, Phase::Collection, Decision::Approved);
    request.evidence = Evidence::default();
    let outcome = m.submit_decision(request).await.unwrap();
    assert_eq!(outcome.record.evidence.location, Some(site));
    assert_eq!(outcome.record.evidence.weather, Some(weather));
}
