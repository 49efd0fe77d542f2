#![allow(dead_code)]

use lotline_core::{CollectionDetails, Decision, Evidence, Phase};
use lotline_engine::{
    CreateBatchRequest, CreatedBatch, DecisionOutcome, DecisionRequest, EngineConfig,
    PhaseStateMachine,
};
use lotline_ledger::MemoryLedger;
use lotline_storage::{Actor, MemoryStore};

pub type Machine = PhaseStateMachine<MemoryStore, MemoryLedger>;

/// Retries without delay so a few passes exhaust a task.
pub fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.max_attempts = 3;
    config.retry.base_delay_ms = 0;
    config.retry.max_delay_ms = 0;
    config.retry.jitter = false;
    config
}

pub fn actor_for(phase: Phase) -> &'static str {
    match phase {
        Phase::Collection => "col-1",
        Phase::Testing => "lab-1",
        Phase::Processing => "proc-1",
        Phase::Manufacturing => "mfg-1",
    }
}

pub async fn machine_with(ledger: MemoryLedger) -> Machine {
    let machine = PhaseStateMachine::new(MemoryStore::new(), ledger, &fast_config());
    for phase in Phase::ALL {
        let id = actor_for(phase);
        machine
            .register_actor(Actor {
                actor_id: id.to_string(),
                display_name: Some(format!("{phase} handler")),
                email: format!("{id}@example.com"),
                role: phase,
                organization: Some("Lotline Co-op".to_string()),
            })
            .await
            .unwrap();
    }
    machine
}

pub async fn machine() -> Machine {
    machine_with(MemoryLedger::new()).await
}

pub fn batch_request(lot_code: &str) -> CreateBatchRequest {
    CreateBatchRequest {
        name: "Arabica".to_string(),
        lot_code: lot_code.to_string(),
        description: Some("washed process".to_string()),
        details: CollectionDetails {
            harvest_date: Some("2025-02-14".to_string()),
            material_name: Some("Arabica cherries".to_string()),
            ..CollectionDetails::default()
        },
        notes: "harvested from plot 4".to_string(),
        evidence: Evidence::default(),
    }
}

pub async fn create(machine: &Machine, lot_code: &str) -> CreatedBatch {
    machine
        .create_batch(actor_for(Phase::Collection), batch_request(lot_code))
        .await
        .unwrap()
}

pub fn decision(batch_id: &str, phase: Phase, decision: Decision) -> DecisionRequest {
    DecisionRequest {
        batch_id: batch_id.to_string(),
        actor_id: actor_for(phase).to_string(),
        actor_phase: phase,
        decision,
        notes: format!("{phase} {decision}"),
        evidence: Evidence::default(),
    }
}

pub async fn decide(
    machine: &Machine,
    batch_id: &str,
    phase: Phase,
    verdict: Decision,
) -> DecisionOutcome {
    machine
        .submit_decision(decision(batch_id, phase, verdict))
        .await
        .unwrap()
}

pub async fn approve_all(machine: &Machine, batch_id: &str) {
    for phase in Phase::ALL {
        decide(machine, batch_id, phase, Decision::Approved).await;
    }
}
