//! Conformance test suite for `RecordStore` implementations.
//!
//! This module provides a backend-agnostic test suite that any `RecordStore`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Initialization**: batch creation, lot code uniqueness
//! - **Snapshot rollback**: aborted and dropped snapshots leave no trace
//! - **Atomic commit**: batch, record and outbox task land together
//! - **Version validation / OCC**: optimistic concurrency conflict detection
//! - **Outbox**: task filtering, retries, set-if-null confirmation fields
//! - **Error handling**: correct error variants for invalid operations
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty store for each test:
//!
//! ```ignore
//! use lotline_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn postgres_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         create_test_postgres_store().await
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod commit;
mod concurrent;
mod error;
mod init;
mod outbox;
mod snapshot;
mod version;

use std::fmt;
use std::future::Future;

use lotline_core::{Decision, Evidence, Phase};

use crate::record::{BatchRecord, NewBatch, NewPhaseRecord};
use crate::RecordStore;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "init", "snapshot", "commit").
    pub category: String,
    /// Test name (e.g. "insert_batch_starts_at_collection_pending").
    pub name: String,
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// store, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: RecordStore,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(init::run_init_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(commit::run_commit_tests(&factory).await);
    results.extend(version::run_version_tests(&factory).await);
    results.extend(outbox::run_outbox_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn make_new_batch(lot_code: &str) -> NewBatch {
    NewBatch {
        name: "Arabica green beans".to_string(),
        lot_code: lot_code.to_string(),
        description: Some("conformance fixture".to_string()),
        created_by: "collector-1".to_string(),
    }
}

fn make_record(batch_id: &str, phase: Phase, decision: Option<Decision>) -> NewPhaseRecord {
    NewPhaseRecord {
        batch_id: batch_id.to_string(),
        phase,
        handler_id: format!("{phase}-handler"),
        decision,
        notes: "conformance notes".to_string(),
        evidence: Evidence::default(),
        details: None,
    }
}

/// Insert and commit one batch.
async fn seed_batch<S: RecordStore>(storage: &S, lot_code: &str) -> Result<BatchRecord, String> {
    let mut snap = storage
        .begin_snapshot()
        .await
        .map_err(|e| format!("begin: {e}"))?;
    let batch = storage
        .insert_batch(&mut snap, make_new_batch(lot_code))
        .await
        .map_err(|e| format!("insert_batch: {e}"))?;
    storage
        .commit_snapshot(snap)
        .await
        .map_err(|e| format!("commit: {e}"))?;
    Ok(batch)
}
