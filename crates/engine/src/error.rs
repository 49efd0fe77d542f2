use lotline_core::FieldIssue;
use lotline_storage::StorageError;

/// Errors surfaced by the state machine and the traceability reader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Missing or malformed input. Nothing was written.
    #[error("validation failed: {}", join_issues(.0))]
    Validation(Vec<FieldIssue>),

    /// Uniqueness violation at creation (duplicate lot code).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The batch moved since the caller looked at it. Refetch before retrying.
    #[error("stale state: {0}")]
    StaleState(String),

    /// A ledger confirmation contradicts an earlier one.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    #[error("evidence unavailable: {0}")]
    EvidenceUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(StorageError),
}

impl EngineError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        EngineError::Validation(vec![FieldIssue::new(field, message)])
    }
}

fn join_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConcurrentConflict { .. } | StorageError::DuplicateDecision { .. } => {
                EngineError::StaleState(err.to_string())
            }
            StorageError::DuplicateLotCode { .. } => EngineError::Conflict(err.to_string()),
            StorageError::BatchNotFound { .. }
            | StorageError::RecordNotFound { .. }
            | StorageError::TaskNotFound { .. }
            | StorageError::ActorNotFound { .. } => EngineError::NotFound(err.to_string()),
            StorageError::Backend(_) => EngineError::Storage(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lotline_core::Phase;

    #[test]
    fn storage_errors_map_to_taxonomy() {
        let stale: EngineError = StorageError::ConcurrentConflict {
            batch_id: "b".into(),
            expected_version: 2,
        }
        .into();
        assert!(matches!(stale, EngineError::StaleState(_)));

        let dup: EngineError = StorageError::DuplicateDecision {
            batch_id: "b".into(),
            phase: Phase::Testing,
        }
        .into();
        assert!(matches!(dup, EngineError::StaleState(_)));

        let conflict: EngineError = StorageError::DuplicateLotCode {
            lot_code: "L".into(),
        }
        .into();
        assert!(matches!(conflict, EngineError::Conflict(_)));

        let missing: EngineError = StorageError::BatchNotFound {
            batch_id: "b".into(),
        }
        .into();
        assert!(matches!(missing, EngineError::NotFound(_)));

        let backend: EngineError = StorageError::Backend("disk".into()).into();
        assert!(matches!(backend, EngineError::Storage(_)));
    }

    #[test]
    fn validation_message_lists_every_issue() {
        let err = EngineError::Validation(vec![
            FieldIssue::new("notes", "required"),
            FieldIssue::new("harvest_date", "expected YYYY-MM-DD"),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: notes: required; harvest_date: expected YYYY-MM-DD"
        );
    }
}
