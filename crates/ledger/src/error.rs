/// Classified failure of a ledger call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// Connectivity or signing failure. Retried with backoff.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// The ledger refused the write. Retrying the same write cannot succeed.
    #[error("ledger rejected write: {0}")]
    Rejected(String),

    /// No confirmation arrived in time. The write may still land.
    #[error("ledger timeout: {0}")]
    Timeout(String),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Unavailable(_) | LedgerError::Timeout(_))
    }
}
