use thiserror::Error;

/// Errors raised while computing or applying a settlement
#[derive(Debug, Error)]
pub enum SettlementError {
    /// Calculator called with bad input. Caller bug, never retried.
    #[error("invalid settlement input: {0}")]
    InvalidInput(String),

    /// Game is not completed with both scores yet
    #[error("game {game_id} cannot be settled yet: {reason}")]
    PreconditionNotMet { game_id: String, reason: String },

    #[error("game {0} not found")]
    GameNotFound(String),

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("concurrent settlement conflict: {0}")]
    ConcurrencyConflict(String),
}

impl SettlementError {
    /// Whether running the whole operation again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementError::PersistenceFailure(_) | SettlementError::ConcurrencyConflict(_)
        )
    }
}

impl From<rusqlite::Error> for SettlementError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                SettlementError::ConcurrencyConflict(err.to_string())
            }
            _ => SettlementError::PersistenceFailure(err.to_string()),
        }
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
