use sea_orm::DbErr;
use thiserror::Error;

use crate::roster::RosterError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced by the engine's operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("roster service error: {0}")]
    ExternalService(#[from] RosterError),

    #[error("validation failed: {0}")]
    Validation(String),

    /// Lost a conditional write more times than the retry budget allows.
    #[error("concurrent write conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("database error: {0}")]
    Database(#[from] DbErr),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::ExternalService(e) => e.is_retryable(),
            EngineError::ConcurrencyConflict(_) => true,
            _ => false,
        }
    }
}

impl From<validator::ValidationErrors> for EngineError {
    fn from(errors: validator::ValidationErrors) -> Self {
        EngineError::Validation(common::format_validation_errors(&errors))
    }
}
