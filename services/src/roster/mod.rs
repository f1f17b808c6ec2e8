//! Boundary to the external service that owns class rosters.

mod http;
mod memory;

pub use http::HttpRosterProvider;
pub use memory::InMemoryRosterProvider;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RosterError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The service answered with something that is not a roster.
    #[error("unexpected roster response: {0}")]
    Decode(String),
}

impl RosterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RosterError::Network(_) | RosterError::Timeout(_))
    }
}

/// Read-only access to class rosters.
///
/// Implementations should honour `timeout`; callers additionally bound the
/// call and own the retry policy.
#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn get_student_ids_by_class(
        &self,
        class_id: i64,
        timeout: Duration,
    ) -> Result<Vec<i64>, RosterError>;
}
