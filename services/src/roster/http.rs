use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use super::{RosterError, RosterProvider};

#[derive(Debug, Deserialize)]
struct RosterResponse {
    student_ids: Vec<i64>,
}

/// Roster provider backed by the class service's HTTP API:
/// `GET {base_url}/classes/{class_id}/students` → `{"student_ids": [..]}`.
#[derive(Debug, Clone)]
pub struct HttpRosterProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRosterProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    pub fn students_url(&self, class_id: i64) -> String {
        format!("{}/classes/{}/students", self.base_url, class_id)
    }
}

#[async_trait]
impl RosterProvider for HttpRosterProvider {
    async fn get_student_ids_by_class(
        &self,
        class_id: i64,
        timeout: Duration,
    ) -> Result<Vec<i64>, RosterError> {
        let url = self.students_url(class_id);
        debug!(class_id, %url, "fetching roster");

        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        if let Some(err) = status_error(response.status()) {
            return Err(err);
        }

        let body: RosterResponse = response
            .json()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        Ok(body.student_ids)
    }
}

/// Server-side failures and throttling are worth retrying; any other
/// non-success answer will not change on its own.
fn status_error(status: StatusCode) -> Option<RosterError> {
    if status.is_success() {
        return None;
    }
    let message = format!("roster service returned {status}");
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Some(RosterError::Network(message))
    } else {
        Some(RosterError::Decode(message))
    }
}

/// Only a body that arrived whole but did not parse is a decode failure; a
/// connection dropped mid-body is a network failure.
fn transport_error(err: reqwest::Error, timeout: Duration) -> RosterError {
    if err.is_timeout() {
        RosterError::Timeout(timeout)
    } else if err.is_decode() {
        RosterError::Decode(err.to_string())
    } else {
        RosterError::Network(err.to_string())
    }
}
