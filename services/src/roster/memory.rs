use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{RosterError, RosterProvider};

/// Roster provider holding rosters in memory.
///
/// Used for local runs and tests. Queued failures are returned, in order,
/// before the next successful answers.
#[derive(Default)]
pub struct InMemoryRosterProvider {
    rosters: Mutex<HashMap<i64, Vec<i64>>>,
    failures: Mutex<VecDeque<RosterError>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl InMemoryRosterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_roster(&self, class_id: i64, student_ids: Vec<i64>) {
        self.rosters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(class_id, student_ids);
    }

    pub fn enroll(&self, class_id: i64, student_id: i64) {
        let mut rosters = self.rosters.lock().unwrap_or_else(|e| e.into_inner());
        let roster = rosters.entry(class_id).or_default();
        if !roster.contains(&student_id) {
            roster.push(student_id);
        }
    }

    pub fn unenroll(&self, class_id: i64, student_id: i64) {
        let mut rosters = self.rosters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(roster) = rosters.get_mut(&class_id) {
            roster.retain(|id| *id != student_id);
        }
    }

    /// Makes the next `count` calls fail with `error`.
    pub fn fail_next(&self, count: usize, error: RosterError) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..count {
            failures.push_back(error.clone());
        }
    }

    /// Delays every answer, for exercising caller-side timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RosterProvider for InMemoryRosterProvider {
    async fn get_student_ids_by_class(
        &self,
        class_id: i64,
        _timeout: Duration,
    ) -> Result<Vec<i64>, RosterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(error) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(error);
        }

        Ok(self
            .rosters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&class_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_failures_come_first() {
        let provider = InMemoryRosterProvider::new();
        provider.set_roster(1, vec![3, 4]);
        provider.fail_next(1, RosterError::Network("down".into()));

        let timeout = Duration::from_secs(1);
        assert!(provider.get_student_ids_by_class(1, timeout).await.is_err());
        assert_eq!(provider.get_student_ids_by_class(1, timeout).await.unwrap(), vec![3, 4]);
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn enrollment_edits_and_unknown_class() {
        let provider = InMemoryRosterProvider::new();
        provider.enroll(2, 8);
        provider.enroll(2, 8);
        provider.enroll(2, 9);
        provider.unenroll(2, 8);

        let timeout = Duration::from_secs(1);
        assert_eq!(provider.get_student_ids_by_class(2, timeout).await.unwrap(), vec![9]);
        assert!(provider.get_student_ids_by_class(5, timeout).await.unwrap().is_empty());
    }
}
