//! Reconciles assignment participants with the class roster owned by the
//! roster service.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use db::models::{
    assignment, assignment_user,
    assignment_user::ParticipantStatus,
    roster_sync_failure::{self, SyncMode},
};
use sea_orm::sea_query::OnConflict;
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::locks::KeyedLocks;
use crate::roster::{RosterError, RosterProvider};

/// What a sync did to an assignment's participants. Student ids are sorted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub assignment_id: i64,
    pub class_id: i64,
    pub mode: SyncMode,
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
    /// Off the roster but kept because they already have activity.
    pub retained: Vec<i64>,
    /// The assignment no longer targets `class_id`; nothing was applied.
    pub stale: bool,
}

impl SyncReport {
    fn empty(assignment_id: i64, class_id: i64, mode: SyncMode) -> Self {
        Self {
            assignment_id,
            class_id,
            mode,
            added: Vec::new(),
            removed: Vec::new(),
            retained: Vec::new(),
            stale: false,
        }
    }

    fn stale(assignment_id: i64, class_id: i64, mode: SyncMode) -> Self {
        Self {
            stale: true,
            ..Self::empty(assignment_id, class_id, mode)
        }
    }
}

/// Outcome of a dead-letter reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub resolved: usize,
    pub still_failing: usize,
    /// Jobs that can never apply (e.g. a full resync after publishing).
    pub abandoned: usize,
}

pub struct RosterSyncCoordinator {
    db: DatabaseConnection,
    provider: Arc<dyn RosterProvider>,
    assignment_locks: Arc<KeyedLocks<i64>>,
    config: EngineConfig,
}

impl RosterSyncCoordinator {
    pub fn new(
        db: DatabaseConnection,
        provider: Arc<dyn RosterProvider>,
        assignment_locks: Arc<KeyedLocks<i64>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            provider,
            assignment_locks,
            config,
        }
    }

    /// Fetches a class roster, retrying transient failures with exponential
    /// backoff. Every call is bounded by the configured timeout.
    pub async fn fetch_roster(&self, class_id: i64) -> Result<BTreeSet<i64>, RosterError> {
        let policy = &self.config.roster_retry;
        let timeout = self.config.roster_timeout;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match tokio::time::timeout(
                timeout,
                self.provider.get_student_ids_by_class(class_id, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RosterError::Timeout(timeout)),
            };

            match result {
                Ok(ids) => {
                    debug!(class_id, attempt, students = ids.len(), "fetched roster");
                    return Ok(ids.into_iter().collect());
                }
                Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(class_id, attempt, ?delay, error = %err, "roster fetch failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(class_id, attempt, error = %err, "roster fetch failed");
                    return Err(err);
                }
            }
        }
    }

    /// Fetch attempts a failed sync consumed.
    pub fn attempts_spent(&self, error: &EngineError) -> u32 {
        match error {
            EngineError::ExternalService(e) if e.is_retryable() => self.config.roster_retry.max_attempts,
            _ => 1,
        }
    }

    /// Brings the assignment's participants in line with the roster of
    /// `class_id`.
    ///
    /// The roster is fetched before any lock or transaction is taken, so a
    /// failing roster service never leaves partial writes behind.
    pub async fn sync_roster(
        &self,
        assignment_id: i64,
        class_id: i64,
        mode: SyncMode,
    ) -> EngineResult<SyncReport> {
        let current = assignment::Entity::find_by_id(assignment_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        if current.class_id != class_id {
            info!(assignment_id, class_id, current_class = current.class_id, "skipping stale roster sync");
            return Ok(SyncReport::stale(assignment_id, class_id, mode));
        }
        check_mode(&current, mode)?;

        let roster = self.fetch_roster(class_id).await?;

        let _guard = self.assignment_locks.lock(assignment_id).await;
        let txn = self.db.begin().await?;

        // Re-read under the lock; the assignment may have moved meanwhile.
        let assignment = assignment::Entity::find_by_id(assignment_id)
            .one(&txn)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        if assignment.class_id != class_id {
            info!(assignment_id, class_id, current_class = assignment.class_id, "skipping stale roster sync");
            return Ok(SyncReport::stale(assignment_id, class_id, mode));
        }
        check_mode(&assignment, mode)?;

        let existing = assignment_user::Model::find_by_assignment(&txn, assignment_id).await?;
        let mut report = SyncReport::empty(assignment_id, class_id, mode);
        let mut doomed = Vec::new();
        let to_add: Vec<i64> = match mode {
            SyncMode::Full => {
                for participant in &existing {
                    doomed.push(participant.id);
                    report.removed.push(participant.student_id);
                }
                roster.iter().copied().collect()
            }
            SyncMode::Incremental => {
                let present: BTreeSet<i64> = existing.iter().map(|p| p.student_id).collect();
                for participant in existing.iter().filter(|p| !roster.contains(&p.student_id)) {
                    if participant.status == ParticipantStatus::NotStarted {
                        doomed.push(participant.id);
                        report.removed.push(participant.student_id);
                    } else {
                        report.retained.push(participant.student_id);
                    }
                }
                roster.difference(&present).copied().collect()
            }
        };

        assignment_user::Model::delete_with_dependents(&txn, &doomed).await?;

        if !to_add.is_empty() {
            let now = Utc::now();
            let rows = to_add.iter().map(|&student_id| {
                assignment_user::ActiveModel::new_participant(
                    assignment_id,
                    student_id,
                    assignment.max_score,
                    now,
                )
            });
            assignment_user::Entity::insert_many(rows)
                .on_conflict(
                    OnConflict::columns([
                        assignment_user::Column::AssignmentId,
                        assignment_user::Column::StudentId,
                    ])
                    .do_nothing()
                    .to_owned(),
                )
                .exec_without_returning(&txn)
                .await?;
        }
        report.added = to_add;

        txn.commit().await?;

        info!(
            assignment_id,
            class_id,
            %mode,
            added = report.added.len(),
            removed = report.removed.len(),
            retained = report.retained.len(),
            "roster synced"
        );
        Ok(report)
    }

    /// Stores a sync that could not be applied so a later pass can retry it.
    pub async fn dead_letter(
        &self,
        assignment_id: i64,
        class_id: i64,
        mode: SyncMode,
        attempts: u32,
        error: &str,
    ) -> EngineResult<roster_sync_failure::Model> {
        let attempts = i32::try_from(attempts).unwrap_or(i32::MAX);
        Ok(roster_sync_failure::Model::record(
            &self.db,
            assignment_id,
            class_id,
            mode,
            attempts,
            error,
        )
        .await?)
    }

    /// Replays every unresolved dead letter.
    pub async fn reconcile_failures(&self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for failure in roster_sync_failure::Model::find_unresolved(&self.db).await? {
            let id = failure.id;
            match self
                .sync_roster(failure.assignment_id, failure.class_id, failure.mode)
                .await
            {
                Ok(_) => {
                    failure.mark_resolved(&self.db).await?;
                    report.resolved += 1;
                }
                Err(err @ (EngineError::InvalidStateTransition(_) | EngineError::NotFound { .. })) => {
                    warn!(failure_id = id, error = %err, "abandoning roster sync");
                    failure.mark_resolved(&self.db).await?;
                    report.abandoned += 1;
                }
                Err(err) => {
                    let attempts = i32::try_from(self.attempts_spent(&err)).unwrap_or(i32::MAX);
                    failure.record_retry(&self.db, attempts, &err.to_string()).await?;
                    report.still_failing += 1;
                }
            }
        }

        if report != ReconcileReport::default() {
            info!(
                resolved = report.resolved,
                still_failing = report.still_failing,
                abandoned = report.abandoned,
                "reconciled roster sync failures"
            );
        }
        Ok(report)
    }
}

fn check_mode(assignment: &assignment::Model, mode: SyncMode) -> EngineResult<()> {
    if mode == SyncMode::Full && !assignment.is_draft() {
        return Err(EngineError::InvalidStateTransition(format!(
            "full roster resync of assignment {} requires draft, found {}",
            assignment.id, assignment.status
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::roster::InMemoryRosterProvider;
    use db::models::assignment::AssignmentStatus;
    use db::test_utils::setup_test_db;
    use sea_orm::{ActiveModelTrait, IntoActiveModel, Set};
    use std::time::Duration;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            roster_timeout: Duration::from_millis(50),
            roster_retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
            ..EngineConfig::default()
        }
    }

    async fn setup() -> (RosterSyncCoordinator, Arc<InMemoryRosterProvider>, assignment::Model) {
        let db = setup_test_db().await;
        let a = assignment::ActiveModel {
            teacher_id: Set(1),
            class_id: Set(7),
            title: Set("Loops".into()),
            allow_late_submission: Set(false),
            status: Set(AssignmentStatus::Draft),
            max_score: Set(250),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let provider = Arc::new(InMemoryRosterProvider::new());
        let coordinator = RosterSyncCoordinator::new(
            db,
            provider.clone(),
            Arc::new(KeyedLocks::new()),
            fast_config(),
        );
        (coordinator, provider, a)
    }

    async fn students(c: &RosterSyncCoordinator, assignment_id: i64) -> Vec<i64> {
        assignment_user::Model::find_by_assignment(&c.db, assignment_id)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.student_id)
            .collect()
    }

    #[tokio::test]
    async fn sync_adds_roster_with_current_max_score() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![3, 1, 2, 2]);

        let report = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        assert_eq!(report.added, vec![1, 2, 3]);
        let rows = assignment_user::Model::find_by_assignment(&c.db, a.id).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.max_score == 250 && r.status == ParticipantStatus::NotStarted));
    }

    #[tokio::test]
    async fn repeated_sync_is_idempotent() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![1, 2, 3]);

        c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();
        let second = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        assert!(second.added.is_empty() && second.removed.is_empty());
        assert_eq!(students(&c, a.id).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn incremental_prunes_only_inactive_departures() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![1, 2, 3]);
        c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        let active = assignment_user::Model::find_for_student(&c.db, a.id, 2)
            .await
            .unwrap()
            .unwrap();
        let mut active = active.into_active_model();
        active.status = Set(ParticipantStatus::InProgress);
        active.update(&c.db).await.unwrap();

        provider.set_roster(7, vec![1, 4]);
        let report = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        assert_eq!(report.added, vec![4]);
        assert_eq!(report.removed, vec![3]);
        assert_eq!(report.retained, vec![2]);
        assert_eq!(students(&c, a.id).await, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![5]);
        provider.fail_next(2, RosterError::Network("reset".into()));

        let report = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        assert_eq!(report.added, vec![5]);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_write_nothing() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![5]);
        provider.fail_next(3, RosterError::Network("down".into()));

        let err = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap_err();

        assert!(matches!(err, EngineError::ExternalService(RosterError::Network(_))));
        assert!(err.is_retryable());
        assert_eq!(c.attempts_spent(&err), 3);
        assert!(students(&c, a.id).await.is_empty());
    }

    #[tokio::test]
    async fn decode_errors_are_not_retried() {
        let (c, provider, a) = setup().await;
        provider.fail_next(1, RosterError::Decode("html".into()));

        let err = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap_err();

        assert!(matches!(err, EngineError::ExternalService(RosterError::Decode(_))));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![1]);
        provider.set_delay(Some(Duration::from_millis(500)));

        let err = c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap_err();

        assert!(matches!(err, EngineError::ExternalService(RosterError::Timeout(_))));
    }

    #[tokio::test]
    async fn stale_jobs_apply_nothing() {
        let (c, provider, a) = setup().await;
        provider.set_roster(8, vec![1, 2]);

        let report = c.sync_roster(a.id, 8, SyncMode::Incremental).await.unwrap();

        assert!(report.stale);
        assert_eq!(provider.calls(), 0);
        assert!(students(&c, a.id).await.is_empty());
    }

    #[tokio::test]
    async fn full_resync_requires_draft() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![1, 2]);
        c.sync_roster(a.id, 7, SyncMode::Incremental).await.unwrap();

        provider.set_roster(7, vec![2, 9]);
        let report = c.sync_roster(a.id, 7, SyncMode::Full).await.unwrap();
        assert_eq!(report.removed, vec![1, 2]);
        assert_eq!(students(&c, a.id).await, vec![2, 9]);

        let mut published = a.clone().into_active_model();
        published.status = Set(AssignmentStatus::Published);
        published.update(&c.db).await.unwrap();

        let err = c.sync_roster(a.id, 7, SyncMode::Full).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn reconcile_replays_and_resolves_dead_letters() {
        let (c, provider, a) = setup().await;
        provider.set_roster(7, vec![1]);
        c.dead_letter(a.id, 7, SyncMode::Incremental, 3, "down").await.unwrap();
        provider.fail_next(3, RosterError::Network("still down".into()));

        let first = c.reconcile_failures().await.unwrap();
        assert_eq!(first.still_failing, 1);
        let pending = roster_sync_failure::Model::find_unresolved(&c.db).await.unwrap();
        assert_eq!(pending[0].attempts, 6);

        let second = c.reconcile_failures().await.unwrap();
        assert_eq!(second.resolved, 1);
        assert!(roster_sync_failure::Model::find_unresolved(&c.db).await.unwrap().is_empty());
        assert_eq!(students(&c, a.id).await, vec![1]);
    }
}
