//! Student activity on an assignment: starting and handing in.
//!
//! Participant status only moves forward. Repeating an activity that already
//! happened is a no-op; an explicit request to go back is an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{assignment, assignment::AssignmentStatus, assignment_user, assignment_user::ParticipantStatus};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set, TransactionTrait};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::locks::KeyedLocks;

pub struct ParticipationTracker {
    db: DatabaseConnection,
    participant_locks: Arc<KeyedLocks<i64>>,
}

impl ParticipationTracker {
    pub fn new(db: DatabaseConnection, participant_locks: Arc<KeyedLocks<i64>>) -> Self {
        Self {
            db,
            participant_locks,
        }
    }

    /// Marks the student as working on the assignment.
    pub async fn start_assignment(
        &self,
        assignment_id: i64,
        student_id: i64,
    ) -> EngineResult<assignment_user::Model> {
        self.record_activity(assignment_id, student_id, ParticipantStatus::InProgress)
            .await
    }

    /// Marks the student's work as handed in.
    pub async fn submit_assignment(
        &self,
        assignment_id: i64,
        student_id: i64,
    ) -> EngineResult<assignment_user::Model> {
        self.record_activity(assignment_id, student_id, ParticipantStatus::Submitted)
            .await
    }

    /// Moves a participant to `target`, failing if that would go backwards.
    pub async fn advance(
        &self,
        assignment_user_id: i64,
        target: ParticipantStatus,
    ) -> EngineResult<assignment_user::Model> {
        let _guard = self.participant_locks.lock(assignment_user_id).await;

        let participant = assignment_user::Entity::find_by_id(assignment_user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment_user", assignment_user_id))?;
        if target < participant.status {
            return Err(EngineError::InvalidStateTransition(format!(
                "participant {assignment_user_id} cannot move from {} back to {target}",
                participant.status
            )));
        }
        if target == participant.status {
            return Ok(participant);
        }

        Ok(transition(participant, target, Utc::now())
            .update(&self.db)
            .await?)
    }

    async fn record_activity(
        &self,
        assignment_id: i64,
        student_id: i64,
        target: ParticipantStatus,
    ) -> EngineResult<assignment_user::Model> {
        let now = Utc::now();
        let assignment = assignment::Entity::find_by_id(assignment_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        if assignment.status != AssignmentStatus::Published {
            return Err(EngineError::InvalidStateTransition(format!(
                "assignment {assignment_id} is {}",
                assignment.status
            )));
        }
        if !assignment.accepts_work_at(now) {
            return Err(EngineError::InvalidStateTransition(format!(
                "assignment {assignment_id} is outside its window"
            )));
        }

        let existing = assignment_user::Model::find_for_student(&self.db, assignment_id, student_id)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment_user", student_id))?;

        let _guard = self.participant_locks.lock(existing.id).await;
        let txn = self.db.begin().await?;

        let participant = assignment_user::Entity::find_by_id(existing.id)
            .one(&txn)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment_user", existing.id))?;
        if participant.status >= target {
            return Ok(participant);
        }

        let updated = transition(participant, target, now).update(&txn).await?;
        txn.commit().await?;

        info!(assignment_id, student_id, status = %updated.status, "participant advanced");
        Ok(updated)
    }
}

/// Active model moving `participant` forward to `target`, filling the
/// activity timestamps it skipped.
fn transition(
    participant: assignment_user::Model,
    target: ParticipantStatus,
    now: DateTime<Utc>,
) -> assignment_user::ActiveModel {
    let started = participant.started_at.is_none() && target >= ParticipantStatus::InProgress;
    let submitted = participant.submitted_at.is_none() && target >= ParticipantStatus::Submitted;

    let mut active = participant.into_active_model();
    active.status = Set(target);
    if started {
        active.started_at = Set(Some(now));
    }
    if submitted {
        active.submitted_at = Set(Some(now));
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use db::test_utils::setup_test_db;

    async fn setup(status: AssignmentStatus) -> (ParticipationTracker, assignment::Model, assignment_user::Model) {
        let db = setup_test_db().await;
        let a = assignment::ActiveModel {
            teacher_id: Set(1),
            class_id: Set(1),
            title: Set("Strings".into()),
            allow_late_submission: Set(false),
            status: Set(status),
            max_score: Set(0),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();
        let p = assignment_user::ActiveModel::new_participant(a.id, 5, 0, Utc::now())
            .insert(&db)
            .await
            .unwrap();
        (ParticipationTracker::new(db, Arc::new(KeyedLocks::new())), a, p)
    }

    #[tokio::test]
    async fn start_then_submit_sets_timestamps() {
        let (tracker, a, _) = setup(AssignmentStatus::Published).await;

        let started = tracker.start_assignment(a.id, 5).await.unwrap();
        assert_eq!(started.status, ParticipantStatus::InProgress);
        assert!(started.started_at.is_some());

        let submitted = tracker.submit_assignment(a.id, 5).await.unwrap();
        assert_eq!(submitted.status, ParticipantStatus::Submitted);
        assert_eq!(submitted.started_at, started.started_at);
        assert!(submitted.submitted_at.is_some());

        let again = tracker.start_assignment(a.id, 5).await.unwrap();
        assert_eq!(again.status, ParticipantStatus::Submitted);
    }

    #[tokio::test]
    async fn submit_without_start_fills_both_timestamps() {
        let (tracker, a, _) = setup(AssignmentStatus::Published).await;

        let submitted = tracker.submit_assignment(a.id, 5).await.unwrap();

        assert!(submitted.started_at.is_some() && submitted.submitted_at.is_some());
    }

    #[tokio::test]
    async fn activity_needs_published_open_assignment() {
        let (tracker, a, _) = setup(AssignmentStatus::Draft).await;
        assert!(matches!(
            tracker.start_assignment(a.id, 5).await,
            Err(EngineError::InvalidStateTransition(_))
        ));

        let mut published = a.clone().into_active_model();
        published.status = Set(AssignmentStatus::Published);
        published.end_time = Set(Some(Utc::now() - Duration::minutes(5)));
        published.update(&tracker.db).await.unwrap();
        assert!(matches!(
            tracker.submit_assignment(a.id, 5).await,
            Err(EngineError::InvalidStateTransition(_))
        ));

        assert!(matches!(
            tracker.start_assignment(a.id, 6).await,
            Err(EngineError::InvalidStateTransition(_))
        ));
    }

    #[tokio::test]
    async fn unknown_student_is_not_found() {
        let (tracker, a, _) = setup(AssignmentStatus::Published).await;

        assert!(matches!(
            tracker.start_assignment(a.id, 6).await,
            Err(EngineError::NotFound { entity: "assignment_user", id: 6 })
        ));
    }

    #[tokio::test]
    async fn explicit_regression_is_rejected() {
        let (tracker, _, p) = setup(AssignmentStatus::Published).await;

        tracker.advance(p.id, ParticipantStatus::Graded).await.unwrap();
        let err = tracker.advance(p.id, ParticipantStatus::InProgress).await.unwrap_err();

        assert!(matches!(err, EngineError::InvalidStateTransition(_)));
        let same = tracker.advance(p.id, ParticipantStatus::Graded).await.unwrap();
        assert_eq!(same.status, ParticipantStatus::Graded);
    }
}
