//! Derives an assignment's max score from its problem set and keeps every
//! participant's copy (and their earned score) in step with it.
//!
//! All functions take the caller's connection so they run inside the
//! caller's transaction; callers own commit/rollback.

use std::collections::HashSet;

use chrono::Utc;
use db::models::{assignment, assignment_problem, assignment_user, best_submission};
use sea_orm::sea_query::Expr;
use sea_orm::{ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, IntoActiveModel, QueryFilter, Set};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

pub struct ScoreAggregator;

impl ScoreAggregator {
    /// Recomputes `Σ points` over the current problem set and stores it on
    /// the assignment.
    pub async fn recompute_max_score<C>(db: &C, assignment_id: i64) -> EngineResult<i64>
    where
        C: ConnectionTrait,
    {
        if assignment::Entity::find_by_id(assignment_id).one(db).await?.is_none() {
            return Err(EngineError::not_found("assignment", assignment_id));
        }

        let max_score = assignment_problem::Model::total_points(db, assignment_id).await?;
        assignment::Model::set_max_score(db, assignment_id, max_score).await?;

        debug!(assignment_id, max_score, "recomputed max score");
        Ok(max_score)
    }

    /// Writes `max_score` to every participant of the assignment in a single
    /// statement. Returns the number of rows touched.
    pub async fn propagate_max_score<C>(
        db: &C,
        assignment_id: i64,
        max_score: i64,
    ) -> EngineResult<u64>
    where
        C: ConnectionTrait,
    {
        let res = assignment_user::Entity::update_many()
            .col_expr(assignment_user::Column::MaxScore, Expr::value(max_score))
            .col_expr(assignment_user::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(assignment_user::Column::AssignmentId.eq(assignment_id))
            .exec(db)
            .await?;

        debug!(assignment_id, max_score, rows = res.rows_affected, "propagated max score");
        Ok(res.rows_affected)
    }

    /// Recompute followed by propagate.
    pub async fn refresh<C>(db: &C, assignment_id: i64) -> EngineResult<i64>
    where
        C: ConnectionTrait,
    {
        let max_score = Self::recompute_max_score(db, assignment_id).await?;
        Self::propagate_max_score(db, assignment_id, max_score).await?;
        Ok(max_score)
    }

    /// Sets a participant's score to the sum of their cached best scores on
    /// problems still attached to the assignment. `None` when nothing has
    /// been graded.
    pub async fn recompute_participant_score<C>(
        db: &C,
        participant: assignment_user::Model,
    ) -> EngineResult<assignment_user::Model>
    where
        C: ConnectionTrait,
    {
        let problem_ids: HashSet<i64> =
            assignment_problem::Model::find_by_assignment(db, participant.assignment_id)
                .await?
                .into_iter()
                .map(|p| p.problem_id)
                .collect();

        let best: Vec<best_submission::Model> =
            best_submission::Model::find_by_participant(db, participant.id)
                .await?
                .into_iter()
                .filter(|b| problem_ids.contains(&b.problem_id))
                .collect();

        let score = if best.is_empty() {
            None
        } else {
            Some(best.iter().map(|b| b.score).sum())
        };

        if participant.score == score {
            return Ok(participant);
        }

        let mut active = participant.into_active_model();
        active.score = Set(score);
        Ok(active.update(db).await?)
    }

    /// Recomputes the score of every participant. Unchanged scores are not
    /// written.
    pub async fn recompute_scores_for_assignment<C>(
        db: &C,
        assignment_id: i64,
    ) -> EngineResult<()>
    where
        C: ConnectionTrait,
    {
        for participant in assignment_user::Model::find_by_assignment(db, assignment_id).await? {
            Self::recompute_participant_score(db, participant).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ScoreAggregator;
    use crate::error::EngineError;
    use chrono::Utc;
    use db::models::{assignment, assignment_problem, assignment_user, problem};
    use db::test_utils::setup_test_db;
    use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, Set, TransactionTrait};

    async fn seed(db: &DatabaseConnection, points: &[i64]) -> assignment::Model {
        let a = assignment::ActiveModel {
            teacher_id: Set(1),
            class_id: Set(1),
            title: Set("Sorting".into()),
            allow_late_submission: Set(false),
            status: Set(assignment::AssignmentStatus::Draft),
            max_score: Set(0),
            ..Default::default()
        }
        .insert(db)
        .await
        .unwrap();

        for (i, p) in points.iter().enumerate() {
            let problem = problem::Model::create(db, "p").await.unwrap();
            assignment_problem::ActiveModel {
                assignment_id: Set(a.id),
                problem_id: Set(problem.id),
                points: Set(*p),
                order_index: Set(i as i32),
                ..Default::default()
            }
            .insert(db)
            .await
            .unwrap();
        }
        a
    }

    #[tokio::test]
    async fn refresh_sets_sum_on_assignment_and_participants() {
        let db = setup_test_db().await;
        let a = seed(&db, &[100, 150]).await;
        for student in [1, 2, 3] {
            assignment_user::ActiveModel::new_participant(a.id, student, 0, Utc::now())
                .insert(&db)
                .await
                .unwrap();
        }

        let max = ScoreAggregator::refresh(&db, a.id).await.unwrap();

        assert_eq!(max, 250);
        let reloaded = assignment::Entity::find_by_id(a.id).one(&db).await.unwrap().unwrap();
        assert_eq!(reloaded.max_score, 250);
        let participants = assignment_user::Model::find_by_assignment(&db, a.id).await.unwrap();
        assert!(participants.iter().all(|p| p.max_score == 250));
    }

    #[tokio::test]
    async fn empty_problem_set_yields_zero() {
        let db = setup_test_db().await;
        let a = seed(&db, &[]).await;

        assert_eq!(ScoreAggregator::recompute_max_score(&db, a.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_assignment_is_not_found() {
        let db = setup_test_db().await;

        let err = ScoreAggregator::recompute_max_score(&db, 404).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "assignment", id: 404 }));
    }

    #[tokio::test]
    async fn rolled_back_propagation_leaves_prior_values() {
        let db = setup_test_db().await;
        let a = seed(&db, &[40]).await;
        ScoreAggregator::refresh(&db, a.id).await.unwrap();
        assignment_user::ActiveModel::new_participant(a.id, 1, 40, Utc::now())
            .insert(&db)
            .await
            .unwrap();

        let txn = db.begin().await.unwrap();
        ScoreAggregator::propagate_max_score(&txn, a.id, 999).await.unwrap();
        txn.rollback().await.unwrap();

        let participants = assignment_user::Model::find_by_assignment(&db, a.id).await.unwrap();
        assert_eq!(participants[0].max_score, 40);
    }
}
