//! Maintains the single best graded submission per participant and problem.
//!
//! Writers for the same pair are serialised by an in-process lock, and every
//! write is conditional on the row's version so that a second process racing
//! on the same database re-reads instead of overwriting.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{
    assignment, assignment_problem, assignment_user, assignment_user::ParticipantStatus,
    best_submission, submission,
};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, Set, SqlErr, TransactionTrait,
};
use serde::Deserialize;
use tracing::{debug, info};
use validator::{Validate, ValidationError};

use crate::error::{EngineError, EngineResult};
use crate::locks::KeyedLocks;
use crate::score_aggregator::ScoreAggregator;

/// Sort key for submissions of one pair; greater is better.
///
/// Higher score wins, then lower run time, then lower memory, then the later
/// submission, then the higher submission id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRank {
    pub score: i64,
    pub total_time: i64,
    pub total_memory: i64,
    pub submitted_at: DateTime<Utc>,
    pub submission_id: i64,
}

impl Ord for SubmissionRank {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.total_time.cmp(&self.total_time))
            .then_with(|| other.total_memory.cmp(&self.total_memory))
            .then_with(|| self.submitted_at.cmp(&other.submitted_at))
            .then_with(|| self.submission_id.cmp(&other.submission_id))
    }
}

impl PartialOrd for SubmissionRank {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&submission::Model> for SubmissionRank {
    fn from(s: &submission::Model) -> Self {
        Self {
            score: s.score,
            total_time: s.total_time,
            total_memory: s.total_memory,
            submitted_at: s.submitted_at,
            submission_id: s.id,
        }
    }
}

impl From<&best_submission::Model> for SubmissionRank {
    fn from(b: &best_submission::Model) -> Self {
        Self {
            score: b.score,
            total_time: b.total_time,
            total_memory: b.total_memory,
            submitted_at: b.submitted_at,
            submission_id: b.submission_id,
        }
    }
}

/// A scored submission handed over by the grading pipeline.
#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "score_within_max"))]
pub struct GradedSubmission {
    pub assignment_user_id: i64,
    pub problem_id: i64,
    #[validate(range(min = 0))]
    pub score: i64,
    #[validate(range(min = 0))]
    pub max_score: i64,
    #[validate(range(min = 0))]
    pub total_time: i64,
    #[validate(range(min = 0))]
    pub total_memory: i64,
    pub submitted_at: DateTime<Utc>,
}

fn score_within_max(graded: &GradedSubmission) -> Result<(), ValidationError> {
    if graded.score > graded.max_score {
        return Err(ValidationError::new("score")
            .with_message("score must not exceed max_score".into()));
    }
    Ok(())
}

/// What happened to the best row of a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// First graded submission for the pair.
    Inserted(best_submission::Model),
    Replaced(best_submission::Model),
    /// The incoming submission did not beat the current best.
    Unchanged(best_submission::Model),
}

impl Selection {
    pub fn best(&self) -> &best_submission::Model {
        match self {
            Selection::Inserted(b) | Selection::Replaced(b) | Selection::Unchanged(b) => b,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, Selection::Unchanged(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub student_id: i64,
    pub best: best_submission::Model,
}

pub struct BestSubmissionSelector {
    db: DatabaseConnection,
    pair_locks: KeyedLocks<(i64, i64)>,
    participant_locks: Arc<KeyedLocks<i64>>,
    max_cas_attempts: u32,
}

impl BestSubmissionSelector {
    pub fn new(
        db: DatabaseConnection,
        participant_locks: Arc<KeyedLocks<i64>>,
        max_cas_attempts: u32,
    ) -> Self {
        Self {
            db,
            pair_locks: KeyedLocks::new(),
            participant_locks,
            max_cas_attempts: max_cas_attempts.max(1),
        }
    }

    /// Stores a graded submission and runs best-submission selection on it.
    ///
    /// The participant must exist, the problem must belong to the
    /// participant's assignment and the submission must fall inside the
    /// assignment window unless late work is allowed.
    pub async fn record_graded_submission(
        &self,
        graded: GradedSubmission,
    ) -> EngineResult<(submission::Model, Selection)> {
        graded.validate()?;

        let participant = assignment_user::Entity::find_by_id(graded.assignment_user_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment_user", graded.assignment_user_id))?;
        let assignment = assignment::Entity::find_by_id(participant.assignment_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", participant.assignment_id))?;

        if assignment_problem::Model::find_one(&self.db, assignment.id, graded.problem_id)
            .await?
            .is_none()
        {
            return Err(EngineError::Validation(format!(
                "problem {} is not part of assignment {}",
                graded.problem_id, assignment.id
            )));
        }
        if !assignment.accepts_work_at(graded.submitted_at) {
            return Err(EngineError::InvalidStateTransition(format!(
                "assignment {} does not accept work submitted at {}",
                assignment.id, graded.submitted_at
            )));
        }

        let pair = (graded.assignment_user_id, graded.problem_id);
        let (stored, selection) = {
            let _guard = self.pair_locks.lock(pair).await;
            self.store_and_select(&graded).await?
        };

        log_selection(&stored, &selection);
        self.finalize_participant(stored.assignment_user_id).await?;
        Ok((stored, selection))
    }

    /// Inserts the submission and settles the best row in one transaction,
    /// so a failed selection leaves no orphaned submission behind.
    async fn store_and_select(
        &self,
        graded: &GradedSubmission,
    ) -> EngineResult<(submission::Model, Selection)> {
        for attempt in 1..=self.max_cas_attempts {
            let txn = self.db.begin().await?;

            let stored = submission::ActiveModel {
                assignment_user_id: Set(graded.assignment_user_id),
                problem_id: Set(graded.problem_id),
                score: Set(graded.score),
                max_score: Set(graded.max_score),
                total_time: Set(graded.total_time),
                total_memory: Set(graded.total_memory),
                submitted_at: Set(graded.submitted_at),
                ..Default::default()
            }
            .insert(&txn)
            .await?;

            let observed =
                best_submission::Model::find_for_pair(&txn, stored.assignment_user_id, stored.problem_id)
                    .await?;
            if let Some(selection) = apply_selection(&txn, &stored, observed).await? {
                txn.commit().await?;
                return Ok((stored, selection));
            }
            debug!(
                assignment_user_id = graded.assignment_user_id,
                problem_id = graded.problem_id,
                attempt,
                "lost best submission race, retrying"
            );
        }

        Err(conflict(graded.assignment_user_id, graded.problem_id))
    }

    /// Considers an already persisted graded submission for the best slot of
    /// its pair, then refreshes the participant's score and status.
    pub async fn on_submission_graded(&self, s: &submission::Model) -> EngineResult<Selection> {
        let selection = {
            let _guard = self.pair_locks.lock((s.assignment_user_id, s.problem_id)).await;
            self.select(s).await?
        };

        log_selection(s, &selection);
        self.finalize_participant(s.assignment_user_id).await?;
        Ok(selection)
    }

    async fn select(&self, s: &submission::Model) -> EngineResult<Selection> {
        for attempt in 1..=self.max_cas_attempts {
            let txn = self.db.begin().await?;

            let observed =
                best_submission::Model::find_for_pair(&txn, s.assignment_user_id, s.problem_id).await?;
            if let Some(selection) = apply_selection(&txn, s, observed).await? {
                txn.commit().await?;
                return Ok(selection);
            }
            debug!(submission_id = s.id, attempt, "lost best submission race, re-reading");
        }

        Err(conflict(s.assignment_user_id, s.problem_id))
    }

    /// Rewrites a submission's score and re-selects the best of its pair.
    /// The only path that may lower a best submission.
    pub async fn regrade(&self, submission_id: i64, new_score: i64) -> EngineResult<Selection> {
        let original = submission::Entity::find_by_id(submission_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("submission", submission_id))?;
        if new_score < 0 || new_score > original.max_score {
            return Err(EngineError::Validation(format!(
                "score {new_score} outside 0..={}",
                original.max_score
            )));
        }

        let pair = (original.assignment_user_id, original.problem_id);
        let selection = {
            let _guard = self.pair_locks.lock(pair).await;
            let txn = self.db.begin().await?;

            let mut active = original.into_active_model();
            active.score = Set(new_score);
            let regraded = active.update(&txn).await?;

            let candidates = submission::Model::find_for_pair(&txn, pair.0, pair.1).await?;
            let winner = candidates
                .iter()
                .max_by_key(|c| SubmissionRank::from(*c))
                .unwrap_or(&regraded);

            let selection = match best_submission::Model::find_for_pair(&txn, pair.0, pair.1).await? {
                None => Selection::Inserted(
                    best_submission::ActiveModel::from_submission(winner)
                        .insert(&txn)
                        .await?,
                ),
                Some(current) if current_matches(&current, winner) => Selection::Unchanged(current),
                Some(current) => match compare_and_set(&txn, &current, winner).await? {
                    Some(updated) => Selection::Replaced(updated),
                    None => {
                        return Err(EngineError::ConcurrencyConflict(format!(
                            "best submission {} changed during regrade",
                            current.id
                        )));
                    }
                },
            };

            txn.commit().await?;
            selection
        };

        info!(submission_id, new_score, best_submission_id = selection.best().submission_id, "regraded submission");
        self.finalize_participant(pair.0).await?;
        Ok(selection)
    }

    /// Recomputes the participant's score and marks them graded.
    async fn finalize_participant(&self, assignment_user_id: i64) -> EngineResult<()> {
        let _guard = self.participant_locks.lock(assignment_user_id).await;
        let txn = self.db.begin().await?;

        let participant = assignment_user::Entity::find_by_id(assignment_user_id)
            .one(&txn)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment_user", assignment_user_id))?;
        let participant = ScoreAggregator::recompute_participant_score(&txn, participant).await?;

        if participant.status < ParticipantStatus::Graded {
            let mut active = participant.into_active_model();
            active.status = Set(ParticipantStatus::Graded);
            active.update(&txn).await?;
        }

        txn.commit().await?;
        Ok(())
    }

    pub async fn get_best_submission(
        &self,
        assignment_user_id: i64,
        problem_id: i64,
    ) -> EngineResult<Option<best_submission::Model>> {
        Ok(best_submission::Model::find_for_pair(&self.db, assignment_user_id, problem_id).await?)
    }

    pub async fn list_best_submissions(
        &self,
        assignment_user_id: i64,
    ) -> EngineResult<Vec<best_submission::Model>> {
        Ok(best_submission::Model::find_by_participant(&self.db, assignment_user_id).await?)
    }

    /// Best submissions of one problem across the assignment, best first.
    pub async fn leaderboard(
        &self,
        assignment_id: i64,
        problem_id: i64,
    ) -> EngineResult<Vec<LeaderboardEntry>> {
        if assignment::Entity::find_by_id(assignment_id).one(&self.db).await?.is_none() {
            return Err(EngineError::not_found("assignment", assignment_id));
        }

        let students: HashMap<i64, i64> =
            assignment_user::Model::find_by_assignment(&self.db, assignment_id)
                .await?
                .into_iter()
                .map(|p| (p.id, p.student_id))
                .collect();

        let rows =
            best_submission::Model::find_for_assignment_problem(&self.db, assignment_id, problem_id)
                .await?;
        Ok(rank_entries(rows, &students))
    }
}

/// Orders best rows best first and numbers them 1.. after dropping rows
/// whose participant is no longer on the roster.
fn rank_entries(
    mut rows: Vec<best_submission::Model>,
    students: &HashMap<i64, i64>,
) -> Vec<LeaderboardEntry> {
    rows.sort_by(|a, b| SubmissionRank::from(b).cmp(&SubmissionRank::from(a)));
    rows.into_iter()
        .filter_map(|best| {
            students
                .get(&best.assignment_user_id)
                .map(|&student_id| (student_id, best))
        })
        .enumerate()
        .map(|(i, (student_id, best))| LeaderboardEntry {
            rank: i + 1,
            student_id,
            best,
        })
        .collect()
}

fn log_selection(s: &submission::Model, selection: &Selection) {
    if selection.changed() {
        debug!(
            assignment_user_id = s.assignment_user_id,
            problem_id = s.problem_id,
            submission_id = s.id,
            score = selection.best().score,
            "best submission updated"
        );
    }
}

fn conflict(assignment_user_id: i64, problem_id: i64) -> EngineError {
    EngineError::ConcurrencyConflict(format!(
        "best submission of participant {assignment_user_id} problem {problem_id} kept changing"
    ))
}

/// Settles the best row of `s`'s pair given the row as last read.
///
/// `Ok(None)` means another writer got there first: the pair row appeared
/// after `observed` said there was none, or its version moved on. The caller
/// retries with a fresh read.
async fn apply_selection<C>(
    db: &C,
    s: &submission::Model,
    observed: Option<best_submission::Model>,
) -> EngineResult<Option<Selection>>
where
    C: ConnectionTrait,
{
    match observed {
        None => match best_submission::ActiveModel::from_submission(s).insert(db).await {
            Ok(best) => Ok(Some(Selection::Inserted(best))),
            Err(err) if is_unique_violation(&err) => Ok(None),
            Err(err) => Err(err.into()),
        },
        Some(current) => {
            if SubmissionRank::from(s) <= SubmissionRank::from(&current) {
                return Ok(Some(Selection::Unchanged(current)));
            }
            Ok(compare_and_set(db, &current, s).await?.map(Selection::Replaced))
        }
    }
}

/// Restores the best rows of `problem_ids` from the graded submissions every
/// participant of the assignment already has. Returns the rows written.
pub(crate) async fn rebuild_best_submissions<C>(
    db: &C,
    assignment_id: i64,
    problem_ids: &[i64],
) -> EngineResult<u64>
where
    C: ConnectionTrait,
{
    let mut written = 0;
    for participant in assignment_user::Model::find_by_assignment(db, assignment_id).await? {
        for &problem_id in problem_ids {
            let candidates = submission::Model::find_for_pair(db, participant.id, problem_id).await?;
            let Some(winner) = candidates.iter().max_by_key(|c| SubmissionRank::from(*c)) else {
                continue;
            };

            match best_submission::Model::find_for_pair(db, participant.id, problem_id).await? {
                None => {
                    best_submission::ActiveModel::from_submission(winner).insert(db).await?;
                    written += 1;
                }
                Some(current) if current_matches(&current, winner) => {}
                Some(current) => {
                    if compare_and_set(db, &current, winner).await?.is_none() {
                        return Err(conflict(participant.id, problem_id));
                    }
                    written += 1;
                }
            }
        }
    }
    Ok(written)
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

fn current_matches(current: &best_submission::Model, s: &submission::Model) -> bool {
    current.submission_id == s.id && current.score == s.score && current.max_score == s.max_score
}

/// Points the best row at `s` if nobody changed it since `current` was read.
async fn compare_and_set<C>(
    db: &C,
    current: &best_submission::Model,
    s: &submission::Model,
) -> EngineResult<Option<best_submission::Model>>
where
    C: ConnectionTrait,
{
    use best_submission::Column;

    let res = best_submission::Entity::update_many()
        .col_expr(Column::SubmissionId, Expr::value(s.id))
        .col_expr(Column::Score, Expr::value(s.score))
        .col_expr(Column::MaxScore, Expr::value(s.max_score))
        .col_expr(Column::TotalTime, Expr::value(s.total_time))
        .col_expr(Column::TotalMemory, Expr::value(s.total_memory))
        .col_expr(Column::SubmittedAt, Expr::value(s.submitted_at))
        .col_expr(Column::Version, Expr::value(current.version + 1))
        .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(Column::Id.eq(current.id))
        .filter(Column::Version.eq(current.version))
        .exec(db)
        .await?;

    if res.rows_affected == 0 {
        return Ok(None);
    }
    Ok(best_submission::Entity::find_by_id(current.id).one(db).await?)
}
