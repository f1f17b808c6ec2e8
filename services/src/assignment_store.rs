//! Persistence of assignments and their problem sets.
//!
//! Every write runs in one transaction; a problem-set change recomputes and
//! propagates the max score before it commits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{
    assignment::{self, AssignmentStatus},
    assignment_problem, assignment_user, best_submission, problem, roster_sync_failure,
};
use db::timestamps::Timestamped;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, Set, TransactionTrait,
};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};
use validator::{Validate, ValidationError};

use crate::error::{EngineError, EngineResult};
use crate::locks::KeyedLocks;
use crate::best_submission::rebuild_best_submissions;
use crate::score_aggregator::ScoreAggregator;

/// One problem of an assignment's problem set, in display order.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ProblemSpec {
    pub problem_id: i64,
    #[validate(range(min = 0, message = "points must not be negative"))]
    pub points: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_create"))]
pub struct CreateAssignment {
    pub teacher_id: i64,
    pub class_id: i64,
    #[validate(length(min = 1, max = 255), custom(function = "not_blank"))]
    pub title: String,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub allow_late_submission: bool,
    #[validate(nested)]
    pub problems: Vec<ProblemSpec>,
}

/// Partial update. `None` leaves a field untouched; `problems` replaces the
/// whole problem set. Nullable columns take `Some(None)` to be cleared.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[validate(schema(function = "validate_update"))]
pub struct UpdateAssignment {
    pub class_id: Option<i64>,
    #[validate(length(min = 1, max = 255), custom(function = "not_blank"))]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub description: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub start_time: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "present")]
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub allow_late_submission: Option<bool>,
    pub status: Option<AssignmentStatus>,
    pub problems: Option<Vec<ProblemSpec>>,
}

/// A field that is present in the payload, even as `null`, is `Some`.
fn present<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

fn not_blank(value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new("blank").with_message("must not be blank".into()));
    }
    Ok(())
}

fn validate_window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<(), ValidationError> {
    if let (Some(start), Some(end)) = (start, end) {
        if end < start {
            return Err(ValidationError::new("window")
                .with_message("end_time must not be before start_time".into()));
        }
    }
    Ok(())
}

fn validate_problem_set(problems: &[ProblemSpec]) -> Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for p in problems {
        if p.points < 0 {
            return Err(ValidationError::new("points")
                .with_message(format!("problem {} has negative points", p.problem_id).into()));
        }
        if !seen.insert(p.problem_id) {
            return Err(ValidationError::new("duplicate_problem")
                .with_message(format!("problem {} listed twice", p.problem_id).into()));
        }
    }
    Ok(())
}

fn validate_create(spec: &CreateAssignment) -> Result<(), ValidationError> {
    validate_window(spec.start_time, spec.end_time)?;
    validate_problem_set(&spec.problems)
}

fn validate_update(spec: &UpdateAssignment) -> Result<(), ValidationError> {
    validate_window(spec.start_time.flatten(), spec.end_time.flatten())?;
    match &spec.problems {
        Some(problems) => validate_problem_set(problems),
        None => Ok(()),
    }
}

/// An assignment together with its ordered problem set.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentDetails {
    pub assignment: assignment::Model,
    pub problems: Vec<assignment_problem::Model>,
}

/// Result of an update, telling the caller which follow-up work is due.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentUpdate {
    pub details: AssignmentDetails,
    pub class_changed: bool,
    pub problems_changed: bool,
}

pub struct AssignmentStore {
    db: DatabaseConnection,
    assignment_locks: Arc<KeyedLocks<i64>>,
}

impl AssignmentStore {
    pub fn new(db: DatabaseConnection, assignment_locks: Arc<KeyedLocks<i64>>) -> Self {
        Self {
            db,
            assignment_locks,
        }
    }

    /// Adds a problem to the catalog that assignments reference.
    pub async fn create_problem(&self, title: &str) -> EngineResult<problem::Model> {
        if title.trim().is_empty() {
            return Err(EngineError::Validation("title: must not be blank".into()));
        }
        Ok(problem::Model::create(&self.db, title).await?)
    }

    /// Persists a new draft assignment and its problem set with the max score
    /// already derived.
    pub async fn create(&self, spec: CreateAssignment) -> EngineResult<AssignmentDetails> {
        spec.validate()?;

        let txn = self.db.begin().await?;

        ensure_problems_exist(&txn, &spec.problems).await?;

        let created = assignment::ActiveModel {
            teacher_id: Set(spec.teacher_id),
            class_id: Set(spec.class_id),
            title: Set(spec.title.trim().to_string()),
            description: Set(spec.description),
            start_time: Set(spec.start_time),
            end_time: Set(spec.end_time),
            allow_late_submission: Set(spec.allow_late_submission),
            status: Set(AssignmentStatus::Draft),
            max_score: Set(0),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        insert_problems(&txn, created.id, spec.problems.iter().enumerate()).await?;
        let max_score = ScoreAggregator::recompute_max_score(&txn, created.id).await?;

        let details = load_details(&txn, created.id).await?;
        txn.commit().await?;

        info!(
            assignment_id = created.id,
            class_id = created.class_id,
            max_score,
            "created assignment"
        );
        Ok(details)
    }

    /// Applies a partial update under the assignment's lock.
    ///
    /// A class change is only accepted while the assignment is a draft and
    /// the status only moves forward.
    pub async fn update(&self, id: i64, spec: UpdateAssignment) -> EngineResult<AssignmentUpdate> {
        spec.validate()?;

        let _guard = self.assignment_locks.lock(id).await;
        let txn = self.db.begin().await?;

        let current = assignment::Entity::find_by_id(id)
            .one(&txn)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", id))?;

        let class_changed = matches!(spec.class_id, Some(c) if c != current.class_id);
        if class_changed && !current.is_draft() {
            return Err(EngineError::InvalidStateTransition(format!(
                "class of assignment {id} cannot change while {}",
                current.status
            )));
        }
        if let Some(status) = spec.status {
            if status < current.status {
                return Err(EngineError::InvalidStateTransition(format!(
                    "assignment {id} cannot move from {} back to {status}",
                    current.status
                )));
            }
        }

        let start = spec.start_time.unwrap_or(current.start_time);
        let end = spec.end_time.unwrap_or(current.end_time);
        validate_window(start, end)
            .map_err(|e| EngineError::Validation(format!("end_time: {e}")))?;

        let mut active = current.into_active_model();
        if let Some(class_id) = spec.class_id {
            active.class_id = Set(class_id);
        }
        if let Some(title) = spec.title {
            active.title = Set(title.trim().to_string());
        }
        if let Some(description) = spec.description {
            active.description = Set(description);
        }
        if spec.start_time.is_some() {
            active.start_time = Set(start);
        }
        if spec.end_time.is_some() {
            active.end_time = Set(end);
        }
        if let Some(allow) = spec.allow_late_submission {
            active.allow_late_submission = Set(allow);
        }
        if let Some(status) = spec.status {
            active.status = Set(status);
        }
        active.update(&txn).await?;

        // The old class's roster goes with the class, whatever status this
        // update also sets.
        if class_changed {
            let ids: Vec<i64> = assignment_user::Model::find_by_assignment(&txn, id)
                .await?
                .into_iter()
                .map(|p| p.id)
                .collect();
            let removed = assignment_user::Model::delete_with_dependents(&txn, &ids).await?;
            debug!(assignment_id = id, removed, "cleared roster of previous class");
        }

        let problems_changed = match spec.problems {
            Some(problems) => replace_problem_set(&txn, id, &problems).await?,
            None => false,
        };
        if problems_changed {
            let max_score = ScoreAggregator::refresh(&txn, id).await?;
            ScoreAggregator::recompute_scores_for_assignment(&txn, id).await?;
            debug!(assignment_id = id, max_score, "problem set replaced");
        }

        let details = load_details(&txn, id).await?;
        txn.commit().await?;

        info!(assignment_id = id, class_changed, problems_changed, "updated assignment");
        Ok(AssignmentUpdate {
            details,
            class_changed,
            problems_changed,
        })
    }

    /// Removes the assignment and everything hanging off it.
    pub async fn delete(&self, id: i64) -> EngineResult<()> {
        let _guard = self.assignment_locks.lock(id).await;
        let txn = self.db.begin().await?;

        if assignment::Entity::find_by_id(id).one(&txn).await?.is_none() {
            return Err(EngineError::not_found("assignment", id));
        }

        let participant_ids: Vec<i64> = assignment_user::Model::find_by_assignment(&txn, id)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();
        let participants = assignment_user::Model::delete_with_dependents(&txn, &participant_ids).await?;

        assignment_problem::Entity::delete_many()
            .filter(assignment_problem::Column::AssignmentId.eq(id))
            .exec(&txn)
            .await?;
        roster_sync_failure::Entity::delete_many()
            .filter(roster_sync_failure::Column::AssignmentId.eq(id))
            .exec(&txn)
            .await?;
        assignment::Entity::delete_by_id(id).exec(&txn).await?;

        txn.commit().await?;
        info!(assignment_id = id, participants, "deleted assignment");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> EngineResult<AssignmentDetails> {
        load_details(&self.db, id).await
    }

    pub async fn list_by_teacher(&self, teacher_id: i64) -> EngineResult<Vec<assignment::Model>> {
        Ok(assignment::Model::find_by_teacher(&self.db, teacher_id).await?)
    }

    pub async fn list_by_class(&self, class_id: i64) -> EngineResult<Vec<assignment::Model>> {
        Ok(assignment::Model::find_by_class(&self.db, class_id).await?)
    }

    pub async fn list_by_student(&self, student_id: i64) -> EngineResult<Vec<assignment::Model>> {
        Ok(assignment::Model::find_by_student(&self.db, student_id).await?)
    }
}

async fn load_details<C>(db: &C, id: i64) -> EngineResult<AssignmentDetails>
where
    C: ConnectionTrait,
{
    let assignment = assignment::Entity::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| EngineError::not_found("assignment", id))?;
    let problems = assignment_problem::Model::find_by_assignment(db, id).await?;
    Ok(AssignmentDetails {
        assignment,
        problems,
    })
}

async fn ensure_problems_exist<C>(db: &C, problems: &[ProblemSpec]) -> EngineResult<()>
where
    C: ConnectionTrait,
{
    let ids: Vec<i64> = problems.iter().map(|p| p.problem_id).collect();
    match problem::Model::missing_ids(db, &ids).await?.first() {
        Some(&missing) => Err(EngineError::not_found("problem", missing)),
        None => Ok(()),
    }
}

async fn insert_problems<'a, C, I>(db: &C, assignment_id: i64, problems: I) -> EngineResult<()>
where
    C: ConnectionTrait,
    I: IntoIterator<Item = (usize, &'a ProblemSpec)>,
{
    let now = Utc::now();
    let rows: Vec<assignment_problem::ActiveModel> = problems
        .into_iter()
        .map(|(index, spec)| {
            let mut row = assignment_problem::ActiveModel {
                assignment_id: Set(assignment_id),
                problem_id: Set(spec.problem_id),
                points: Set(spec.points),
                order_index: Set(index as i32),
                ..Default::default()
            };
            row.stamp(now, true);
            row
        })
        .collect();

    if rows.is_empty() {
        return Ok(());
    }
    assignment_problem::Entity::insert_many(rows)
        .exec_without_returning(db)
        .await?;
    Ok(())
}

/// Diffs the stored problem set against `problems`. Best submissions for
/// removed problems are dropped and those of added problems are rebuilt from
/// the graded submissions already on record. Returns whether anything
/// changed.
async fn replace_problem_set<C>(
    db: &C,
    assignment_id: i64,
    problems: &[ProblemSpec],
) -> EngineResult<bool>
where
    C: ConnectionTrait,
{
    ensure_problems_exist(db, problems).await?;

    let mut existing: HashMap<i64, assignment_problem::Model> =
        assignment_problem::Model::find_by_assignment(db, assignment_id)
            .await?
            .into_iter()
            .map(|row| (row.problem_id, row))
            .collect();

    let mut changed = false;
    let mut added = Vec::new();

    for (index, spec) in problems.iter().enumerate() {
        let order_index = index as i32;
        match existing.remove(&spec.problem_id) {
            Some(row) if row.points == spec.points && row.order_index == order_index => {}
            Some(row) => {
                let mut active = row.into_active_model();
                active.points = Set(spec.points);
                active.order_index = Set(order_index);
                active.update(db).await?;
                changed = true;
            }
            None => added.push((index, spec)),
        }
    }

    if !added.is_empty() {
        let added_ids: Vec<i64> = added.iter().map(|(_, spec)| spec.problem_id).collect();
        insert_problems(db, assignment_id, added).await?;
        let rebuilt = rebuild_best_submissions(db, assignment_id, &added_ids).await?;
        if rebuilt > 0 {
            debug!(assignment_id, rebuilt, "restored best submissions of re-added problems");
        }
        changed = true;
    }

    let removed: Vec<i64> = existing.keys().copied().collect();
    if !removed.is_empty() {
        assignment_problem::Entity::delete_many()
            .filter(assignment_problem::Column::AssignmentId.eq(assignment_id))
            .filter(assignment_problem::Column::ProblemId.is_in(removed.iter().copied()))
            .exec(db)
            .await?;
        let dropped = best_submission::Model::delete_for_problems(db, assignment_id, &removed).await?;
        debug!(assignment_id, removed = removed.len(), dropped, "removed problems");
        changed = true;
    }

    Ok(changed)
}
