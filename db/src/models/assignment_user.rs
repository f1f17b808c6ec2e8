use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, Set};
use serde::{Deserialize, Serialize};

use crate::timestamps::Timestamped;

/// Progress of one student through one assignment.
///
/// Variants are declared in lifecycle order so the derived `Ord` can be used
/// to reject regressions.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "Text")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ParticipantStatus {
    #[sea_orm(string_value = "not_started")]
    NotStarted,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "submitted")]
    Submitted,
    /// Terminal.
    #[sea_orm(string_value = "graded")]
    Graded,
}

impl Default for ParticipantStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

/// One student's participation record for one assignment.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "assignment_users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub assignment_id: i64,
    /// Student identifier owned by the roster service.
    pub student_id: i64,
    pub status: ParticipantStatus,
    pub assigned_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    /// Sum of best-submission scores; `None` until something is graded.
    pub score: Option<i64>,
    /// Mirror of the assignment's max score.
    pub max_score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::assignment::Entity",
        from = "Column::AssignmentId",
        to = "super::assignment::Column::Id"
    )]
    Assignment,
    #[sea_orm(has_many = "super::submission::Entity")]
    Submissions,
    #[sea_orm(has_many = "super::best_submission::Entity")]
    BestSubmissions,
}

impl Related<super::assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assignment.def()
    }
}

impl Related<super::submission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Submissions.def()
    }
}

impl Related<super::best_submission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BestSubmissions.def()
    }
}

impl Timestamped for ActiveModel {
    fn set_created_at(&mut self, at: DateTime<Utc>) {
        self.created_at = Set(at);
    }

    fn set_updated_at(&mut self, at: DateTime<Utc>) {
        self.updated_at = Set(at);
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(mut self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        self.stamp(Utc::now(), insert);
        Ok(self)
    }
}

impl ActiveModel {
    /// A fresh `NotStarted` participant, stamped for a bulk insert.
    pub fn new_participant(
        assignment_id: i64,
        student_id: i64,
        max_score: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let mut active = ActiveModel {
            assignment_id: Set(assignment_id),
            student_id: Set(student_id),
            status: Set(ParticipantStatus::NotStarted),
            assigned_at: Set(now),
            started_at: Set(None),
            submitted_at: Set(None),
            score: Set(None),
            max_score: Set(max_score),
            ..Default::default()
        };
        active.stamp(now, true);
        active
    }
}

impl Model {
    pub async fn find_by_assignment<C>(db: &C, assignment_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentId.eq(assignment_id))
            .order_by_asc(Column::StudentId)
            .all(db)
            .await
    }

    pub async fn find_for_student<C>(
        db: &C,
        assignment_id: i64,
        student_id: i64,
    ) -> Result<Option<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentId.eq(assignment_id))
            .filter(Column::StudentId.eq(student_id))
            .one(db)
            .await
    }

    /// Deletes participants together with their submissions and best
    /// submissions. Returns the number of participant rows removed.
    pub async fn delete_with_dependents<C>(db: &C, ids: &[i64]) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        use super::{best_submission, submission};

        if ids.is_empty() {
            return Ok(0);
        }

        best_submission::Entity::delete_many()
            .filter(best_submission::Column::AssignmentUserId.is_in(ids.iter().copied()))
            .exec(db)
            .await?;

        submission::Entity::delete_many()
            .filter(submission::Column::AssignmentUserId.is_in(ids.iter().copied()))
            .exec(db)
            .await?;

        let res = Entity::delete_many()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .exec(db)
            .await?;

        Ok(res.rows_affected)
    }
}
