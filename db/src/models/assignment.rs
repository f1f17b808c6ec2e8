use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, QuerySelect, QueryTrait, Set};
use serde::{Deserialize, Serialize};

use crate::timestamps::Timestamped;

/// Lifecycle of an assignment. Moves forward only:
/// `Draft` → `Published` → `Closed`.
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
pub enum AssignmentStatus {
    /// Being authored; the target class may still change.
    #[sea_orm(string_value = "draft")]
    Draft,
    /// Visible to students and accepting work.
    #[sea_orm(string_value = "published")]
    Published,
    /// No longer accepting work.
    #[sea_orm(string_value = "closed")]
    Closed,
}

impl Default for AssignmentStatus {
    fn default() -> Self {
        Self::Draft
    }
}

/// A set of problems assigned to a class with a scoring and time window.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "assignments")]
pub struct Model {
    /// Primary key of the assignment.
    #[sea_orm(primary_key)]
    pub id: i64,
    /// Teacher who owns the assignment.
    pub teacher_id: i64,
    /// Class whose roster receives the assignment.
    pub class_id: i64,
    pub title: String,
    pub description: Option<String>,
    /// Optional opening time; activity before it is rejected.
    pub start_time: Option<DateTime<Utc>>,
    /// Optional deadline; see `allow_late_submission`.
    pub end_time: Option<DateTime<Utc>>,
    pub allow_late_submission: bool,
    pub status: AssignmentStatus,
    /// Sum of the points of every problem currently attached.
    pub max_score: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::assignment_problem::Entity")]
    AssignmentProblems,
    #[sea_orm(has_many = "super::assignment_user::Entity")]
    AssignmentUsers,
}

impl Related<super::assignment_problem::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignmentProblems.def()
    }
}

impl Related<super::assignment_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignmentUsers.def()
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

impl Model {
    pub fn is_draft(&self) -> bool {
        self.status == AssignmentStatus::Draft
    }

    /// Whether work handed in at `at` is inside the assignment window.
    ///
    /// Work after `end_time` is accepted only when late submission is allowed.
    pub fn accepts_work_at(&self, at: DateTime<Utc>) -> bool {
        if let Some(start) = self.start_time {
            if at < start {
                return false;
            }
        }
        match self.end_time {
            Some(end) if at > end => self.allow_late_submission,
            _ => true,
        }
    }

    pub async fn find_by_teacher<C>(db: &C, teacher_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::TeacherId.eq(teacher_id))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn find_by_class<C>(db: &C, class_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::ClassId.eq(class_id))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    /// Assignments the student participates in.
    pub async fn find_by_student<C>(db: &C, student_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        use super::assignment_user::{Column as ParticipantCol, Entity as ParticipantEntity};

        let assignment_ids = ParticipantEntity::find()
            .select_only()
            .column(ParticipantCol::AssignmentId)
            .filter(ParticipantCol::StudentId.eq(student_id));

        Entity::find()
            .filter(Column::Id.in_subquery(assignment_ids.as_query().to_owned()))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn set_max_score<C>(db: &C, id: i64, max_score: i64) -> Result<(), DbErr>
    where
        C: ConnectionTrait,
    {
        use sea_orm::sea_query::Expr;

        let result = Entity::update_many()
            .col_expr(Column::MaxScore, Expr::value(max_score))
            .col_expr(Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(Column::Id.eq(id))
            .exec(db)
            .await?;

        if result.rows_affected == 0 {
            return Err(DbErr::RecordNotFound(format!("Assignment {id} not found")));
        }
        Ok(())
    }
}
