use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, Set};

use crate::timestamps::Timestamped;

/// One graded attempt by a participant on a problem.
///
/// Rows arrive already scored by the external grading pipeline. Only the
/// grading fields (`score`, `max_score`) change afterwards, and only through
/// an explicit regrade.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "submissions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub assignment_user_id: i64,
    pub problem_id: i64,
    pub score: i64,
    /// Maximum score available for this problem when it was graded.
    pub max_score: i64,
    /// Total run time across test cases, in milliseconds.
    pub total_time: i64,
    /// Peak memory across test cases, in kilobytes.
    pub total_memory: i64,
    pub submitted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::assignment_user::Entity",
        from = "Column::AssignmentUserId",
        to = "super::assignment_user::Column::Id"
    )]
    AssignmentUser,
    #[sea_orm(
        belongs_to = "super::problem::Entity",
        from = "Column::ProblemId",
        to = "super::problem::Column::Id"
    )]
    Problem,
}

impl Related<super::assignment_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignmentUser.def()
    }
}

impl Related<super::problem::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Problem.def()
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
    /// Every attempt of a participant on one problem, oldest first.
    pub async fn find_for_pair<C>(
        db: &C,
        assignment_user_id: i64,
        problem_id: i64,
    ) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentUserId.eq(assignment_user_id))
            .filter(Column::ProblemId.eq(problem_id))
            .order_by_asc(Column::SubmittedAt)
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn find_by_participant<C>(
        db: &C,
        assignment_user_id: i64,
    ) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentUserId.eq(assignment_user_id))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }
}
