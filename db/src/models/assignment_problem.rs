use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, Set};

use crate::timestamps::Timestamped;

/// A problem attached to an assignment, with its point value and display
/// position. Unique per `(assignment_id, problem_id)`.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "assignment_problems")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub assignment_id: i64,
    pub problem_id: i64,
    /// Contribution to the assignment's max score.
    pub points: i64,
    pub order_index: i32,
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
    #[sea_orm(
        belongs_to = "super::problem::Entity",
        from = "Column::ProblemId",
        to = "super::problem::Column::Id"
    )]
    Problem,
}

impl Related<super::assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assignment.def()
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
    /// Problems of an assignment in display order.
    pub async fn find_by_assignment<C>(db: &C, assignment_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentId.eq(assignment_id))
            .order_by_asc(Column::OrderIndex)
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn find_one<C>(
        db: &C,
        assignment_id: i64,
        problem_id: i64,
    ) -> Result<Option<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentId.eq(assignment_id))
            .filter(Column::ProblemId.eq(problem_id))
            .one(db)
            .await
    }

    /// Sum of points over the assignment's current problems.
    pub async fn total_points<C>(db: &C, assignment_id: i64) -> Result<i64, DbErr>
    where
        C: ConnectionTrait,
    {
        Ok(Self::find_by_assignment(db, assignment_id)
            .await?
            .iter()
            .map(|p| p.points)
            .sum())
    }
}
