use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};

use crate::timestamps::Timestamped;

/// Minimal catalog entry for a programming problem.
///
/// The statement, test data and judging configuration live outside this
/// crate; assignments only need a stable identity to reference.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "problems")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::assignment_problem::Entity")]
    AssignmentProblems,
}

impl Related<super::assignment_problem::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignmentProblems.def()
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
    pub async fn create<C>(db: &C, title: &str) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        ActiveModel {
            title: Set(title.to_string()),
            ..Default::default()
        }
        .insert(db)
        .await
    }

    /// Returns the ids from `ids` that have no matching problem row.
    pub async fn missing_ids<C>(db: &C, ids: &[i64]) -> Result<Vec<i64>, DbErr>
    where
        C: ConnectionTrait,
    {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let found: Vec<i64> = Entity::find()
            .filter(Column::Id.is_in(ids.iter().copied()))
            .all(db)
            .await?
            .into_iter()
            .map(|p| p.id)
            .collect();

        Ok(ids
            .iter()
            .copied()
            .filter(|id| !found.contains(id))
            .collect())
    }
}
