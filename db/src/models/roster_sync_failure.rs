//! Dead-letter records for roster synchronisations that exhausted their
//! retries. Rows stay unresolved until a reconciliation pass succeeds.

use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, IntoActiveModel, QueryOrder, Set};
use serde::{Deserialize, Serialize};

use crate::timestamps::Timestamped;

/// How a roster sync treats existing participants.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
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
pub enum SyncMode {
    /// Add missing students, keep everyone with recorded activity.
    #[sea_orm(string_value = "incremental")]
    Incremental,
    /// Discard every participant and rebuild from the roster (draft only).
    #[sea_orm(string_value = "full")]
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "roster_sync_failures")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub assignment_id: i64,
    pub class_id: i64,
    pub mode: SyncMode,
    /// Fetch attempts made so far, across the worker and reconciliation.
    pub attempts: i32,
    #[sea_orm(column_type = "Text")]
    pub last_error: String,
    pub resolved: bool,
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
}

impl Related<super::assignment::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Assignment.def()
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
    pub async fn record<C>(
        db: &C,
        assignment_id: i64,
        class_id: i64,
        mode: SyncMode,
        attempts: i32,
        error: &str,
    ) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        ActiveModel {
            assignment_id: Set(assignment_id),
            class_id: Set(class_id),
            mode: Set(mode),
            attempts: Set(attempts),
            last_error: Set(error.to_string()),
            resolved: Set(false),
            ..Default::default()
        }
        .insert(db)
        .await
    }

    pub async fn find_unresolved<C>(db: &C) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::Resolved.eq(false))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn find_by_assignment<C>(db: &C, assignment_id: i64) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentId.eq(assignment_id))
            .order_by_asc(Column::Id)
            .all(db)
            .await
    }

    pub async fn mark_resolved<C>(self, db: &C) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active = self.into_active_model();
        active.resolved = Set(true);
        active.update(db).await
    }

    pub async fn record_retry<C>(self, db: &C, attempts: i32, error: &str) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let total = self.attempts + attempts;
        let mut active = self.into_active_model();
        active.attempts = Set(total);
        active.last_error = Set(error.to_string());
        active.update(db).await
    }
}
