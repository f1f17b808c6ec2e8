use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::{ConnectionTrait, QueryOrder, QuerySelect, QueryTrait, Set};

use crate::timestamps::Timestamped;

/// Denormalised pointer to the best graded submission of a participant on a
/// problem. Unique per `(assignment_user_id, problem_id)`.
///
/// The grading figures are cached from the referenced submission so
/// leaderboards never join through `submissions`. `version` increments on
/// every rewrite and guards conditional updates.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "best_submissions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub assignment_user_id: i64,
    pub problem_id: i64,
    pub submission_id: i64,
    pub score: i64,
    pub max_score: i64,
    pub total_time: i64,
    pub total_memory: i64,
    pub submitted_at: DateTime<Utc>,
    pub version: i64,
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
        belongs_to = "super::submission::Entity",
        from = "Column::SubmissionId",
        to = "super::submission::Column::Id"
    )]
    Submission,
}

impl Related<super::assignment_user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AssignmentUser.def()
    }
}

impl Related<super::submission::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Submission.def()
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
    /// Snapshot of `submission` as a new best-submission row.
    pub fn from_submission(submission: &super::submission::Model) -> Self {
        ActiveModel {
            assignment_user_id: Set(submission.assignment_user_id),
            problem_id: Set(submission.problem_id),
            submission_id: Set(submission.id),
            score: Set(submission.score),
            max_score: Set(submission.max_score),
            total_time: Set(submission.total_time),
            total_memory: Set(submission.total_memory),
            submitted_at: Set(submission.submitted_at),
            version: Set(0),
            ..Default::default()
        }
    }
}

impl Model {
    pub async fn find_for_pair<C>(
        db: &C,
        assignment_user_id: i64,
        problem_id: i64,
    ) -> Result<Option<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        Entity::find()
            .filter(Column::AssignmentUserId.eq(assignment_user_id))
            .filter(Column::ProblemId.eq(problem_id))
            .one(db)
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
            .order_by_asc(Column::ProblemId)
            .all(db)
            .await
    }

    /// Best rows for one problem across every participant of an assignment.
    pub async fn find_for_assignment_problem<C>(
        db: &C,
        assignment_id: i64,
        problem_id: i64,
    ) -> Result<Vec<Self>, DbErr>
    where
        C: ConnectionTrait,
    {
        use super::assignment_user::{Column as ParticipantCol, Entity as ParticipantEntity};

        let participant_ids = ParticipantEntity::find()
            .select_only()
            .column(ParticipantCol::Id)
            .filter(ParticipantCol::AssignmentId.eq(assignment_id));

        Entity::find()
            .filter(Column::ProblemId.eq(problem_id))
            .filter(Column::AssignmentUserId.in_subquery(participant_ids.as_query().to_owned()))
            .all(db)
            .await
    }

    /// Drops best rows for problems no longer part of an assignment.
    pub async fn delete_for_problems<C>(
        db: &C,
        assignment_id: i64,
        problem_ids: &[i64],
    ) -> Result<u64, DbErr>
    where
        C: ConnectionTrait,
    {
        use super::assignment_user::{Column as ParticipantCol, Entity as ParticipantEntity};

        if problem_ids.is_empty() {
            return Ok(0);
        }

        let participant_ids = ParticipantEntity::find()
            .select_only()
            .column(ParticipantCol::Id)
            .filter(ParticipantCol::AssignmentId.eq(assignment_id));

        let res = Entity::delete_many()
            .filter(Column::ProblemId.is_in(problem_ids.iter().copied()))
            .filter(Column::AssignmentUserId.in_subquery(participant_ids.as_query().to_owned()))
            .exec(db)
            .await?;
        Ok(res.rows_affected)
    }
}
