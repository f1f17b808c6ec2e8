//! Read-only participation and score summaries per assignment.
//!
//! Figures are derived from the participant rows on each call; nothing is
//! cached or written.

use db::models::{assignment, assignment_user, assignment_user::ParticipantStatus};
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Serialize;

use crate::error::{EngineError, EngineResult};

/// Participation and score summary of one assignment.
///
/// Percentages are in `0.0..=100.0`. With no participants every derived
/// figure is zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AssignmentStatistics {
    pub total_students: u64,
    pub not_started: u64,
    pub in_progress: u64,
    pub submitted: u64,
    pub graded: u64,
    /// Mean over participants that have a score.
    pub average_score: f64,
    /// Share of participants that submitted or were graded.
    pub completion_rate: f64,
    pub max_score: i64,
    pub highest_score: i64,
    pub lowest_score: i64,
}

impl AssignmentStatistics {
    pub fn from_participants(max_score: i64, participants: &[assignment_user::Model]) -> Self {
        let mut stats = AssignmentStatistics {
            max_score,
            total_students: participants.len() as u64,
            ..Default::default()
        };

        for p in participants {
            match p.status {
                ParticipantStatus::NotStarted => stats.not_started += 1,
                ParticipantStatus::InProgress => stats.in_progress += 1,
                ParticipantStatus::Submitted => stats.submitted += 1,
                ParticipantStatus::Graded => stats.graded += 1,
            }
        }

        if stats.total_students > 0 {
            let completed = stats.submitted + stats.graded;
            stats.completion_rate = completed as f64 / stats.total_students as f64 * 100.0;
        }

        let scores: Vec<i64> = participants.iter().filter_map(|p| p.score).collect();
        if !scores.is_empty() {
            stats.average_score = scores.iter().sum::<i64>() as f64 / scores.len() as f64;
            stats.highest_score = scores.iter().copied().max().unwrap_or_default();
            stats.lowest_score = scores.iter().copied().min().unwrap_or_default();
        }

        stats
    }
}

pub struct StatisticsEngine {
    db: DatabaseConnection,
}

impl StatisticsEngine {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn get_assignment_statistics(
        &self,
        assignment_id: i64,
    ) -> EngineResult<AssignmentStatistics> {
        let assignment = assignment::Entity::find_by_id(assignment_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| EngineError::not_found("assignment", assignment_id))?;
        let participants = assignment_user::Model::find_by_assignment(&self.db, assignment_id).await?;

        Ok(AssignmentStatistics::from_participants(
            assignment.max_score,
            &participants,
        ))
    }
}
