#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use db::models::assignment_user;
use db::test_utils::setup_test_db;
use sea_orm::DatabaseConnection;
use services::Engine;
use services::assignment_store::{CreateAssignment, ProblemSpec};
use services::best_submission::GradedSubmission;
use services::config::{EngineConfig, RetryPolicy};
use services::roster::InMemoryRosterProvider;

pub struct TestEngine {
    pub engine: Engine,
    pub provider: Arc<InMemoryRosterProvider>,
    pub db: DatabaseConnection,
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        roster_timeout: Duration::from_millis(200),
        roster_retry: RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
        },
        sync_queue_capacity: 16,
        max_cas_attempts: 8,
    }
}

pub async fn test_engine() -> TestEngine {
    let db = setup_test_db().await;
    let provider = Arc::new(InMemoryRosterProvider::new());
    let engine = Engine::new(db.clone(), provider.clone(), fast_config());
    TestEngine {
        engine,
        provider,
        db,
    }
}

pub fn problem(problem_id: i64, points: i64) -> ProblemSpec {
    ProblemSpec { problem_id, points }
}

pub fn assignment_spec(class_id: i64, problems: Vec<ProblemSpec>) -> CreateAssignment {
    CreateAssignment {
        teacher_id: 1,
        class_id,
        title: "Practice set".into(),
        description: Some("weekly practice".into()),
        start_time: None,
        end_time: None,
        allow_late_submission: false,
        problems,
    }
}

pub fn graded(
    assignment_user_id: i64,
    problem_id: i64,
    score: i64,
    total_time: i64,
    total_memory: i64,
) -> GradedSubmission {
    GradedSubmission {
        assignment_user_id,
        problem_id,
        score,
        max_score: 100,
        total_time,
        total_memory,
        submitted_at: Utc::now(),
    }
}

pub async fn participant(t: &TestEngine, assignment_id: i64, student_id: i64) -> assignment_user::Model {
    assignment_user::Model::find_for_student(&t.db, assignment_id, student_id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("student {student_id} is not on assignment {assignment_id}"))
}

pub async fn participants(t: &TestEngine, assignment_id: i64) -> Vec<assignment_user::Model> {
    assignment_user::Model::find_by_assignment(&t.db, assignment_id)
        .await
        .unwrap()
}
