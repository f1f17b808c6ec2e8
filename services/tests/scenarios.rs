mod helpers;

use db::models::{best_submission, roster_sync_failure};
use helpers::*;
use sea_orm::EntityTrait;
use services::assignment_store::UpdateAssignment;
use services::roster::RosterError;
use services::{AssignmentStatus, EngineError, ParticipantStatus, SyncMode};

#[tokio::test]
async fn new_assignment_reaches_whole_roster_with_summed_max_score() {
    let t = test_engine().await;
    let p1 = t.engine.create_problem("Reverse a list").await.unwrap();
    let p2 = t.engine.create_problem("Balanced brackets").await.unwrap();
    t.provider.set_roster(10, vec![101, 102, 103]);

    let details = t
        .engine
        .create_assignment(assignment_spec(10, vec![problem(p1.id, 100), problem(p2.id, 150)]))
        .await
        .unwrap();
    t.engine.wait_for_sync_idle().await;

    assert_eq!(details.assignment.max_score, 250);
    let rows = participants(&t, details.assignment.id).await;
    assert_eq!(rows.iter().map(|r| r.student_id).collect::<Vec<_>>(), vec![101, 102, 103]);
    assert!(rows.iter().all(|r| r.max_score == 250));
    assert!(rows.iter().all(|r| r.status == ParticipantStatus::NotStarted));
}

#[tokio::test]
async fn equal_scores_prefer_faster_run() {
    let t = test_engine().await;
    let p = t.engine.create_problem("Sort").await.unwrap();
    t.provider.set_roster(1, vec![7]);
    let a = t
        .engine
        .create_assignment(assignment_spec(1, vec![problem(p.id, 100)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    let student = participant(&t, a.id, 7).await;

    t.engine
        .record_graded_submission(graded(student.id, p.id, 80, 100, 64))
        .await
        .unwrap();
    let (faster, _) = t
        .engine
        .record_graded_submission(graded(student.id, p.id, 80, 90, 64))
        .await
        .unwrap();

    let best = t.engine.get_best_submission(student.id, p.id).await.unwrap().unwrap();
    assert_eq!(best.submission_id, faster.id);
    assert_eq!(best.total_time, 90);
}

#[tokio::test]
async fn changing_points_in_draft_propagates_new_max() {
    let t = test_engine().await;
    let p1 = t.engine.create_problem("A").await.unwrap();
    let p2 = t.engine.create_problem("B").await.unwrap();
    t.provider.set_roster(4, vec![1, 2]);
    let a = t
        .engine
        .create_assignment(assignment_spec(4, vec![problem(p1.id, 100), problem(p2.id, 150)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;

    let update = t
        .engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                problems: Some(vec![problem(p1.id, 80), problem(p2.id, 150)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(update.details.assignment.max_score, 230);
    assert!(participants(&t, a.id).await.iter().all(|r| r.max_score == 230));
}

#[tokio::test]
async fn resync_with_unchanged_roster_changes_nothing() {
    let t = test_engine().await;
    t.provider.set_roster(2, vec![5, 6]);
    let a = t.engine.create_assignment(assignment_spec(2, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;
    let before = participants(&t, a.id).await;

    let report = t.engine.sync_roster(a.id, 2, SyncMode::Incremental).await.unwrap();

    assert!(report.added.is_empty() && report.removed.is_empty());
    assert_eq!(participants(&t, a.id).await, before);
}

#[tokio::test]
async fn statistics_without_participants_are_zero() {
    let t = test_engine().await;
    let a = t.engine.create_assignment(assignment_spec(3, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;

    let stats = t.engine.get_assignment_statistics(a.id).await.unwrap();

    assert_eq!(stats.total_students, 0);
    assert_eq!(stats.completion_rate, 0.0);
    assert_eq!(stats.average_score, 0.0);
}

#[tokio::test]
async fn published_assignment_keeps_its_class() {
    let t = test_engine().await;
    t.provider.set_roster(1, vec![1, 2]);
    t.provider.set_roster(2, vec![3]);
    let a = t.engine.create_assignment(assignment_spec(1, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;
    t.engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                status: Some(AssignmentStatus::Published),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let before = participants(&t, a.id).await;

    let err = t
        .engine
        .update_assignment(a.id, UpdateAssignment { class_id: Some(2), ..Default::default() })
        .await
        .unwrap_err();
    t.engine.wait_for_sync_idle().await;

    assert!(matches!(err, EngineError::InvalidStateTransition(_)));
    assert_eq!(participants(&t, a.id).await, before);
    assert_eq!(t.engine.get_assignment(a.id).await.unwrap().assignment.class_id, 1);
}

#[tokio::test]
async fn draft_class_change_rebuilds_roster() {
    let t = test_engine().await;
    t.provider.set_roster(1, vec![1, 2]);
    t.provider.set_roster(2, vec![8, 9]);
    let a = t.engine.create_assignment(assignment_spec(1, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;

    let update = t
        .engine
        .update_assignment(a.id, UpdateAssignment { class_id: Some(2), ..Default::default() })
        .await
        .unwrap();
    t.engine.wait_for_sync_idle().await;

    assert!(update.class_changed);
    let students: Vec<i64> = participants(&t, a.id).await.iter().map(|p| p.student_id).collect();
    assert_eq!(students, vec![8, 9]);
}

#[tokio::test]
async fn class_change_and_publish_together_move_roster_to_new_class() {
    let t = test_engine().await;
    let p = t.engine.create_problem("Warm-up").await.unwrap();
    t.provider.set_roster(1, vec![1, 2]);
    t.provider.set_roster(2, vec![8, 9]);
    let a = t
        .engine
        .create_assignment(assignment_spec(1, vec![problem(p.id, 100)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    let old = participant(&t, a.id, 1).await;
    t.engine.record_graded_submission(graded(old.id, p.id, 60, 1, 1)).await.unwrap();

    let update = t
        .engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                class_id: Some(2),
                status: Some(AssignmentStatus::Published),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.engine.wait_for_sync_idle().await;

    assert!(update.class_changed);
    assert_eq!(update.details.assignment.status, AssignmentStatus::Published);
    let students: Vec<i64> = participants(&t, a.id).await.iter().map(|p| p.student_id).collect();
    assert_eq!(students, vec![8, 9]);
    assert!(t.engine.get_best_submission(old.id, p.id).await.unwrap().is_none());
    assert!(roster_sync_failure::Model::find_unresolved(&t.db).await.unwrap().is_empty());
    let report = t.engine.reconcile_failures().await.unwrap();
    assert_eq!((report.resolved, report.abandoned), (0, 0));
}

#[tokio::test]
async fn publish_before_queued_class_sync_still_reaches_new_class() {
    let t = test_engine().await;
    t.provider.set_roster(1, vec![1, 2]);
    t.provider.set_roster(2, vec![8, 9]);
    let a = t.engine.create_assignment(assignment_spec(1, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;

    t.provider.set_delay(Some(std::time::Duration::from_millis(50)));
    t.engine
        .update_assignment(a.id, UpdateAssignment { class_id: Some(2), ..Default::default() })
        .await
        .unwrap();
    t.engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                status: Some(AssignmentStatus::Published),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.engine.wait_for_sync_idle().await;

    let students: Vec<i64> = participants(&t, a.id).await.iter().map(|p| p.student_id).collect();
    assert_eq!(students, vec![8, 9]);
    assert!(roster_sync_failure::Model::find_unresolved(&t.db).await.unwrap().is_empty());
}

#[tokio::test]
async fn enrollment_change_reaches_every_assignment_of_class() {
    let t = test_engine().await;
    t.provider.set_roster(5, vec![1]);
    let a = t.engine.create_assignment(assignment_spec(5, vec![])).await.unwrap().assignment;
    let b = t.engine.create_assignment(assignment_spec(5, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;

    t.provider.enroll(5, 2);
    let queued = t.engine.on_enrollment_changed(5).await.unwrap();
    t.engine.wait_for_sync_idle().await;

    assert_eq!(queued, 2);
    for id in [a.id, b.id] {
        assert_eq!(participants(&t, id).await.len(), 2);
    }
    assert_eq!(t.engine.list_by_student(2).await.unwrap().len(), 2);
}

#[tokio::test]
async fn failed_background_sync_is_reconciled_later() {
    let t = test_engine().await;
    t.provider.set_roster(6, vec![1, 2]);
    t.provider.fail_next(3, RosterError::Network("connection refused".into()));

    let a = t.engine.create_assignment(assignment_spec(6, vec![])).await.unwrap().assignment;
    t.engine.wait_for_sync_idle().await;

    assert!(participants(&t, a.id).await.is_empty());
    let failures = roster_sync_failure::Model::find_unresolved(&t.db).await.unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].attempts, 3);

    let report = t.engine.reconcile_failures().await.unwrap();

    assert_eq!(report.resolved, 1);
    assert_eq!(participants(&t, a.id).await.len(), 2);
}

#[tokio::test]
async fn removing_a_problem_drops_its_best_rows_and_rescores() {
    let t = test_engine().await;
    let p1 = t.engine.create_problem("Keep").await.unwrap();
    let p2 = t.engine.create_problem("Drop").await.unwrap();
    t.provider.set_roster(1, vec![7]);
    let a = t
        .engine
        .create_assignment(assignment_spec(1, vec![problem(p1.id, 100), problem(p2.id, 100)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    let student = participant(&t, a.id, 7).await;
    t.engine.record_graded_submission(graded(student.id, p1.id, 40, 1, 1)).await.unwrap();
    t.engine.record_graded_submission(graded(student.id, p2.id, 50, 1, 1)).await.unwrap();
    assert_eq!(participant(&t, a.id, 7).await.score, Some(90));

    t.engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                problems: Some(vec![problem(p1.id, 100)]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let after = participant(&t, a.id, 7).await;
    assert_eq!(after.score, Some(40));
    assert_eq!(after.max_score, 100);
    assert!(t.engine.get_best_submission(student.id, p2.id).await.unwrap().is_none());
}

#[tokio::test]
async fn re_added_problem_keeps_its_best_submission() {
    let t = test_engine().await;
    let p1 = t.engine.create_problem("Stay").await.unwrap();
    let p2 = t.engine.create_problem("Come back").await.unwrap();
    t.provider.set_roster(1, vec![7]);
    let a = t
        .engine
        .create_assignment(assignment_spec(1, vec![problem(p1.id, 100), problem(p2.id, 100)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    let student = participant(&t, a.id, 7).await;
    let (top, _) = t
        .engine
        .record_graded_submission(graded(student.id, p2.id, 90, 1, 1))
        .await
        .unwrap();

    let only_p1 = UpdateAssignment {
        problems: Some(vec![problem(p1.id, 100)]),
        ..Default::default()
    };
    t.engine.update_assignment(a.id, only_p1).await.unwrap();
    assert_eq!(participant(&t, a.id, 7).await.score, None);

    let both = UpdateAssignment {
        problems: Some(vec![problem(p1.id, 100), problem(p2.id, 100)]),
        ..Default::default()
    };
    t.engine.update_assignment(a.id, both).await.unwrap();

    let best = t.engine.get_best_submission(student.id, p2.id).await.unwrap().unwrap();
    assert_eq!((best.submission_id, best.score), (top.id, 90));
    assert_eq!(participant(&t, a.id, 7).await.score, Some(90));

    let (_, worse) = t
        .engine
        .record_graded_submission(graded(student.id, p2.id, 10, 1, 1))
        .await
        .unwrap();
    assert!(!worse.changed());
    assert_eq!(worse.best().score, 90);
    assert_eq!(participant(&t, a.id, 7).await.score, Some(90));
}

#[tokio::test]
async fn student_lifecycle_feeds_statistics() {
    let t = test_engine().await;
    let p = t.engine.create_problem("Fizz").await.unwrap();
    t.provider.set_roster(9, vec![1, 2, 3, 4]);
    let a = t
        .engine
        .create_assignment(assignment_spec(9, vec![problem(p.id, 100)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    t.engine
        .update_assignment(
            a.id,
            UpdateAssignment {
                status: Some(AssignmentStatus::Published),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    t.engine.start_assignment(a.id, 2).await.unwrap();
    t.engine.submit_assignment(a.id, 3).await.unwrap();
    let graded_student = participant(&t, a.id, 4).await;
    t.engine
        .record_graded_submission(graded(graded_student.id, p.id, 70, 5, 5))
        .await
        .unwrap();

    let stats = t.engine.get_assignment_statistics(a.id).await.unwrap();

    assert_eq!(stats.total_students, 4);
    assert_eq!(
        (stats.not_started, stats.in_progress, stats.submitted, stats.graded),
        (1, 1, 1, 1)
    );
    assert_eq!(stats.completion_rate, 50.0);
    assert_eq!(stats.average_score, 70.0);
    assert_eq!(stats.max_score, 100);
}

#[tokio::test]
async fn deleting_assignment_removes_dependents() {
    let t = test_engine().await;
    let p = t.engine.create_problem("Gone").await.unwrap();
    t.provider.set_roster(1, vec![1]);
    let a = t
        .engine
        .create_assignment(assignment_spec(1, vec![problem(p.id, 10)]))
        .await
        .unwrap()
        .assignment;
    t.engine.wait_for_sync_idle().await;
    let student = participant(&t, a.id, 1).await;
    let mut submission = graded(student.id, p.id, 5, 1, 1);
    submission.max_score = 10;
    t.engine.record_graded_submission(submission).await.unwrap();

    t.engine.delete_assignment(a.id).await.unwrap();

    assert!(participants(&t, a.id).await.is_empty());
    assert!(best_submission::Entity::find().all(&t.db).await.unwrap().is_empty());
    assert!(matches!(
        t.engine.get_assignment_statistics(a.id).await,
        Err(EngineError::NotFound { .. })
    ));
}
