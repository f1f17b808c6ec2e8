//! Entry point wiring the engine components around one database.
//!
//! Problem-set writes commit (with the max score recomputed) before the
//! roster sync they trigger is queued, so new participants always copy the
//! committed max score.

use std::sync::Arc;

use db::models::{assignment, assignment_user, best_submission, problem, submission};
use sea_orm::DatabaseConnection;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::assignment_store::{
    AssignmentDetails, AssignmentStore, AssignmentUpdate, CreateAssignment, UpdateAssignment,
};
use crate::best_submission::{BestSubmissionSelector, GradedSubmission, LeaderboardEntry, Selection};
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::locks::KeyedLocks;
use crate::participation::ParticipationTracker;
use crate::roster::RosterProvider;
use crate::roster_sync::{ReconcileReport, RosterSyncCoordinator, SyncReport};
use crate::statistics::{AssignmentStatistics, StatisticsEngine};
use crate::sync_worker::{RosterSyncQueue, SyncJob, spawn_sync_worker};
use crate::SyncMode;

pub struct Engine {
    store: AssignmentStore,
    sync: Arc<RosterSyncCoordinator>,
    queue: RosterSyncQueue,
    worker: JoinHandle<()>,
    selector: BestSubmissionSelector,
    participation: ParticipationTracker,
    statistics: StatisticsEngine,
}

impl Engine {
    /// Builds the engine and starts its roster sync worker. Must be called
    /// from within a tokio runtime.
    pub fn new(
        db: DatabaseConnection,
        provider: Arc<dyn RosterProvider>,
        config: EngineConfig,
    ) -> Self {
        let assignment_locks = Arc::new(KeyedLocks::new());
        let participant_locks = Arc::new(KeyedLocks::new());

        let sync = Arc::new(RosterSyncCoordinator::new(
            db.clone(),
            provider,
            assignment_locks.clone(),
            config.clone(),
        ));
        let (queue, worker) = spawn_sync_worker(sync.clone(), config.sync_queue_capacity);

        Self {
            store: AssignmentStore::new(db.clone(), assignment_locks),
            selector: BestSubmissionSelector::new(
                db.clone(),
                participant_locks.clone(),
                config.max_cas_attempts,
            ),
            participation: ParticipationTracker::new(db.clone(), participant_locks),
            statistics: StatisticsEngine::new(db),
            sync,
            queue,
            worker,
        }
    }

    pub async fn create_problem(&self, title: &str) -> EngineResult<problem::Model> {
        self.store.create_problem(title).await
    }

    /// Creates the assignment and queues the first roster sync for its class.
    pub async fn create_assignment(&self, spec: CreateAssignment) -> EngineResult<AssignmentDetails> {
        let details = self.store.create(spec).await?;
        let a = &details.assignment;
        self.queue.enqueue(SyncJob::incremental(a.id, a.class_id)).await?;
        Ok(details)
    }

    /// Updates the assignment. A class change has already cleared the old
    /// roster, so the new class only needs its students inserted.
    pub async fn update_assignment(
        &self,
        id: i64,
        spec: UpdateAssignment,
    ) -> EngineResult<AssignmentUpdate> {
        let update = self.store.update(id, spec).await?;
        if update.class_changed {
            let class_id = update.details.assignment.class_id;
            self.queue.enqueue(SyncJob::incremental(id, class_id)).await?;
        }
        Ok(update)
    }

    pub async fn delete_assignment(&self, id: i64) -> EngineResult<()> {
        self.store.delete(id).await
    }

    pub async fn get_assignment(&self, id: i64) -> EngineResult<AssignmentDetails> {
        self.store.get(id).await
    }

    pub async fn list_by_teacher(&self, teacher_id: i64) -> EngineResult<Vec<assignment::Model>> {
        self.store.list_by_teacher(teacher_id).await
    }

    pub async fn list_by_class(&self, class_id: i64) -> EngineResult<Vec<assignment::Model>> {
        self.store.list_by_class(class_id).await
    }

    pub async fn list_by_student(&self, student_id: i64) -> EngineResult<Vec<assignment::Model>> {
        self.store.list_by_student(student_id).await
    }

    /// Runs a roster sync now and waits for its result.
    pub async fn sync_roster(
        &self,
        assignment_id: i64,
        class_id: i64,
        mode: SyncMode,
    ) -> EngineResult<SyncReport> {
        self.sync.sync_roster(assignment_id, class_id, mode).await
    }

    /// Queues an incremental sync for every assignment of the class.
    /// Returns how many were queued.
    pub async fn on_enrollment_changed(&self, class_id: i64) -> EngineResult<usize> {
        let assignments = self.store.list_by_class(class_id).await?;
        for a in &assignments {
            self.queue.enqueue(SyncJob::incremental(a.id, class_id)).await?;
        }
        info!(class_id, assignments = assignments.len(), "enrollment changed");
        Ok(assignments.len())
    }

    pub async fn reconcile_failures(&self) -> EngineResult<ReconcileReport> {
        self.sync.reconcile_failures().await
    }

    pub async fn record_graded_submission(
        &self,
        graded: GradedSubmission,
    ) -> EngineResult<(submission::Model, Selection)> {
        self.selector.record_graded_submission(graded).await
    }

    pub async fn on_submission_graded(&self, s: &submission::Model) -> EngineResult<Selection> {
        self.selector.on_submission_graded(s).await
    }

    pub async fn regrade(&self, submission_id: i64, new_score: i64) -> EngineResult<Selection> {
        self.selector.regrade(submission_id, new_score).await
    }

    pub async fn get_best_submission(
        &self,
        assignment_user_id: i64,
        problem_id: i64,
    ) -> EngineResult<Option<best_submission::Model>> {
        self.selector.get_best_submission(assignment_user_id, problem_id).await
    }

    pub async fn list_best_submissions(
        &self,
        assignment_user_id: i64,
    ) -> EngineResult<Vec<best_submission::Model>> {
        self.selector.list_best_submissions(assignment_user_id).await
    }

    pub async fn leaderboard(
        &self,
        assignment_id: i64,
        problem_id: i64,
    ) -> EngineResult<Vec<LeaderboardEntry>> {
        self.selector.leaderboard(assignment_id, problem_id).await
    }

    pub async fn start_assignment(
        &self,
        assignment_id: i64,
        student_id: i64,
    ) -> EngineResult<assignment_user::Model> {
        self.participation.start_assignment(assignment_id, student_id).await
    }

    pub async fn submit_assignment(
        &self,
        assignment_id: i64,
        student_id: i64,
    ) -> EngineResult<assignment_user::Model> {
        self.participation.submit_assignment(assignment_id, student_id).await
    }

    pub async fn get_assignment_statistics(
        &self,
        assignment_id: i64,
    ) -> EngineResult<AssignmentStatistics> {
        self.statistics.get_assignment_statistics(assignment_id).await
    }

    /// Waits until every queued roster sync has been processed.
    pub async fn wait_for_sync_idle(&self) {
        self.queue.wait_idle().await;
    }

    /// Drains the sync queue and stops the worker.
    pub async fn shutdown(self) {
        let Engine { queue, worker, .. } = self;
        queue.wait_idle().await;
        drop(queue);
        if let Err(e) = worker.await {
            error!(error = %e, "roster sync worker panicked");
        }
    }
}
