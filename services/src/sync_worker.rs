//! Background roster synchronisation.
//!
//! Jobs travel over a bounded channel to a single worker task. A job that
//! fails after its retries is dead-lettered and logged; callers never wait
//! for the sync itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use db::models::roster_sync_failure::SyncMode;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::EngineResult;
use crate::roster_sync::RosterSyncCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncJob {
    pub assignment_id: i64,
    pub class_id: i64,
    pub mode: SyncMode,
}

impl SyncJob {
    pub fn incremental(assignment_id: i64, class_id: i64) -> Self {
        Self {
            assignment_id,
            class_id,
            mode: SyncMode::Incremental,
        }
    }

    pub fn full(assignment_id: i64, class_id: i64) -> Self {
        Self {
            assignment_id,
            class_id,
            mode: SyncMode::Full,
        }
    }
}

#[derive(Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Sending half of the sync queue.
#[derive(Clone)]
pub struct RosterSyncQueue {
    sender: mpsc::Sender<SyncJob>,
    coordinator: Arc<RosterSyncCoordinator>,
    pending: Arc<Pending>,
}

impl RosterSyncQueue {
    /// Hands a job to the worker. If the worker is gone the job is
    /// dead-lettered straight away.
    pub async fn enqueue(&self, job: SyncJob) -> EngineResult<()> {
        self.pending.count.fetch_add(1, Ordering::SeqCst);

        match self.sender.send(job).await {
            Ok(()) => {
                debug!(assignment_id = job.assignment_id, class_id = job.class_id, mode = %job.mode, "queued roster sync");
                Ok(())
            }
            Err(mpsc::error::SendError(job)) => {
                self.pending.done();
                error!(
                    assignment_id = job.assignment_id,
                    class_id = job.class_id,
                    "roster sync queue closed, dead-lettering job"
                );
                self.coordinator
                    .dead_letter(job.assignment_id, job.class_id, job.mode, 0, "sync queue closed")
                    .await?;
                Ok(())
            }
        }
    }

    /// Jobs queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::SeqCst)
    }

    /// Resolves once every job enqueued so far has been processed.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.pending.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Starts the worker task and returns the queue feeding it. The worker stops
/// once every queue handle is dropped and the backlog is drained.
pub fn spawn_sync_worker(
    coordinator: Arc<RosterSyncCoordinator>,
    capacity: usize,
) -> (RosterSyncQueue, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let pending = Arc::new(Pending::default());

    let handle = tokio::spawn(run(receiver, coordinator.clone(), pending.clone()));
    let queue = RosterSyncQueue {
        sender,
        coordinator,
        pending,
    };
    (queue, handle)
}

async fn run(
    mut receiver: mpsc::Receiver<SyncJob>,
    coordinator: Arc<RosterSyncCoordinator>,
    pending: Arc<Pending>,
) {
    info!("roster sync worker started");
    while let Some(job) = receiver.recv().await {
        process(&coordinator, job).await;
        pending.done();
    }
    info!("roster sync worker stopped");
}

async fn process(coordinator: &RosterSyncCoordinator, job: SyncJob) {
    let SyncJob {
        assignment_id,
        class_id,
        mode,
    } = job;

    match coordinator.sync_roster(assignment_id, class_id, mode).await {
        Ok(report) if report.stale => {
            debug!(assignment_id, class_id, "dropped stale roster sync");
        }
        Ok(_) => {}
        Err(err) => {
            let attempts = coordinator.attempts_spent(&err);
            error!(assignment_id, class_id, %mode, attempts, error = %err, "roster sync failed");
            if let Err(e) = coordinator
                .dead_letter(assignment_id, class_id, mode, attempts, &err.to_string())
                .await
            {
                error!(assignment_id, class_id, error = %e, "failed to record roster sync failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, RetryPolicy};
    use crate::locks::KeyedLocks;
    use crate::roster::{InMemoryRosterProvider, RosterError};
    use db::models::{assignment, assignment_user, roster_sync_failure};
    use db::test_utils::setup_test_db;
    use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
    use std::time::Duration;

    async fn setup() -> (DatabaseConnection, Arc<RosterSyncCoordinator>, Arc<InMemoryRosterProvider>, i64) {
        let db = setup_test_db().await;
        let a = assignment::ActiveModel {
            teacher_id: Set(1),
            class_id: Set(3),
            title: Set("Recursion".into()),
            allow_late_submission: Set(false),
            status: Set(assignment::AssignmentStatus::Draft),
            max_score: Set(10),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();

        let provider = Arc::new(InMemoryRosterProvider::new());
        let config = EngineConfig {
            roster_timeout: Duration::from_millis(100),
            roster_retry: RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                multiplier: 2.0,
            },
            ..EngineConfig::default()
        };
        let coordinator = Arc::new(RosterSyncCoordinator::new(
            db.clone(),
            provider.clone(),
            Arc::new(KeyedLocks::new()),
            config,
        ));
        (db, coordinator, provider, a.id)
    }

    #[tokio::test]
    async fn worker_applies_queued_jobs() {
        let (db, coordinator, provider, id) = setup().await;
        provider.set_roster(3, vec![1, 2]);
        let (queue, handle) = spawn_sync_worker(coordinator, 4);

        queue.enqueue(SyncJob::incremental(id, 3)).await.unwrap();
        queue.wait_idle().await;

        assert_eq!(assignment_user::Model::find_by_assignment(&db, id).await.unwrap().len(), 2);
        drop(queue);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn failed_job_is_dead_lettered() {
        let (db, coordinator, provider, id) = setup().await;
        provider.fail_next(2, RosterError::Timeout(Duration::from_millis(100)));
        let (queue, _handle) = spawn_sync_worker(coordinator, 4);

        queue.enqueue(SyncJob::incremental(id, 3)).await.unwrap();
        queue.wait_idle().await;

        let failures = roster_sync_failure::Model::find_by_assignment(&db, id).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 2);
        assert!(!failures[0].resolved);
    }

    #[tokio::test]
    async fn closed_queue_dead_letters_immediately() {
        let (db, coordinator, _provider, id) = setup().await;
        let (queue, handle) = spawn_sync_worker(coordinator, 1);
        handle.abort();
        let _ = handle.await;

        queue.enqueue(SyncJob::full(id, 3)).await.unwrap();

        let failures = roster_sync_failure::Model::find_by_assignment(&db, id).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].mode, SyncMode::Full);
        assert_eq!(queue.pending(), 0);
    }
}
