//! Periodic sweep that moves due tasks onto the publish queue
//!
//! Every `interval` the scheduler looks for WAITING tasks scheduled before
//! `now + window` (overdue ones included) and enqueues them under their
//! `queue_job_id`. Tasks that already have a job are counted as duplicates
//! and left alone, so overlapping sweeps and manual triggers are harmless.
//!
//! Each sweep also returns jobs stuck in `active` after a crash to the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{QueueConfig, SchedulerConfig};
use crate::db::Database;
use crate::dispatch::DispatchQueue;
use crate::error::Result;
use crate::pipeline::MediaPipeline;
use crate::queue::{EnqueueOutcome, JobQueue};

/// Tasks enqueued per sweep at most
const SWEEP_BATCH: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub found: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub recovered: u64,
}

pub struct Scheduler {
    db: Database,
    dispatch: DispatchQueue,
    queues: Vec<JobQueue>,
    interval: Duration,
    window: Duration,
    stalled_after: Duration,
}

impl Scheduler {
    pub fn new(
        db: Database,
        dispatch: DispatchQueue,
        pipeline: &MediaPipeline,
        scheduler: &SchedulerConfig,
        queue: &QueueConfig,
    ) -> Self {
        let queues = vec![dispatch.queue().clone(), pipeline.queue().clone()];
        Self {
            db,
            dispatch,
            queues,
            interval: scheduler.interval(),
            window: scheduler.window(),
            stalled_after: queue.stalled_after(),
        }
    }

    /// Also recover stalled jobs on `queue`
    pub fn with_queue(mut self, queue: JobQueue) -> Self {
        self.queues.push(queue);
        self
    }

    /// Recover stalled jobs on every queue
    pub async fn recover_stalled(&self) -> Result<u64> {
        let mut recovered = 0;
        for queue in &self.queues {
            recovered += queue.recover_stalled(self.stalled_after).await?;
        }
        Ok(recovered)
    }

    /// Run one sweep
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport {
            recovered: self.recover_stalled().await?,
            ..Default::default()
        };

        let until = chrono::Utc::now().timestamp() + self.window.as_secs() as i64;
        let due = self.db.tasks_due(until, SWEEP_BATCH).await?;
        report.found = due.len();

        for task in &due {
            match self.dispatch.enqueue(task).await? {
                EnqueueOutcome::Added => report.enqueued += 1,
                EnqueueOutcome::AlreadyQueued(state) => {
                    debug!(task_id = %task.id, state = state.as_str(), "Task already queued");
                    report.duplicates += 1;
                }
            }
        }

        if report.found > 0 || report.recovered > 0 {
            info!(
                found = report.found,
                enqueued = report.enqueued,
                duplicates = report.duplicates,
                recovered = report.recovered,
                "Scheduler sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` is set
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        info!(interval_secs = self.interval.as_secs(), window_secs = self.window.as_secs(), "Scheduler started");

        let tick = Duration::from_millis(250).min(self.interval.max(Duration::from_millis(1)));
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            if let Err(e) = self.sweep().await {
                error!(error = %e, "Scheduler sweep failed");
            }

            // Sleep in short ticks so shutdown is noticed quickly
            let mut slept = Duration::ZERO;
            while slept < self.interval && !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(tick).await;
                slept += tick;
            }
        }

        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MediaConfig;
    use crate::queue::JobState;
    use crate::types::{Account, ContentRefs, Destination, PublishTask};

    async fn setup() -> (Database, Scheduler, DispatchQueue) {
        let db = Database::in_memory().await.unwrap();
        let dispatch = DispatchQueue::new(db.clone(), &QueueConfig::default());
        let pipeline = MediaPipeline::new(db.clone(), &MediaConfig::default());
        let queue = QueueConfig {
            stalled_after_secs: 0,
            ..Default::default()
        };
        let scheduler = Scheduler::new(db.clone(), dispatch.clone(), &pipeline, &SchedulerConfig::default(), &queue);
        (db, scheduler, dispatch)
    }

    async fn task_at(db: &Database, offset_secs: i64) -> PublishTask {
        let account = Account {
            id: "acc-1".to_string(),
            owner_id: "user-1".to_string(),
            destination: Destination::Twitter,
            destination_uid: "creator".to_string(),
        };
        let content = ContentRefs {
            description: Some("scheduled".to_string()),
            ..Default::default()
        };
        let task = PublishTask::new(&account, content, chrono::Utc::now().timestamp() + offset_secs);
        db.create_task(&task).await.unwrap();
        task
    }

    #[tokio::test]
    async fn test_sweep_enqueues_due_and_overdue_tasks() {
        let (db, scheduler, dispatch) = setup().await;
        let overdue = task_at(&db, -600).await;
        let soon = task_at(&db, 60).await;
        let later = task_at(&db, 3600).await;

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report.found, 2);
        assert_eq!(report.enqueued, 2);
        assert!(dispatch.job(&overdue).await.unwrap().is_some());
        assert_eq!(dispatch.job(&soon).await.unwrap().unwrap().state, JobState::Delayed);
        assert!(dispatch.job(&later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_sweeps_do_not_double_enqueue() {
        let (db, scheduler, _dispatch) = setup().await;
        task_at(&db, 30).await;

        scheduler.sweep().await.unwrap();
        let second = scheduler.sweep().await.unwrap();

        assert_eq!(second.found, 1);
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.duplicates, 1);
    }

    #[tokio::test]
    async fn test_sweep_recovers_stalled_jobs() {
        let (db, scheduler, dispatch) = setup().await;
        let task = task_at(&db, -10).await;
        dispatch.enqueue(&task).await.unwrap();
        let claimed = dispatch.queue().claim().await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report.recovered, 1);
        assert_eq!(dispatch.job(&task).await.unwrap().unwrap().state, JobState::Waiting);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_db, scheduler, _dispatch) = setup().await;
        let shutdown = Arc::new(AtomicBool::new(true));
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(shutdown))
            .await
            .unwrap();
    }
}
