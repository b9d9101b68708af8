use anyhow::Result;
use chrono::{Local, Utc};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::config::SchedulerSettings;
use crate::crawler::controller::CrawlerController;
use crate::crawler::report::DailyReport;
use crate::crawler::runlog::RunLogger;
use crate::crawler::task::{LogStatus, RunStage};
use crate::storage::tasks::TaskStore;
use crate::storage::TaskClaim;

/// Polls the task store for due tasks and runs each on its own tokio task
pub struct Scheduler {
    /// Shared by every worker
    controller: Arc<CrawlerController>,

    tasks: Arc<dyn TaskStore>,

    settings: SchedulerSettings,

    report: DailyReport,

    /// Workers launched by this loop with their task ids, reaped every iteration
    workers: Vec<(i64, JoinHandle<()>)>,
}

impl Scheduler {
    /// Create a new scheduler driving the given controller
    pub fn new(controller: Arc<CrawlerController>, settings: SchedulerSettings) -> Self {
        let tasks = controller.storage().tasks.clone();
        let report = DailyReport::new(
            controller.config().report.clone(),
            controller.storage().records.clone(),
        );
        Self {
            controller,
            tasks,
            settings,
            report,
            workers: Vec::new(),
        }
    }

    /// Workers still running
    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|(_, w)| !w.is_finished()).count()
    }

    fn reap(&mut self) {
        let before = self.workers.len();
        self.workers.retain(|(_, w)| !w.is_finished());
        let reaped = before - self.workers.len();
        if reaped > 0 {
            debug!(reaped, "Reaped finished workers");
        }
    }

    /// One scheduler iteration. Returns the number of workers launched.
    pub async fn tick(&mut self, shutdown: &CancellationToken) -> Result<usize> {
        self.reap();

        let reset = self
            .tasks
            .reset_stale_running(self.settings.stale_task_timeout())
            .await?;
        if reset > 0 {
            warn!(reset, "Released tasks with a stale heartbeat");
        }

        let due = self.tasks.due_tasks(Utc::now()).await?;
        let mut launched = 0;

        for task in due {
            if shutdown.is_cancelled() {
                break;
            }

            // Re-checks is_running, then claims with a conditional update
            let Some(claim) = TaskClaim::acquire(self.tasks.clone(), task.id).await? else {
                continue;
            };

            if launched > 0 && !self.settings.launch_spacing().is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        claim.abandon().await?;
                        break;
                    }
                    _ = tokio::time::sleep(self.settings.launch_spacing()) => {}
                }
            }

            RunLogger::new(self.tasks.clone(), task.id)
                .log(RunStage::Task, LogStatus::Queued, "Queued for execution")
                .await;

            self.launch(claim, shutdown.clone());
            launched += 1;
        }

        Ok(launched)
    }

    fn launch(&mut self, claim: TaskClaim, shutdown: CancellationToken) {
        let controller = self.controller.clone();
        let store = claim.store().clone();
        let task_id = claim.task_id();

        info!(task_id, "Launching worker");

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(controller.run_task(claim, &shutdown))
                .catch_unwind()
                .await;

            let failure = match result {
                Ok(Ok(outcome)) => {
                    debug!(task_id, ?outcome, "Worker finished");
                    None
                }
                Ok(Err(e)) => Some(format!("Worker failed: {:#}", e)),
                Err(panic) => Some(format!("Worker crashed: {}", panic_message(panic.as_ref()))),
            };

            if let Some(reason) = failure {
                error!(task_id, "{}", reason);
                if let Err(e) = store.release_task(task_id).await {
                    error!(task_id, "Failed to release task: {:#}", e);
                }
                RunLogger::new(store, task_id)
                    .log(RunStage::Task, LogStatus::Error, reason)
                    .await;
            }
        });

        self.workers.push((task_id, handle));
    }

    /// Run as the only scheduler of this database. Tasks still flagged running
    /// were left by a previous scheduler that died, so they are released first.
    pub async fn serve(&mut self, shutdown: CancellationToken) -> Result<()> {
        let lock = self.controller.storage().lock.clone();
        if !lock.try_lock_service().await? {
            anyhow::bail!("Another scheduler is already running against this database");
        }

        let result = self.serve_locked(shutdown).await;

        if let Err(e) = lock.unlock_service().await {
            warn!("Failed to release the service lock: {:#}", e);
        }

        result
    }

    async fn serve_locked(&mut self, shutdown: CancellationToken) -> Result<()> {
        let reset = self.tasks.reset_all_running().await?;
        if reset > 0 {
            info!(reset, "Released tasks left running by a previous scheduler");
        }

        self.run(shutdown).await
    }

    /// Run until `shutdown` fires, then drain workers and release the tasks
    /// this loop still holds. Tasks claimed by other processes are left alone.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            poll_secs = self.settings.poll_interval_secs,
            "Scheduler started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = match self.tick(&shutdown).await {
                Ok(launched) => {
                    if launched > 0 {
                        debug!(launched, "Launched workers");
                    }
                    self.settings.poll_interval()
                }
                Err(e) => {
                    error!("Scheduler iteration failed: {:#}", e);
                    self.controller
                        .notifier()
                        .send(&format!("Scheduler error: {:#}", e))
                        .await;
                    self.settings.error_backoff()
                }
            };

            if let Err(e) = self.report.maybe_write(Local::now()).await {
                error!("Daily report failed: {:#}", e);
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(workers = self.active_workers(), "Scheduler stopping");

        let unfinished = self.join_workers(self.settings.shutdown_grace()).await;
        if !unfinished.is_empty() {
            warn!(aborted = unfinished.len(), "Aborted workers that outlived the grace period");
        }

        for task_id in unfinished {
            self.tasks.release_task(task_id).await?;
            info!(task_id, "Released task of aborted worker");
        }

        Ok(())
    }

    /// Wait up to `grace` for all workers, aborting the rest.
    /// Returns the task ids whose worker did not hand its task back.
    pub async fn join_workers(&mut self, grace: Duration) -> Vec<i64> {
        let deadline = Instant::now() + grace;
        let mut unfinished = Vec::new();

        for (task_id, mut handle) in self.workers.drain(..) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(task_id, "Worker ended abnormally: {}", e);
                    unfinished.push(task_id);
                }
                Err(_) => {
                    handle.abort();
                    unfinished.push(task_id);
                }
            }
        }

        unfinished
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
