use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::crawler::schedule::Schedule;
use crate::crawler::task::{
    DetailParams, ImageParams, ListingParams, LogStatus, Partition, RunLogEntry, RunStage,
    StageToggles, Task, TaskDefinition, TaskFlags, WaitRange,
};

/// Durable task definitions, run-state flags and the run log
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, def: &TaskDefinition) -> Result<i64>;

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>>;

    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Active, idle tasks whose run is due, `run_now` first then by id
    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn is_running(&self, task_id: i64) -> Result<bool>;

    /// Flip `is_running` 0→1 if the task is still eligible and due at `now`.
    /// True when this caller won.
    async fn try_claim(&self, task_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Refresh `updated_at` of a running task
    async fn heartbeat(&self, task_id: i64) -> Result<()>;

    async fn is_cancel_requested(&self, task_id: i64) -> Result<bool>;

    /// End a run: record times and clear `is_running`, `cancel_requested`, `run_now`
    async fn finish_run(&self, task_id: i64, last_run_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Result<()>;

    /// Clear `is_running` and `cancel_requested` without touching the schedule
    async fn release_task(&self, task_id: i64) -> Result<()>;

    /// Release running tasks whose heartbeat is older than `timeout`
    async fn reset_stale_running(&self, timeout: Duration) -> Result<u64>;

    /// Release every running task. Only safe while holding the service lock.
    async fn reset_all_running(&self) -> Result<u64>;

    async fn set_active(&self, task_id: i64, active: bool) -> Result<bool>;

    async fn trigger_run_now(&self, task_id: i64) -> Result<bool>;

    /// Ask a running task to stop. False when the task is not running.
    async fn request_cancel(&self, task_id: i64) -> Result<bool>;

    async fn append_log(&self, task_id: i64, stage: RunStage, status: LogStatus, message: &str) -> Result<()>;

    /// Most recent entries first
    async fn recent_logs(&self, task_id: i64, limit: i64) -> Result<Vec<RunLogEntry>>;
}

/// Exclusive right to run a task, obtained through [`TaskClaim::acquire`].
/// Terminal transitions consume the claim.
pub struct TaskClaim {
    task_id: i64,
    store: Arc<dyn TaskStore>,
}

impl std::fmt::Debug for TaskClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskClaim").field("task_id", &self.task_id).finish()
    }
}

impl TaskClaim {
    /// Re-check `is_running`, then claim with a conditional update
    pub async fn acquire(store: Arc<dyn TaskStore>, task_id: i64) -> Result<Option<Self>> {
        if store.is_running(task_id).await? {
            debug!(task_id, "Task already running");
            return Ok(None);
        }

        if !store.try_claim(task_id, Utc::now()).await? {
            debug!(task_id, "Task claimed elsewhere or no longer eligible");
            return Ok(None);
        }

        Ok(Some(Self { task_id, store }))
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Completed or cancelled run: reschedule and clear the run flags
    pub async fn finish(self, started_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Result<()> {
        self.store
            .finish_run(self.task_id, started_at, next_run_at)
            .await
            .context(format!("Failed to finish run of task {}", self.task_id))
    }

    /// Give the task back without rescheduling it
    pub async fn abandon(self) -> Result<()> {
        self.store
            .release_task(self.task_id)
            .await
            .context(format!("Failed to release task {}", self.task_id))
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    name: String,
    active: bool,
    is_running: bool,
    cancel_requested: bool,
    run_now: bool,
    enable_listing: bool,
    enable_detail: bool,
    enable_image: bool,
    schedule_type: String,
    interval_minutes: Option<i32>,
    run_times: Option<String>,
    start_url: Option<String>,
    listing_template_path: Option<String>,
    detail_template_path: Option<String>,
    max_pages: i32,
    domain: Option<String>,
    category: Option<String>,
    listing_wait_load_min: f64,
    listing_wait_load_max: f64,
    listing_wait_next_min: f64,
    listing_wait_next_max: f64,
    listing_fake_scroll: bool,
    detail_wait_load_min: f64,
    detail_wait_load_max: f64,
    detail_delay_min: f64,
    detail_delay_max: f64,
    detail_max_retries: i32,
    image_dir: Option<String>,
    images_per_minute: i32,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            name: row.name,
            schedule: Schedule::from_columns(&row.schedule_type, row.interval_minutes, row.run_times.as_deref()),
            flags: TaskFlags {
                active: row.active,
                is_running: row.is_running,
                cancel_requested: row.cancel_requested,
                run_now: row.run_now,
            },
            stages: StageToggles {
                listing: row.enable_listing,
                detail: row.enable_detail,
                image: row.enable_image,
            },
            partition: Partition::new(row.domain, row.category),
            listing: ListingParams {
                start_url: row.start_url,
                template_path: row.listing_template_path.map(PathBuf::from),
                max_pages: u32::try_from(row.max_pages).unwrap_or(1).max(1),
                wait_load: WaitRange::new(row.listing_wait_load_min, row.listing_wait_load_max),
                wait_next: WaitRange::new(row.listing_wait_next_min, row.listing_wait_next_max),
                fake_scroll: row.listing_fake_scroll,
            },
            detail: DetailParams {
                template_path: row.detail_template_path.map(PathBuf::from),
                wait_load: WaitRange::new(row.detail_wait_load_min, row.detail_wait_load_max),
                delay: WaitRange::new(row.detail_delay_min, row.detail_delay_max),
                max_retries: u32::try_from(row.detail_max_retries).unwrap_or(0),
            },
            image: ImageParams {
                image_dir: row.image_dir.map(PathBuf::from),
                images_per_minute: u32::try_from(row.images_per_minute).unwrap_or(1),
            },
            last_run_at: row.last_run_at,
            next_run_at: row.next_run_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: i64,
    task_id: i64,
    stage: String,
    status: String,
    message: String,
    created_at: DateTime<Utc>,
}

const TASK_COLUMNS: &str = "id, name, active, is_running, cancel_requested, run_now, \
    enable_listing, enable_detail, enable_image, schedule_type, interval_minutes, run_times, \
    start_url, listing_template_path, detail_template_path, max_pages, domain, category, \
    listing_wait_load_min, listing_wait_load_max, listing_wait_next_min, listing_wait_next_max, \
    listing_fake_scroll, detail_wait_load_min, detail_wait_load_max, detail_delay_min, \
    detail_delay_max, detail_max_retries, image_dir, images_per_minute, \
    last_run_at, next_run_at, updated_at";

fn path_text(path: &Option<PathBuf>) -> Option<String> {
    path.as_ref().map(|p| p.to_string_lossy().into_owned())
}

/// PostgreSQL implementation of TaskStore
pub struct PgTaskStore {
    pool: Pool<Postgres>,
}

impl PgTaskStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn update_flag(&self, sql: &str, task_id: i64, what: &str) -> Result<bool> {
        let result = sqlx::query(sql)
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context(format!("Failed to {} task {}", what, task_id))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task(&self, def: &TaskDefinition) -> Result<i64> {
        let (schedule_type, interval_minutes, run_times) = def.schedule.to_columns();
        let to_i32 = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO crawl_tasks (
                name, active, enable_listing, enable_detail, enable_image,
                schedule_type, interval_minutes, run_times,
                start_url, listing_template_path, detail_template_path, max_pages,
                domain, category,
                listing_wait_load_min, listing_wait_load_max, listing_wait_next_min, listing_wait_next_max,
                listing_fake_scroll,
                detail_wait_load_min, detail_wait_load_max, detail_delay_min, detail_delay_max,
                detail_max_retries, image_dir, images_per_minute
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26
            ) RETURNING id",
        )
        .bind(&def.name)
        .bind(def.active)
        .bind(def.stages.listing)
        .bind(def.stages.detail)
        .bind(def.stages.image)
        .bind(schedule_type)
        .bind(interval_minutes)
        .bind(run_times)
        .bind(def.listing.start_url.as_deref())
        .bind(path_text(&def.listing.template_path))
        .bind(path_text(&def.detail.template_path))
        .bind(to_i32(def.listing.max_pages.max(1)))
        .bind(def.partition.domain.as_deref())
        .bind(def.partition.category.as_deref())
        .bind(def.listing.wait_load.min)
        .bind(def.listing.wait_load.max)
        .bind(def.listing.wait_next.min)
        .bind(def.listing.wait_next.max)
        .bind(def.listing.fake_scroll)
        .bind(def.detail.wait_load.min)
        .bind(def.detail.wait_load.max)
        .bind(def.detail.delay.min)
        .bind(def.detail.delay.max)
        .bind(to_i32(def.detail.max_retries))
        .bind(path_text(&def.image.image_dir))
        .bind(to_i32(def.image.images_per_minute))
        .fetch_one(&self.pool)
        .await
        .context(format!("Failed to create task '{}'", def.name))?;

        info!(task_id = id, name = %def.name, "Created task");

        Ok(id)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks WHERE id = $1"
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .context(format!("Failed to load task {}", task_id))?;

        Ok(row.map(Task::from))
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list tasks")?;

        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM crawl_tasks
             WHERE active AND NOT is_running AND NOT cancel_requested
               AND (run_now OR next_run_at IS NULL OR next_run_at <= $1)
             ORDER BY run_now DESC, id ASC"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query due tasks")?;

        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn is_running(&self, task_id: i64) -> Result<bool> {
        let running: Option<bool> = sqlx::query_scalar("SELECT is_running FROM crawl_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to read running flag of task {}", task_id))?;

        Ok(running.unwrap_or(false))
    }

    async fn try_claim(&self, task_id: i64, now: DateTime<Utc>) -> Result<bool> {
        // Same predicate as due_tasks, so a stale due list cannot rerun a finished task
        let result = sqlx::query(
            "UPDATE crawl_tasks SET is_running = TRUE, updated_at = NOW()
             WHERE id = $1 AND active AND NOT is_running AND NOT cancel_requested
               AND (run_now OR next_run_at IS NULL OR next_run_at <= $2)",
        )
        .bind(task_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(format!("Failed to claim task {}", task_id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(&self, task_id: i64) -> Result<()> {
        self.update_flag(
            "UPDATE crawl_tasks SET updated_at = NOW() WHERE id = $1 AND is_running",
            task_id,
            "heartbeat",
        )
        .await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, task_id: i64) -> Result<bool> {
        let requested: Option<bool> = sqlx::query_scalar("SELECT cancel_requested FROM crawl_tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to read cancel flag of task {}", task_id))?;

        Ok(requested.unwrap_or(false))
    }

    async fn finish_run(&self, task_id: i64, last_run_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE crawl_tasks
             SET last_run_at = $2, next_run_at = $3,
                 is_running = FALSE, cancel_requested = FALSE, run_now = FALSE,
                 updated_at = NOW()
             WHERE id = $1",
        )
        .bind(task_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .execute(&self.pool)
        .await
        .context(format!("Failed to record run of task {}", task_id))?;

        Ok(())
    }

    async fn release_task(&self, task_id: i64) -> Result<()> {
        self.update_flag(
            "UPDATE crawl_tasks SET is_running = FALSE, cancel_requested = FALSE, updated_at = NOW()
             WHERE id = $1",
            task_id,
            "release",
        )
        .await?;
        Ok(())
    }

    async fn reset_stale_running(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE crawl_tasks SET is_running = FALSE, cancel_requested = FALSE
             WHERE is_running AND updated_at < NOW() - ($1 * INTERVAL '1 second')",
        )
        .bind(timeout.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .context("Failed to reset stale running tasks")?;

        Ok(result.rows_affected())
    }

    async fn reset_all_running(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE crawl_tasks SET is_running = FALSE, cancel_requested = FALSE WHERE is_running",
        )
        .execute(&self.pool)
        .await
        .context("Failed to reset running tasks")?;

        Ok(result.rows_affected())
    }

    async fn set_active(&self, task_id: i64, active: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE crawl_tasks SET active = $2 WHERE id = $1")
            .bind(task_id)
            .bind(active)
            .execute(&self.pool)
            .await
            .context(format!("Failed to update task {}", task_id))?;

        Ok(result.rows_affected() > 0)
    }

    async fn trigger_run_now(&self, task_id: i64) -> Result<bool> {
        self.update_flag("UPDATE crawl_tasks SET run_now = TRUE WHERE id = $1", task_id, "trigger")
            .await
    }

    async fn request_cancel(&self, task_id: i64) -> Result<bool> {
        self.update_flag(
            "UPDATE crawl_tasks SET cancel_requested = TRUE WHERE id = $1 AND is_running",
            task_id,
            "cancel",
        )
        .await
    }

    async fn append_log(&self, task_id: i64, stage: RunStage, status: LogStatus, message: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO crawl_task_logs (task_id, stage, status, message) VALUES ($1, $2, $3, $4)",
        )
        .bind(task_id)
        .bind(stage.as_str())
        .bind(status.as_str())
        .bind(message)
        .execute(&self.pool)
        .await
        .context(format!("Failed to write log for task {}", task_id))?;

        Ok(())
    }

    async fn recent_logs(&self, task_id: i64, limit: i64) -> Result<Vec<RunLogEntry>> {
        let rows: Vec<LogRow> = sqlx::query_as(
            "SELECT id, task_id, stage, status, message, created_at
             FROM crawl_task_logs WHERE task_id = $1
             ORDER BY id DESC LIMIT $2",
        )
        .bind(task_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await
        .context(format!("Failed to read logs of task {}", task_id))?;

        Ok(rows
            .into_iter()
            .map(|r| RunLogEntry {
                id: r.id,
                task_id: r.task_id,
                stage: r.stage,
                status: r.status,
                message: r.message,
                created_at: r.created_at,
            })
            .collect())
    }
}
