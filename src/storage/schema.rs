use anyhow::{Result, Context};
use sqlx::{Pool, Postgres};
use tracing::debug;

/// Idempotent DDL, executed one statement at a time
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS crawl_tasks (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        active BOOLEAN NOT NULL DEFAULT TRUE,
        is_running BOOLEAN NOT NULL DEFAULT FALSE,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        run_now BOOLEAN NOT NULL DEFAULT FALSE,
        enable_listing BOOLEAN NOT NULL DEFAULT TRUE,
        enable_detail BOOLEAN NOT NULL DEFAULT TRUE,
        enable_image BOOLEAN NOT NULL DEFAULT FALSE,
        schedule_type TEXT NOT NULL DEFAULT 'interval',
        interval_minutes INTEGER,
        run_times TEXT,
        start_url TEXT,
        listing_template_path TEXT,
        detail_template_path TEXT,
        max_pages INTEGER NOT NULL DEFAULT 1,
        domain TEXT,
        category TEXT,
        listing_wait_load_min DOUBLE PRECISION NOT NULL DEFAULT 20,
        listing_wait_load_max DOUBLE PRECISION NOT NULL DEFAULT 30,
        listing_wait_next_min DOUBLE PRECISION NOT NULL DEFAULT 10,
        listing_wait_next_max DOUBLE PRECISION NOT NULL DEFAULT 20,
        listing_fake_scroll BOOLEAN NOT NULL DEFAULT TRUE,
        detail_wait_load_min DOUBLE PRECISION NOT NULL DEFAULT 2,
        detail_wait_load_max DOUBLE PRECISION NOT NULL DEFAULT 5,
        detail_delay_min DOUBLE PRECISION NOT NULL DEFAULT 2,
        detail_delay_max DOUBLE PRECISION NOT NULL DEFAULT 3,
        detail_max_retries INTEGER NOT NULL DEFAULT 2,
        image_dir TEXT,
        images_per_minute INTEGER NOT NULL DEFAULT 30,
        last_run_at TIMESTAMPTZ,
        next_run_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_crawl_tasks_due
        ON crawl_tasks (active, is_running, next_run_at)",
    "CREATE TABLE IF NOT EXISTS crawl_task_logs (
        id BIGSERIAL PRIMARY KEY,
        task_id BIGINT NOT NULL REFERENCES crawl_tasks(id),
        stage TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT NOT NULL DEFAULT '',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_crawl_task_logs_task
        ON crawl_task_logs (task_id, id)",
    "CREATE TABLE IF NOT EXISTS work_queue (
        id BIGSERIAL PRIMARY KEY,
        url TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL DEFAULT 'PENDING',
        domain TEXT,
        category TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_work_queue_lease
        ON work_queue (status, domain, category, id)",
    "CREATE TABLE IF NOT EXISTS detail_records (
        id BIGSERIAL PRIMARY KEY,
        link_id BIGINT NOT NULL REFERENCES work_queue(id),
        url TEXT NOT NULL,
        domain TEXT,
        fields JSONB NOT NULL,
        image_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_detail_records_link
        ON detail_records (link_id)",
    "CREATE TABLE IF NOT EXISTS detail_images (
        id BIGSERIAL PRIMARY KEY,
        detail_id BIGINT NOT NULL REFERENCES detail_records(id) ON DELETE CASCADE,
        image_url TEXT NOT NULL,
        idx INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'PENDING',
        attempts INTEGER NOT NULL DEFAULT 0,
        file_path TEXT,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )",
    "CREATE INDEX IF NOT EXISTS idx_detail_images_status
        ON detail_images (status, id)",
];

/// Create the tables if they do not exist yet
pub async fn ensure_schema(pool: &Pool<Postgres>) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("Failed to apply schema")?;
    }

    debug!("Ensured schema exists");

    Ok(())
}
