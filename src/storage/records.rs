use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Pool, Postgres};
use tracing::debug;

use crate::crawler::task::{DetailDraft, DetailRecord, ImageRecord, ImageStatus};

/// Scraped detail records and their images
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Store a detail record and one PENDING image row per URL, atomically
    async fn insert_detail(&self, draft: &DetailDraft) -> Result<i64>;

    async fn details_for_link(&self, link_id: i64) -> Result<Vec<DetailRecord>>;

    /// Details created in `[start, end)`, newest first
    async fn details_created_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DetailRecord>>;

    /// PENDING images, oldest first, optionally limited to a domain
    async fn pending_images(&self, limit: i64, domain: Option<&str>) -> Result<Vec<ImageRecord>>;

    /// FAILED images with fewer than `max_attempts` attempts
    async fn failed_images(&self, limit: i64, max_attempts: i32, domain: Option<&str>) -> Result<Vec<ImageRecord>>;

    /// Record one download attempt
    async fn record_image(
        &self,
        image_id: i64,
        status: ImageStatus,
        file_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<()>;
}

#[derive(sqlx::FromRow)]
struct DetailRow {
    id: i64,
    link_id: i64,
    url: String,
    domain: Option<String>,
    fields: Json<serde_json::Value>,
    image_count: i32,
    created_at: DateTime<Utc>,
}

impl From<DetailRow> for DetailRecord {
    fn from(row: DetailRow) -> Self {
        DetailRecord {
            id: row.id,
            link_id: row.link_id,
            url: row.url,
            domain: row.domain,
            fields: row.fields.0,
            image_count: row.image_count,
            created_at: row.created_at,
        }
    }
}

const DETAIL_COLUMNS: &str = "id, link_id, url, domain, fields, image_count, created_at";

#[derive(sqlx::FromRow)]
struct ImageRow {
    id: i64,
    detail_id: i64,
    image_url: String,
    idx: i32,
    status: String,
    attempts: i32,
    file_path: Option<String>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<ImageRow> for ImageRecord {
    fn from(row: ImageRow) -> Self {
        ImageRecord {
            id: row.id,
            detail_id: row.detail_id,
            image_url: row.image_url,
            idx: row.idx,
            status: ImageStatus::parse(&row.status).unwrap_or(ImageStatus::Failed),
            attempts: row.attempts,
            file_path: row.file_path,
            error: row.error,
            updated_at: row.updated_at,
        }
    }
}

const IMAGE_COLUMNS: &str = "i.id, i.detail_id, i.image_url, i.idx, i.status, i.attempts, \
    i.file_path, i.error, i.updated_at";

/// PostgreSQL implementation of RecordStore
pub struct PgRecordStore {
    pool: Pool<Postgres>,
}

impl PgRecordStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn insert_detail(&self, draft: &DetailDraft) -> Result<i64> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let detail_id: i64 = sqlx::query_scalar(
            "INSERT INTO detail_records (link_id, url, domain, fields, image_count)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(draft.link_id)
        .bind(&draft.url)
        .bind(draft.domain.as_deref())
        .bind(Json(&draft.fields))
        .bind(i32::try_from(draft.images.len()).unwrap_or(i32::MAX))
        .fetch_one(&mut *tx)
        .await
        .context(format!("Failed to insert detail record for {}", draft.url))?;

        if !draft.images.is_empty() {
            sqlx::query(
                "INSERT INTO detail_images (detail_id, image_url, idx)
                 SELECT $1, u, (o - 1)::int FROM UNNEST($2::text[]) WITH ORDINALITY AS t(u, o)",
            )
            .bind(detail_id)
            .bind(&draft.images)
            .execute(&mut *tx)
            .await
            .context(format!("Failed to insert images for {}", draft.url))?;
        }

        tx.commit().await.context("Failed to commit detail record")?;

        debug!(detail_id, images = draft.images.len(), "Stored detail record");

        Ok(detail_id)
    }

    async fn details_for_link(&self, link_id: i64) -> Result<Vec<DetailRecord>> {
        let rows: Vec<DetailRow> = sqlx::query_as(&format!(
            "SELECT {DETAIL_COLUMNS} FROM detail_records WHERE link_id = $1 ORDER BY id"
        ))
        .bind(link_id)
        .fetch_all(&self.pool)
        .await
        .context(format!("Failed to load details of link {}", link_id))?;

        Ok(rows.into_iter().map(DetailRecord::from).collect())
    }

    async fn details_created_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DetailRecord>> {
        let rows: Vec<DetailRow> = sqlx::query_as(&format!(
            "SELECT {DETAIL_COLUMNS} FROM detail_records
             WHERE created_at >= $1 AND created_at < $2
             ORDER BY id DESC"
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load details for the report window")?;

        Ok(rows.into_iter().map(DetailRecord::from).collect())
    }

    async fn pending_images(&self, limit: i64, domain: Option<&str>) -> Result<Vec<ImageRecord>> {
        let rows: Vec<ImageRow> = sqlx::query_as(&format!(
            "SELECT {IMAGE_COLUMNS} FROM detail_images i
             JOIN detail_records d ON d.id = i.detail_id
             WHERE i.status = 'PENDING' AND ($1::text IS NULL OR d.domain = $1)
             ORDER BY i.id ASC LIMIT $2"
        ))
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query pending images")?;

        Ok(rows.into_iter().map(ImageRecord::from).collect())
    }

    async fn failed_images(&self, limit: i64, max_attempts: i32, domain: Option<&str>) -> Result<Vec<ImageRecord>> {
        let rows: Vec<ImageRow> = sqlx::query_as(&format!(
            "SELECT {IMAGE_COLUMNS} FROM detail_images i
             JOIN detail_records d ON d.id = i.detail_id
             WHERE i.status = 'FAILED' AND i.attempts < $2 AND ($1::text IS NULL OR d.domain = $1)
             ORDER BY i.id ASC LIMIT $3"
        ))
        .bind(domain)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query failed images")?;

        Ok(rows.into_iter().map(ImageRecord::from).collect())
    }

    async fn record_image(
        &self,
        image_id: i64,
        status: ImageStatus,
        file_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE detail_images
             SET status = $2, file_path = COALESCE($3, file_path), error = $4,
                 attempts = attempts + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(image_id)
        .bind(status.as_str())
        .bind(file_path)
        .bind(error)
        .execute(&self.pool)
        .await
        .context(format!("Failed to update image {}", image_id))?;

        Ok(())
    }
}
