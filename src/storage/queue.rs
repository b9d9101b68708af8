use anyhow::{Result, Context};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Pool, Postgres, Transaction};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::crawler::task::{LinkStatus, Partition, QueueCounts, QueuedLink};
use crate::storage::url::normalize_url;

/// Durable queue of discovered URLs with exclusive leases
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Normalize, deduplicate and insert; returns how many rows were new
    async fn insert_links(&self, urls: &[String], tags: &Partition) -> Result<u64>;

    /// Lease up to `limit` PENDING links. Each link goes to at most one caller.
    async fn acquire_pending(&self, limit: usize, filter: &Partition) -> Result<Vec<QueuedLink>>;

    /// Return IN_PROGRESS links older than `timeout` to PENDING
    async fn recover_stale_leases(&self, timeout: Duration) -> Result<u64>;

    /// Record the final state of a leased link
    async fn mark(&self, link_id: i64, status: LinkStatus) -> Result<()>;

    /// Hand IN_PROGRESS links back to PENDING
    async fn release(&self, link_ids: &[i64]) -> Result<u64>;

    async fn counts(&self, filter: &Partition) -> Result<QueueCounts>;

    async fn get_link(&self, link_id: i64) -> Result<Option<QueuedLink>>;
}

/// Normalize and deduplicate a batch of URLs, keeping first-seen order
pub fn prepare_urls(urls: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut prepared = Vec::with_capacity(urls.len());

    for raw in urls {
        match normalize_url(raw) {
            Ok(url) => {
                if seen.insert(url.clone()) {
                    prepared.push(url);
                }
            }
            Err(e) => debug!("Skipping unparseable URL {}: {}", raw, e),
        }
    }

    prepared
}

pub(crate) fn ensure_terminal(status: LinkStatus) -> Result<()> {
    anyhow::ensure!(
        status.is_terminal(),
        "links can only be marked CRAWLED or ERROR, not {}",
        status
    );
    Ok(())
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    id: i64,
    url: String,
    status: String,
    domain: Option<String>,
    category: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<LinkRow> for QueuedLink {
    fn from(row: LinkRow) -> Self {
        QueuedLink {
            id: row.id,
            url: row.url,
            status: LinkStatus::parse(&row.status).unwrap_or(LinkStatus::Pending),
            domain: row.domain,
            category: row.category,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Minimum `server_version_num` with `FOR UPDATE SKIP LOCKED`
const SKIP_LOCKED_MIN_VERSION: i32 = 90500;

/// Advisory lock key serializing fallback leases ("leases" in ASCII)
const LEASE_LOCK_KEY: i64 = 0x6c65_6173_6573;

const LINK_COLUMNS: &str = "id, url, status, domain, category, created_at, updated_at";

/// PostgreSQL implementation of WorkQueue
pub struct PgWorkQueue {
    pool: Pool<Postgres>,

    lease_timeout: Duration,

    /// Cleared once the server turns out not to support SKIP LOCKED
    skip_locked: AtomicBool,
}

impl PgWorkQueue {
    pub async fn new(pool: Pool<Postgres>, lease_timeout: Duration) -> Result<Self> {
        let version: Option<String> = sqlx::query_scalar("SHOW server_version_num")
            .fetch_one(&pool)
            .await
            .map_err(|e| warn!("Could not read server version: {}", e))
            .ok();

        let skip_locked = match version.as_deref().map(str::parse::<i32>) {
            Some(Ok(num)) => num >= SKIP_LOCKED_MIN_VERSION,
            _ => true,
        };

        if !skip_locked {
            warn!("PostgreSQL server predates SKIP LOCKED; leases will be serialized with an advisory lock");
        }

        Ok(Self {
            pool,
            lease_timeout,
            skip_locked: AtomicBool::new(skip_locked),
        })
    }

    fn filter_binds(filter: &Partition) -> (Option<&str>, Option<&str>) {
        (filter.domain.as_deref(), filter.category.as_deref())
    }

    async fn lease_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        limit: i64,
        filter: &Partition,
        skip_locked: bool,
    ) -> Result<Vec<QueuedLink>, sqlx::Error> {
        if !skip_locked {
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(LEASE_LOCK_KEY)
                .execute(&mut **tx)
                .await?;
        }

        // The fallback still row-locks so it cannot hand out a row a
        // concurrent SKIP LOCKED leaser is holding
        let locking = if skip_locked { "FOR UPDATE SKIP LOCKED" } else { "FOR UPDATE" };
        let query = format!(
            "SELECT {LINK_COLUMNS} FROM work_queue
             WHERE status = 'PENDING'
               AND ($1::text IS NULL OR domain = $1)
               AND ($2::text IS NULL OR category = $2)
             ORDER BY id ASC
             LIMIT $3
             {locking}"
        );

        let (domain, category) = Self::filter_binds(filter);
        let rows: Vec<LinkRow> = sqlx::query_as(&query)
            .bind(domain)
            .bind(category)
            .bind(limit)
            .fetch_all(&mut **tx)
            .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let now: DateTime<Utc> = sqlx::query_scalar(
            "UPDATE work_queue SET status = 'IN_PROGRESS', updated_at = NOW()
             WHERE id = ANY($1)
             RETURNING updated_at",
        )
        .bind(&ids)
        .fetch_one(&mut **tx)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let mut link = QueuedLink::from(row);
                link.status = LinkStatus::InProgress;
                link.updated_at = now;
                link
            })
            .collect())
    }

    async fn lease(&self, limit: i64, filter: &Partition, skip_locked: bool) -> Result<Vec<QueuedLink>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let links = Self::lease_in_tx(&mut tx, limit, filter, skip_locked).await?;
        tx.commit().await?;
        Ok(links)
    }
}

/// SQLSTATEs for a statement the server does not understand
fn is_unsupported_syntax(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("42601") | Some("0A000")),
        _ => false,
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    async fn insert_links(&self, urls: &[String], tags: &Partition) -> Result<u64> {
        let prepared = prepare_urls(urls);
        if prepared.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "INSERT INTO work_queue (url, status, domain, category)
             SELECT u, 'PENDING', $2, $3 FROM UNNEST($1::text[]) AS u
             ON CONFLICT (url) DO NOTHING",
        )
        .bind(&prepared)
        .bind(tags.domain.as_deref())
        .bind(tags.category.as_deref())
        .execute(&self.pool)
        .await
        .context("Failed to insert links into work queue")?;

        debug!(offered = prepared.len(), added = result.rows_affected(), "Inserted links");

        Ok(result.rows_affected())
    }

    async fn acquire_pending(&self, limit: usize, filter: &Partition) -> Result<Vec<QueuedLink>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        self.recover_stale_leases(self.lease_timeout).await?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        if self.skip_locked.load(Ordering::Relaxed) {
            match self.lease(limit, filter, true).await {
                Ok(links) => return Ok(links),
                Err(e) if is_unsupported_syntax(&e) => {
                    warn!("SKIP LOCKED rejected ({}); switching to serialized leases", e);
                    self.skip_locked.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e).context("Failed to lease links"),
            }
        }

        self.lease(limit, filter, false)
            .await
            .context("Failed to lease links with advisory lock")
    }

    async fn recover_stale_leases(&self, timeout: Duration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE work_queue SET status = 'PENDING', updated_at = NOW()
             WHERE status = 'IN_PROGRESS'
               AND updated_at < NOW() - ($1 * INTERVAL '1 second')",
        )
        .bind(timeout.num_seconds() as f64)
        .execute(&self.pool)
        .await
        .context("Failed to recover stale leases")?;

        if result.rows_affected() > 0 {
            info!(recovered = result.rows_affected(), "Recovered stale IN_PROGRESS links");
        }

        Ok(result.rows_affected())
    }

    async fn mark(&self, link_id: i64, status: LinkStatus) -> Result<()> {
        ensure_terminal(status)?;

        let result = sqlx::query(
            "UPDATE work_queue SET status = $2, updated_at = NOW()
             WHERE id = $1 AND status = 'IN_PROGRESS'",
        )
        .bind(link_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .context(format!("Failed to mark link {} as {}", link_id, status))?;

        if result.rows_affected() == 0 {
            warn!(link_id, %status, "Lease lost before the link could be marked");
        }

        Ok(())
    }

    async fn release(&self, link_ids: &[i64]) -> Result<u64> {
        if link_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(
            "UPDATE work_queue SET status = 'PENDING', updated_at = NOW()
             WHERE id = ANY($1) AND status = 'IN_PROGRESS'",
        )
        .bind(link_ids)
        .execute(&self.pool)
        .await
        .context("Failed to release leased links")?;

        Ok(result.rows_affected())
    }

    async fn counts(&self, filter: &Partition) -> Result<QueueCounts> {
        let (domain, category) = Self::filter_binds(filter);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM work_queue
             WHERE ($1::text IS NULL OR domain = $1)
               AND ($2::text IS NULL OR category = $2)
             GROUP BY status",
        )
        .bind(domain)
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .context("Failed to count work queue")?;

        let mut counts = QueueCounts::default();
        for (status, count) in rows {
            if let Some(status) = LinkStatus::parse(&status) {
                counts.add(status, u64::try_from(count).unwrap_or(0));
            }
        }

        Ok(counts)
    }

    async fn get_link(&self, link_id: i64) -> Result<Option<QueuedLink>> {
        let row: Option<LinkRow> = sqlx::query_as(&format!(
            "SELECT {LINK_COLUMNS} FROM work_queue WHERE id = $1"
        ))
        .bind(link_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load link")?;

        Ok(row.map(QueuedLink::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_urls_dedupes_after_normalization() {
        let urls = vec![
            "https://Example.com/a/?b=1&a=2".to_string(),
            "https://example.com/a?a=2&b=1#top".to_string(),
            "not a url".to_string(),
            "https://example.com/b".to_string(),
        ];

        assert_eq!(
            prepare_urls(&urls),
            vec![
                "https://example.com/a?a=2&b=1".to_string(),
                "https://example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn test_only_terminal_marks_allowed() {
        assert!(ensure_terminal(LinkStatus::Crawled).is_ok());
        assert!(ensure_terminal(LinkStatus::Error).is_ok());
        assert!(ensure_terminal(LinkStatus::Pending).is_err());
        assert!(ensure_terminal(LinkStatus::InProgress).is_err());
    }
}
