use anyhow::{Result, Context};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Pool, Postgres};
use tokio::sync::Mutex;
use tracing::debug;

/// Advisory lock key held by the running scheduler
const SERVICE_LOCK_KEY: i64 = 0x6861_7276_7374_0001;

/// Allows one scheduler per database
#[async_trait]
pub trait ServiceLock: Send + Sync {
    /// Take the lock. False when another scheduler already holds it.
    async fn try_lock_service(&self) -> Result<bool>;

    async fn unlock_service(&self) -> Result<()>;
}

/// Session-level advisory lock pinned to one pooled connection.
/// Postgres drops it if the process dies and the connection closes.
pub struct PgServiceLock {
    pool: Pool<Postgres>,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgServiceLock {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool, held: Mutex::new(None) }
    }
}

#[async_trait]
impl ServiceLock for PgServiceLock {
    async fn try_lock_service(&self) -> Result<bool> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(true);
        }

        let mut conn = self.pool.acquire().await.context("Failed to get a connection for the service lock")?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(SERVICE_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .context("Failed to take the service lock")?;

        if locked {
            debug!("Acquired service lock");
            *held = Some(conn);
        }

        Ok(locked)
    }

    async fn unlock_service(&self) -> Result<()> {
        let Some(mut conn) = self.held.lock().await.take() else {
            return Ok(());
        };

        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(SERVICE_LOCK_KEY)
            .execute(&mut *conn)
            .await
            .context("Failed to release the service lock")?;

        debug!("Released service lock");
        Ok(())
    }
}
