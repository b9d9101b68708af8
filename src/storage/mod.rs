pub mod lock;
pub mod memory;
pub mod queue;
pub mod records;
pub mod schema;
pub mod tasks;
pub mod url;

use anyhow::{Result, Context};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::debug;

use crate::cli::config::{DatabaseSettings, QueueSettings};
use lock::{PgServiceLock, ServiceLock};
use memory::MemoryStore;
use queue::{PgWorkQueue, WorkQueue};
use records::{PgRecordStore, RecordStore};
use tasks::{PgTaskStore, TaskStore};

pub use tasks::TaskClaim;

/// The storage concerns, backed by one database
#[derive(Clone)]
pub struct Storage {
    pub queue: Arc<dyn WorkQueue>,
    pub tasks: Arc<dyn TaskStore>,
    pub records: Arc<dyn RecordStore>,
    pub lock: Arc<dyn ServiceLock>,
}

impl Storage {
    /// Create the storage backend selected by `storage_type`
    pub async fn create(settings: &DatabaseSettings, queue: &QueueSettings) -> Result<Self> {
        match settings.storage_type.as_str() {
            "postgresql" => {
                let pool = PgPoolOptions::new()
                    .max_connections(settings.max_connections)
                    .connect(&settings.connection_string)
                    .await
                    .context("Failed to connect to PostgreSQL")?;

                schema::ensure_schema(&pool).await?;

                let work_queue = PgWorkQueue::new(pool.clone(), queue.lease_timeout()).await?;

                debug!("Connected to PostgreSQL database");

                Ok(Self {
                    queue: Arc::new(work_queue),
                    tasks: Arc::new(PgTaskStore::new(pool.clone())),
                    records: Arc::new(PgRecordStore::new(pool.clone())),
                    lock: Arc::new(PgServiceLock::new(pool)),
                })
            }
            "memory" => Ok(Self::in_memory(Arc::new(MemoryStore::new(queue.lease_timeout())))),
            _ => {
                anyhow::bail!("Unsupported storage type: {}", settings.storage_type);
            }
        }
    }

    /// Wrap one memory store as every backend
    pub fn in_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            queue: store.clone(),
            tasks: store.clone(),
            records: store.clone(),
            lock: store,
        }
    }
}
