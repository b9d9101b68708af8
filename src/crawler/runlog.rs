use std::sync::Arc;
use tracing::{error, info, warn};

use crate::crawler::task::{LogStatus, RunStage};
use crate::storage::tasks::TaskStore;

/// Writes run history to the task log table and mirrors it to tracing.
/// A failing log write never fails the run.
#[derive(Clone)]
pub struct RunLogger {
    store: Arc<dyn TaskStore>,
    task_id: i64,
}

impl RunLogger {
    pub fn new(store: Arc<dyn TaskStore>, task_id: i64) -> Self {
        Self { store, task_id }
    }

    pub async fn log(&self, stage: RunStage, status: LogStatus, message: impl AsRef<str>) {
        let message = message.as_ref();

        match status {
            LogStatus::Error => error!(task_id = self.task_id, stage = %stage, status = %status, "{}", message),
            LogStatus::Cancel | LogStatus::Skip => {
                warn!(task_id = self.task_id, stage = %stage, status = %status, "{}", message)
            }
            _ => info!(task_id = self.task_id, stage = %stage, status = %status, "{}", message),
        }

        if let Err(e) = self.store.append_log(self.task_id, stage, status, message).await {
            warn!(task_id = self.task_id, "Failed to write run log: {:#}", e);
        }
    }
}
