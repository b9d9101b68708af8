use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::warn;

use crate::crawler::task::{
    DetailDraft, DetailRecord, ImageRecord, ImageStatus, LinkStatus, LogStatus, Partition,
    QueueCounts, QueuedLink, RunLogEntry, RunStage, Task, TaskDefinition,
};
use crate::storage::lock::ServiceLock;
use crate::storage::queue::{ensure_terminal, prepare_urls, WorkQueue};
use crate::storage::records::RecordStore;
use crate::storage::tasks::TaskStore;

#[derive(Default)]
struct MemoryState {
    links: BTreeMap<i64, QueuedLink>,
    url_index: HashMap<String, i64>,
    tasks: BTreeMap<i64, Task>,
    logs: Vec<RunLogEntry>,
    details: BTreeMap<i64, DetailRecord>,
    images: BTreeMap<i64, ImageRecord>,
    last_link_id: i64,
    last_task_id: i64,
    last_log_id: i64,
    last_detail_id: i64,
    last_image_id: i64,
}

fn next_id(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// In-process backend with the same semantics as the PostgreSQL one.
/// A single mutex stands in for row locks and conditional updates.
pub struct MemoryStore {
    lease_timeout: Duration,
    state: Mutex<MemoryState>,
    service_locked: AtomicBool,
}

impl MemoryStore {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            lease_timeout,
            state: Mutex::new(MemoryState::default()),
            service_locked: AtomicBool::new(false),
        }
    }

    /// Images belonging to one detail record, in page order
    pub async fn images_for_detail(&self, detail_id: i64) -> Vec<ImageRecord> {
        let state = self.state.lock().await;
        state
            .images
            .values()
            .filter(|i| i.detail_id == detail_id)
            .cloned()
            .collect()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::minutes(30))
    }
}

fn recover_stale(state: &mut MemoryState, timeout: Duration, now: DateTime<Utc>) -> u64 {
    let cutoff = now - timeout;
    let mut recovered = 0;
    for link in state.links.values_mut() {
        if link.status == LinkStatus::InProgress && link.updated_at < cutoff {
            link.status = LinkStatus::Pending;
            link.updated_at = now;
            recovered += 1;
        }
    }
    recovered
}

/// Eligible to be claimed at `now`
fn is_due(task: &Task, now: DateTime<Utc>) -> bool {
    task.flags.active
        && !task.flags.is_running
        && !task.flags.cancel_requested
        && (task.flags.run_now || task.next_run_at.map_or(true, |next| next <= now))
}

fn clear_run_flags(task: &mut Task, now: DateTime<Utc>) {
    task.flags.is_running = false;
    task.flags.cancel_requested = false;
    task.updated_at = now;
}

#[async_trait]
impl WorkQueue for MemoryStore {
    async fn insert_links(&self, urls: &[String], tags: &Partition) -> Result<u64> {
        let prepared = prepare_urls(urls);
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut added = 0;

        for url in prepared {
            if state.url_index.contains_key(&url) {
                continue;
            }
            let id = next_id(&mut state.last_link_id);
            state.url_index.insert(url.clone(), id);
            state.links.insert(
                id,
                QueuedLink {
                    id,
                    url,
                    status: LinkStatus::Pending,
                    domain: tags.domain.clone(),
                    category: tags.category.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            added += 1;
        }

        Ok(added)
    }

    async fn acquire_pending(&self, limit: usize, filter: &Partition) -> Result<Vec<QueuedLink>> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        recover_stale(&mut state, self.lease_timeout, now);

        let mut leased = Vec::new();
        for link in state.links.values_mut() {
            if leased.len() >= limit {
                break;
            }
            if link.status == LinkStatus::Pending
                && filter.matches(link.domain.as_deref(), link.category.as_deref())
            {
                link.status = LinkStatus::InProgress;
                link.updated_at = now;
                leased.push(link.clone());
            }
        }

        Ok(leased)
    }

    async fn recover_stale_leases(&self, timeout: Duration) -> Result<u64> {
        let mut state = self.state.lock().await;
        Ok(recover_stale(&mut state, timeout, Utc::now()))
    }

    async fn mark(&self, link_id: i64, status: LinkStatus) -> Result<()> {
        ensure_terminal(status)?;
        let mut state = self.state.lock().await;
        match state.links.get_mut(&link_id) {
            Some(link) if link.status == LinkStatus::InProgress => {
                link.status = status;
                link.updated_at = Utc::now();
            }
            _ => warn!(link_id, %status, "Lease lost before the link could be marked"),
        }
        Ok(())
    }

    async fn release(&self, link_ids: &[i64]) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut released = 0;
        for id in link_ids {
            if let Some(link) = state.links.get_mut(id) {
                if link.status == LinkStatus::InProgress {
                    link.status = LinkStatus::Pending;
                    link.updated_at = now;
                    released += 1;
                }
            }
        }
        Ok(released)
    }

    async fn counts(&self, filter: &Partition) -> Result<QueueCounts> {
        let state = self.state.lock().await;
        let mut counts = QueueCounts::default();
        for link in state.links.values() {
            if filter.matches(link.domain.as_deref(), link.category.as_deref()) {
                counts.add(link.status, 1);
            }
        }
        Ok(counts)
    }

    async fn get_link(&self, link_id: i64) -> Result<Option<QueuedLink>> {
        Ok(self.state.lock().await.links.get(&link_id).cloned())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, def: &TaskDefinition) -> Result<i64> {
        let mut state = self.state.lock().await;
        let id = next_id(&mut state.last_task_id);
        state.tasks.insert(id, Task::from_definition(id, def, Utc::now()));
        Ok(id)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        Ok(self.state.lock().await.tasks.get(&task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.state.lock().await.tasks.values().cloned().collect())
    }

    async fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let state = self.state.lock().await;
        let mut due: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| is_due(t, now))
            .cloned()
            .collect();

        due.sort_by(|a, b| b.flags.run_now.cmp(&a.flags.run_now).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn is_running(&self, task_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).map_or(false, |t| t.flags.is_running))
    }

    async fn try_claim(&self, task_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(&task_id) {
            Some(task) if is_due(task, now) => {
                task.flags.is_running = true;
                task.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn heartbeat(&self, task_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            if task.flags.is_running {
                task.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn is_cancel_requested(&self, task_id: i64) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.tasks.get(&task_id).map_or(false, |t| t.flags.cancel_requested))
    }

    async fn finish_run(&self, task_id: i64, last_run_at: DateTime<Utc>, next_run_at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.last_run_at = Some(last_run_at);
            task.next_run_at = Some(next_run_at);
            task.flags.run_now = false;
            clear_run_flags(task, Utc::now());
        }
        Ok(())
    }

    async fn release_task(&self, task_id: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            clear_run_flags(task, Utc::now());
        }
        Ok(())
    }

    async fn reset_stale_running(&self, timeout: Duration) -> Result<u64> {
        let now = Utc::now();
        let cutoff = now - timeout;
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for task in state.tasks.values_mut() {
            if task.flags.is_running && task.updated_at < cutoff {
                clear_run_flags(task, now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn reset_all_running(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut reset = 0;
        for task in state.tasks.values_mut() {
            if task.flags.is_running {
                clear_run_flags(task, now);
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn set_active(&self, task_id: i64, active: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.tasks.get_mut(&task_id) {
            Some(task) => {
                task.flags.active = active;
                true
            }
            None => false,
        })
    }

    async fn trigger_run_now(&self, task_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.tasks.get_mut(&task_id) {
            Some(task) => {
                task.flags.run_now = true;
                true
            }
            None => false,
        })
    }

    async fn request_cancel(&self, task_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.tasks.get_mut(&task_id) {
            Some(task) if task.flags.is_running => {
                task.flags.cancel_requested = true;
                true
            }
            _ => false,
        })
    }

    async fn append_log(&self, task_id: i64, stage: RunStage, status: LogStatus, message: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let id = next_id(&mut state.last_log_id);
        state.logs.push(RunLogEntry {
            id,
            task_id,
            stage: stage.as_str().to_string(),
            status: status.as_str().to_string(),
            message: message.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn recent_logs(&self, task_id: i64, limit: i64) -> Result<Vec<RunLogEntry>> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .rev()
            .filter(|l| l.task_id == task_id)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ServiceLock for MemoryStore {
    async fn try_lock_service(&self) -> Result<bool> {
        Ok(self
            .service_locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn unlock_service(&self) -> Result<()> {
        self.service_locked.store(false, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_detail(&self, draft: &DetailDraft) -> Result<i64> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let detail_id = next_id(&mut state.last_detail_id);
        state.details.insert(
            detail_id,
            DetailRecord {
                id: detail_id,
                link_id: draft.link_id,
                url: draft.url.clone(),
                domain: draft.domain.clone(),
                fields: draft.fields.clone(),
                image_count: i32::try_from(draft.images.len()).unwrap_or(i32::MAX),
                created_at: now,
            },
        );

        for (idx, url) in draft.images.iter().enumerate() {
            let id = next_id(&mut state.last_image_id);
            state.images.insert(
                id,
                ImageRecord {
                    id,
                    detail_id,
                    image_url: url.clone(),
                    idx: i32::try_from(idx).unwrap_or(i32::MAX),
                    status: ImageStatus::Pending,
                    attempts: 0,
                    file_path: None,
                    error: None,
                    updated_at: now,
                },
            );
        }

        Ok(detail_id)
    }

    async fn details_for_link(&self, link_id: i64) -> Result<Vec<DetailRecord>> {
        let state = self.state.lock().await;
        Ok(state.details.values().filter(|d| d.link_id == link_id).cloned().collect())
    }

    async fn details_created_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<DetailRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .details
            .values()
            .rev()
            .filter(|d| d.created_at >= start && d.created_at < end)
            .cloned()
            .collect())
    }

    async fn pending_images(&self, limit: i64, domain: Option<&str>) -> Result<Vec<ImageRecord>> {
        let state = self.state.lock().await;
        Ok(select_images(&state, limit, domain, |i| i.status == ImageStatus::Pending))
    }

    async fn failed_images(&self, limit: i64, max_attempts: i32, domain: Option<&str>) -> Result<Vec<ImageRecord>> {
        let state = self.state.lock().await;
        Ok(select_images(&state, limit, domain, |i| {
            i.status == ImageStatus::Failed && i.attempts < max_attempts
        }))
    }

    async fn record_image(
        &self,
        image_id: i64,
        status: ImageStatus,
        file_path: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(image) = state.images.get_mut(&image_id) {
            image.status = status;
            if let Some(path) = file_path {
                image.file_path = Some(path.to_string());
            }
            image.error = error.map(str::to_string);
            image.attempts += 1;
            image.updated_at = Utc::now();
        }
        Ok(())
    }
}

fn select_images(
    state: &MemoryState,
    limit: i64,
    domain: Option<&str>,
    wanted: impl Fn(&ImageRecord) -> bool,
) -> Vec<ImageRecord> {
    state
        .images
        .values()
        .filter(|i| wanted(i))
        .filter(|i| match domain {
            Some(domain) => state
                .details
                .get(&i.detail_id)
                .map_or(false, |d| d.domain.as_deref() == Some(domain)),
            None => true,
        })
        .take(usize::try_from(limit).unwrap_or(0))
        .cloned()
        .collect()
}
