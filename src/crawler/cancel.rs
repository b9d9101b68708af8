use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::tasks::TaskStore;

struct Inner {
    task_id: i64,
    store: Option<Arc<dyn TaskStore>>,
    token: CancellationToken,
    poll_interval: Duration,
    last_poll: Mutex<Option<Instant>>,
}

/// Cooperative cancellation for one run.
///
/// Fires when the process shuts down (the token is a child of the shutdown
/// token) or when an operator sets `cancel_requested` on the task. The store
/// is polled at most once per `poll_interval`; once observed, cancellation
/// sticks.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    pub fn new(
        task_id: i64,
        store: Arc<dyn TaskStore>,
        shutdown: &CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                task_id,
                store: Some(store),
                token: shutdown.child_token(),
                poll_interval,
                last_poll: Mutex::new(None),
            }),
        }
    }

    /// A token that only fires through [`CancelToken::cancel`]
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(Inner {
                task_id: 0,
                store: None,
                token: CancellationToken::new(),
                poll_interval: Duration::ZERO,
                last_poll: Mutex::new(None),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Checkpoint: has the run been asked to stop?
    pub async fn is_cancelled(&self) -> bool {
        if self.inner.token.is_cancelled() {
            return true;
        }

        let Some(store) = &self.inner.store else {
            return false;
        };

        {
            let mut last = self.inner.last_poll.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < self.inner.poll_interval {
                    return false;
                }
            }
            *last = Some(Instant::now());
        }

        match store.is_cancel_requested(self.inner.task_id).await {
            Ok(true) => {
                info!(task_id = self.inner.task_id, "Cancel requested by operator");
                self.inner.token.cancel();
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(task_id = self.inner.task_id, "Failed to poll cancel flag: {:#}", e);
                false
            }
        }
    }

    /// Sleep for `duration`, waking early on cancellation.
    /// Returns `true` when the full duration elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let step = if self.inner.poll_interval.is_zero() {
            Duration::from_millis(500)
        } else {
            self.inner.poll_interval.min(Duration::from_millis(500))
        };

        loop {
            if self.is_cancelled().await {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            let chunk = (deadline - now).min(step);
            tokio::select! {
                _ = self.inner.token.cancelled() => return false,
                _ = tokio::time::sleep(chunk) => {}
            }
        }
    }
}

/// Background task refreshing a running task's `updated_at`
pub struct Heartbeat {
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Heartbeat {
    pub fn spawn(store: Arc<dyn TaskStore>, task_id: i64, interval: Duration) -> Self {
        let stop = CancellationToken::new();
        let token = stop.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(task_id).await {
                            warn!(task_id, "Heartbeat failed: {:#}", e);
                        } else {
                            debug!(task_id, "Heartbeat");
                        }
                    }
                }
            }
        });

        Self { stop, handle: Some(handle) }
    }

    pub async fn stop(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for Heartbeat {
    // A run that unwinds must not leave the task looking alive
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::{Partition, TaskDefinition};
    use crate::storage::memory::MemoryStore;
    use crate::storage::tasks::MockTaskStore;
    use mockall::predicate::eq;

    async fn running_task(store: &Arc<MemoryStore>) -> i64 {
        let def = TaskDefinition {
            name: "t".into(),
            active: true,
            schedule: Default::default(),
            stages: Default::default(),
            partition: Partition::default(),
            listing: Default::default(),
            detail: Default::default(),
            image: Default::default(),
        };
        let id = store.create_task(&def).await.unwrap();
        assert!(store.try_claim(id, chrono::Utc::now()).await.unwrap());
        id
    }

    #[tokio::test]
    async fn test_operator_cancel_is_observed_and_sticks() {
        let store = Arc::new(MemoryStore::default());
        let id = running_task(&store).await;
        let shutdown = CancellationToken::new();
        let cancel = CancelToken::new(id, store.clone(), &shutdown, Duration::ZERO);

        assert!(!cancel.is_cancelled().await);

        store.request_cancel(id).await.unwrap();
        assert!(cancel.is_cancelled().await);

        // Clearing the flag afterwards does not un-cancel the run
        store.release_task(id).await.unwrap();
        assert!(cancel.is_cancelled().await);
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_poll_is_throttled() {
        let store = Arc::new(MemoryStore::default());
        let id = running_task(&store).await;
        let cancel = CancelToken::new(id, store.clone(), &CancellationToken::new(), Duration::from_secs(60));

        assert!(!cancel.is_cancelled().await);
        store.request_cancel(id).await.unwrap();

        // Within the poll interval the store is not consulted again
        assert!(!cancel.is_cancelled().await);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_children() {
        let store = Arc::new(MemoryStore::default());
        let id = running_task(&store).await;
        let shutdown = CancellationToken::new();
        let cancel = CancelToken::new(id, store, &shutdown, Duration::from_secs(60));

        shutdown.cancel();
        assert!(cancel.is_cancelled().await);
        assert!(!cancel.sleep(Duration::from_secs(30)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_wakes_early_on_cancel() {
        let cancel = CancelToken::detached();
        let waker = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            waker.cancel();
        });

        let started = Instant::now();
        assert!(!cancel.sleep(Duration::from_secs(60)).await);
        assert!(started.elapsed() < Duration::from_secs(5));

        assert!(CancelToken::detached().sleep(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_ticks_until_stopped() {
        let mut store = MockTaskStore::new();
        store
            .expect_heartbeat()
            .with(eq(7))
            .times(2)
            .returning(|_| Ok(()));
        let store: Arc<dyn TaskStore> = Arc::new(store);

        let heartbeat = Heartbeat::spawn(store, 7, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(125)).await;
        heartbeat.stop().await;

        // No further ticks after stop
        tokio::time::sleep(Duration::from_secs(300)).await;
    }
}
