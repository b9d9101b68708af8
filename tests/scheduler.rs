mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::*;
use listing_harvester::cli::config::SchedulerSettings;
use listing_harvester::crawler::{CrawlerController, Scheduler};
use listing_harvester::storage::lock::ServiceLock;
use listing_harvester::storage::memory::MemoryStore;
use listing_harvester::storage::queue::WorkQueue;
use listing_harvester::storage::tasks::TaskStore;

fn scheduler(controller: &Arc<CrawlerController>) -> Scheduler {
    Scheduler::new(controller.clone(), controller.config().scheduler.clone())
}

async fn pipeline_task(store: &MemoryStore, dir: &std::path::Path, name: &str) -> i64 {
    let (listing, detail) = write_templates(dir);
    store
        .create_task(&pipeline_definition(name, &listing, &detail))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_tick_launches_due_task_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "once").await;

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(2), FetchBehavior::Succeed)));
    let mut scheduler = scheduler(&controller);
    let shutdown = CancellationToken::new();

    assert_eq!(scheduler.tick(&shutdown).await.unwrap(), 1);
    // Either still running or rescheduled 30 minutes out
    assert_eq!(scheduler.tick(&shutdown).await.unwrap(), 0);

    assert!(scheduler.join_workers(Duration::from_secs(5)).await.is_empty());

    let task = store.get_task(id).await.unwrap().unwrap();
    assert!(!task.flags.is_running);
    assert!(task.last_run_at.is_some());
    assert_eq!(store.counts(&partition()).await.unwrap().crawled, 2);

    let logs = store.recent_logs(id, 100).await.unwrap();
    assert_eq!(logs.last().map(|l| l.status.as_str()), Some("QUEUED"));
    assert_eq!(logs.iter().filter(|l| l.status == "START" && l.stage == "task").count(), 1);
}

#[tokio::test]
async fn test_competing_schedulers_launch_one_worker() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "contested").await;

    let browsers = Arc::new(FakeBrowsers::new(item_links(3), FetchBehavior::Succeed));
    let first = controller(&store, browsers.clone());
    let second = controller(&store, browsers.clone());
    let mut a = scheduler(&first);
    let mut b = scheduler(&second);
    let shutdown = CancellationToken::new();

    let (left, right) = tokio::join!(a.tick(&shutdown), b.tick(&shutdown));
    assert_eq!(left.unwrap() + right.unwrap(), 1);

    a.join_workers(Duration::from_secs(5)).await;
    b.join_workers(Duration::from_secs(5)).await;

    assert_eq!(browsers.fetch_count(), 3);
    let logs = store.recent_logs(id, 100).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.status == "QUEUED").count(), 1);
}

#[tokio::test]
async fn test_inactive_task_is_not_launched() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "paused").await;
    store.set_active(id, false).await.unwrap();

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(1), FetchBehavior::Succeed)));
    let mut scheduler = scheduler(&controller);

    assert_eq!(scheduler.tick(&CancellationToken::new()).await.unwrap(), 0);
    assert_eq!(scheduler.active_workers(), 0);
    assert!(store.recent_logs(id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_stale_running_task_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "orphaned").await;

    // A worker that claimed the task and died without a heartbeat
    assert!(store.try_claim(id, chrono::Utc::now()).await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(1), FetchBehavior::Succeed)));
    let settings = SchedulerSettings {
        stale_task_minutes: 0,
        ..controller.config().scheduler.clone()
    };
    let mut scheduler = Scheduler::new(controller.clone(), settings);

    assert_eq!(scheduler.tick(&CancellationToken::new()).await.unwrap(), 1);
    scheduler.join_workers(Duration::from_secs(5)).await;

    let task = store.get_task(id).await.unwrap().unwrap();
    assert!(task.last_run_at.is_some());
    assert!(!task.flags.is_running);
}

#[tokio::test]
async fn test_crashed_worker_releases_task() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "crashy").await;

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(2), FetchBehavior::Panic)));
    let mut scheduler = scheduler(&controller);

    assert_eq!(scheduler.tick(&CancellationToken::new()).await.unwrap(), 1);
    assert!(scheduler.join_workers(Duration::from_secs(5)).await.is_empty());

    let task = store.get_task(id).await.unwrap().unwrap();
    assert!(!task.flags.is_running);
    // A crash does not reschedule
    assert!(task.last_run_at.is_none());

    let logs = store.recent_logs(id, 1).await.unwrap();
    assert_eq!(logs[0].status, "ERROR");
    assert!(logs[0].message.contains("Worker crashed: browser driver exploded"));
}

#[tokio::test]
async fn test_run_stops_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "looping").await;

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(2), FetchBehavior::Succeed)));
    let mut scheduler = scheduler(&controller);

    let shutdown = CancellationToken::new();
    let stopper = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopper.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(10), scheduler.run(shutdown)).await;
    tokio_test::assert_ok!(result.unwrap());

    assert_eq!(scheduler.active_workers(), 0);
    assert!(!store.is_running(id).await.unwrap());
    assert!(store.get_task(id).await.unwrap().unwrap().last_run_at.is_some());
}

#[tokio::test]
async fn test_shutdown_leaves_foreign_runs_alone() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let foreign = pipeline_task(&store, dir.path(), "elsewhere").await;

    // Claimed by a scheduler in another process
    assert!(store.try_claim(foreign, chrono::Utc::now()).await.unwrap());

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(1), FetchBehavior::Succeed)));
    let mut scheduler = scheduler(&controller);

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio_test::assert_ok!(scheduler.run(shutdown).await);

    assert!(store.is_running(foreign).await.unwrap());
}

#[tokio::test]
async fn test_serve_refuses_second_scheduler() {
    let store = Arc::new(MemoryStore::default());
    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(1), FetchBehavior::Succeed)));

    // Another scheduler holds the database
    assert!(store.try_lock_service().await.unwrap());

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let err = scheduler(&controller).serve(shutdown.clone()).await.unwrap_err();
    assert!(err.to_string().contains("Another scheduler is already running"));

    store.unlock_service().await.unwrap();
    tokio_test::assert_ok!(scheduler(&controller).serve(shutdown).await);
    // Handed back on exit
    assert!(store.try_lock_service().await.unwrap());
}

#[tokio::test]
async fn test_serve_releases_runs_left_by_dead_scheduler() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::default());
    let id = pipeline_task(&store, dir.path(), "leftover").await;

    // Claimed by a scheduler that was killed before it could hand the task back
    assert!(store.try_claim(id, chrono::Utc::now()).await.unwrap());

    let controller = controller(&store, Arc::new(FakeBrowsers::new(item_links(1), FetchBehavior::Succeed)));
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    tokio_test::assert_ok!(scheduler(&controller).serve(shutdown).await);

    assert!(!store.is_running(id).await.unwrap());
}
