mod common;

use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::*;
use listing_harvester::crawler::RunOutcome;
use listing_harvester::storage::memory::MemoryStore;
use listing_harvester::storage::queue::WorkQueue;
use listing_harvester::storage::records::RecordStore;
use listing_harvester::storage::tasks::TaskStore;
use listing_harvester::storage::TaskClaim;

async fn claim(store: &Arc<MemoryStore>, task_id: i64) -> TaskClaim {
    TaskClaim::acquire(store.clone(), task_id)
        .await
        .unwrap()
        .expect("task should be claimable")
}

#[tokio::test]
async fn test_full_run_crawls_every_link_and_reschedules() {
    let dir = tempfile::tempdir().unwrap();
    let (listing, detail) = write_templates(dir.path());

    let store = Arc::new(MemoryStore::default());
    let id = store
        .create_task(&pipeline_definition("madrid-sale", &listing, &detail))
        .await
        .unwrap();

    let browsers = Arc::new(FakeBrowsers::new(item_links(5), FetchBehavior::Succeed));
    let controller = controller(&store, browsers.clone());

    let outcome = controller
        .run_task(claim(&store, id).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let counts = store.counts(&partition()).await.unwrap();
    assert_eq!(counts.crawled, 5);
    assert_eq!(counts.total(), 5);
    assert_eq!(browsers.fetch_count(), 5);

    let records = store.details_for_link(1).await.unwrap();
    assert_eq!(records[0].fields["title"], "Sunny flat");
    assert_eq!(records[0].fields["price"], "250000");

    let task = store.get_task(id).await.unwrap().unwrap();
    let last = task.last_run_at.unwrap();
    assert_eq!(task.next_run_at, Some(last + Duration::minutes(30)));
    assert!(!task.flags.is_running);
    assert!(!task.flags.cancel_requested);
    assert!(!task.flags.run_now);

    let statuses: Vec<String> = store
        .recent_logs(id, 50)
        .await
        .unwrap()
        .into_iter()
        .rev()
        .map(|l| format!("{}:{}", l.stage, l.status))
        .collect();
    assert_eq!(statuses.first().map(String::as_str), Some("task:START"));
    assert_eq!(statuses.last().map(String::as_str), Some("task:DONE"));
    assert!(statuses.contains(&"listing:OK".to_string()));
    assert!(statuses.contains(&"detail:OK".to_string()));
    assert!(statuses.contains(&"image:SKIP".to_string()));
}

#[tokio::test]
async fn test_second_run_does_not_duplicate_links() {
    let dir = tempfile::tempdir().unwrap();
    let (listing, detail) = write_templates(dir.path());

    let store = Arc::new(MemoryStore::default());
    let id = store
        .create_task(&pipeline_definition("repeat", &listing, &detail))
        .await
        .unwrap();

    let browsers = Arc::new(FakeBrowsers::new(item_links(3), FetchBehavior::Succeed));
    let controller = controller(&store, browsers.clone());

    for _ in 0..2 {
        store.trigger_run_now(id).await.unwrap();
        controller
            .run_task(claim(&store, id).await, &CancellationToken::new())
            .await
            .unwrap();
    }

    let counts = store.counts(&partition()).await.unwrap();
    assert_eq!(counts.total(), 3);
    assert_eq!(counts.crawled, 3);
    assert_eq!(browsers.fetch_count(), 3);

    let logs = store.recent_logs(id, 100).await.unwrap();
    assert_eq!(logs.iter().filter(|l| l.status == "RUN_NOW").count(), 2);
}

#[tokio::test]
async fn test_operator_cancel_releases_links_and_clears_flags() {
    let dir = tempfile::tempdir().unwrap();
    let (listing, detail) = write_templates(dir.path());

    let store = Arc::new(MemoryStore::default());
    let id = store
        .create_task(&pipeline_definition("cancel-me", &listing, &detail))
        .await
        .unwrap();

    let browsers = Arc::new(FakeBrowsers::new(
        item_links(5),
        FetchBehavior::CancelTask { store: store.clone(), task_id: id },
    ));
    let controller = controller(&store, browsers.clone());

    let outcome = controller
        .run_task(claim(&store, id).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(browsers.fetch_count(), 1);

    // The page that finished after the cancel is not recorded
    let counts = store.counts(&partition()).await.unwrap();
    assert_eq!(counts.pending, 5);
    assert_eq!(counts.crawled, 0);

    let task = store.get_task(id).await.unwrap().unwrap();
    assert!(!task.flags.is_running);
    assert!(!task.flags.cancel_requested);
    assert!(task.flags.active);
    assert!(task.next_run_at.is_some());

    let logs = store.recent_logs(id, 1).await.unwrap();
    assert_eq!(logs[0].status, "CANCEL");
    assert!(logs[0].message.contains("next run"));
}

#[tokio::test]
async fn test_block_ends_run_as_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let (listing, detail) = write_templates(dir.path());

    let store = Arc::new(MemoryStore::default());
    let id = store
        .create_task(&pipeline_definition("blocked", &listing, &detail))
        .await
        .unwrap();

    let browsers = Arc::new(FakeBrowsers::new(item_links(4), FetchBehavior::Block));
    let controller = controller(&store, browsers.clone());

    let outcome = controller
        .run_task(claim(&store, id).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Blocked);
    assert_eq!(browsers.fetch_count(), 1);

    let counts = store.counts(&partition()).await.unwrap();
    assert_eq!(counts.error, 1);
    assert_eq!(counts.pending, 3);

    let task = store.get_task(id).await.unwrap().unwrap();
    assert!(!task.flags.is_running);
    assert!(task.next_run_at.is_some());

    let logs = store.recent_logs(id, 1).await.unwrap();
    assert_eq!(logs[0].status, "CANCEL");
    assert!(logs[0].message.contains("Anti-bot block"));
}

#[tokio::test]
async fn test_shutdown_cancels_run_before_first_stage() {
    let dir = tempfile::tempdir().unwrap();
    let (listing, detail) = write_templates(dir.path());

    let store = Arc::new(MemoryStore::default());
    let id = store
        .create_task(&pipeline_definition("shutdown", &listing, &detail))
        .await
        .unwrap();

    let browsers = Arc::new(FakeBrowsers::new(item_links(2), FetchBehavior::Succeed));
    let controller = controller(&store, browsers.clone());

    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let outcome = controller.run_task(claim(&store, id).await, &shutdown).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    assert_eq!(store.counts(&partition()).await.unwrap().total(), 0);
    assert!(!store.is_running(id).await.unwrap());
}

#[tokio::test]
async fn test_missing_inputs_are_skipped() {
    let store = Arc::new(MemoryStore::default());
    let mut def = listing_harvester::crawler::TaskDefinition::from_yaml("name: bare\n").unwrap();
    def.stages.image = true;
    let id = store.create_task(&def).await.unwrap();

    let browsers = Arc::new(FakeBrowsers::new(vec![], FetchBehavior::Succeed));
    let controller = controller(&store, browsers);

    let outcome = controller
        .run_task(claim(&store, id).await, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Completed);

    let logs = store.recent_logs(id, 50).await.unwrap();
    let skips: Vec<&str> = logs
        .iter()
        .filter(|l| l.status == "SKIP")
        .map(|l| l.message.as_str())
        .collect();
    assert!(skips.contains(&"No start URL configured"));
    assert!(skips.contains(&"No detail template configured"));
    assert!(skips.contains(&"No image directory configured"));
}
