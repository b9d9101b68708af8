use anyhow::{Result, Context};
use chrono::{DateTime, Local, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::DefaultBrowserFactory;
use crate::cli::config::AppConfig;
use crate::crawler::controller::CrawlerController;
use crate::crawler::extract::CssFieldExtractor;
use crate::crawler::scheduler::Scheduler;
use crate::crawler::task::{Partition, Task, TaskDefinition};
use crate::storage::Storage;

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    Storage::create(&config.database, &config.queue)
        .await
        .context("Failed to open storage")
}

fn local_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Run the scheduler until Ctrl-C or SIGTERM
pub async fn run(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    let browsers = Arc::new(DefaultBrowserFactory::new(config.browser.clone(), config.browser_service.clone()));
    let controller = Arc::new(CrawlerController::new(
        config.clone(),
        storage,
        browsers,
        Arc::new(CssFieldExtractor),
    ));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let mut scheduler = Scheduler::new(controller, config.scheduler.clone());
    scheduler.serve(shutdown).await?;

    info!("Scheduler stopped");
    Ok(())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Received Ctrl-C");
    }

    shutdown.cancel();
}

/// Create a task from a YAML definition
pub async fn add_task(config: AppConfig, file: PathBuf) -> Result<()> {
    let contents = std::fs::read_to_string(&file)
        .context(format!("Failed to read task definition: {}", file.display()))?;
    let definition = TaskDefinition::from_yaml(&contents)?;

    let storage = open_storage(&config).await?;
    let id = storage.tasks.create_task(&definition).await?;

    println!("Created task {} ({})", id, definition.name);
    Ok(())
}

pub async fn list_tasks(config: AppConfig) -> Result<()> {
    let storage = open_storage(&config).await?;
    let tasks = storage.tasks.list_tasks().await?;

    if tasks.is_empty() {
        println!("No tasks defined");
        return Ok(());
    }

    println!(
        "{:<5} {:<28} {:<8} {:<8} {:<22} {:<17}",
        "ID", "NAME", "ACTIVE", "RUNNING", "SCHEDULE", "NEXT RUN"
    );
    for task in tasks {
        println!(
            "{:<5} {:<28} {:<8} {:<8} {:<22} {:<17}",
            task.id,
            task.name,
            if task.flags.active { "yes" } else { "no" },
            if task.flags.is_running { "yes" } else { "no" },
            task.schedule.describe(),
            local_time(task.next_run_at),
        );
    }

    Ok(())
}

fn print_task(task: &Task) {
    println!("Task {}: {}", task.id, task.name);
    println!("  Schedule:      {}", task.schedule.describe());
    println!(
        "  Flags:         active={} running={} cancel_requested={} run_now={}",
        task.flags.active, task.flags.is_running, task.flags.cancel_requested, task.flags.run_now
    );
    println!(
        "  Stages:        listing={} detail={} image={}",
        task.stages.listing, task.stages.detail, task.stages.image
    );
    println!(
        "  Partition:     domain={} category={}",
        task.partition.domain.as_deref().unwrap_or("-"),
        task.partition.category.as_deref().unwrap_or("-")
    );
    println!("  Start URL:     {}", task.listing.start_url.as_deref().unwrap_or("-"));
    println!(
        "  Listing:       template={} max_pages={}",
        task.listing.template_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
        task.listing.max_pages
    );
    println!(
        "  Detail:        template={} max_retries={}",
        task.detail.template_path.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
        task.detail.max_retries
    );
    println!(
        "  Images:        dir={} per_minute={}",
        task.image.image_dir.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "-".into()),
        task.image.images_per_minute
    );
    println!("  Last run:      {}", local_time(task.last_run_at));
    println!("  Next run:      {}", local_time(task.next_run_at));
    println!("  Heartbeat:     {}", local_time(Some(task.updated_at)));
}

pub async fn show_task(config: AppConfig, id: i64) -> Result<()> {
    let storage = open_storage(&config).await?;
    let task = storage
        .tasks
        .get_task(id)
        .await?
        .context(format!("Task {} not found", id))?;

    print_task(&task);
    Ok(())
}

pub async fn set_active(config: AppConfig, id: i64, active: bool) -> Result<()> {
    let storage = open_storage(&config).await?;
    if !storage.tasks.set_active(id, active).await? {
        anyhow::bail!("Task {} not found", id);
    }

    println!("Task {} {}", id, if active { "enabled" } else { "disabled" });
    Ok(())
}

pub async fn run_now(config: AppConfig, id: i64) -> Result<()> {
    let storage = open_storage(&config).await?;
    if !storage.tasks.trigger_run_now(id).await? {
        anyhow::bail!("Task {} not found", id);
    }

    println!("Task {} will run at the next scheduler iteration", id);
    Ok(())
}

pub async fn cancel(config: AppConfig, id: i64, deactivate: bool) -> Result<()> {
    let storage = open_storage(&config).await?;

    if storage.tasks.request_cancel(id).await? {
        println!("Cancellation requested for task {}", id);
    } else {
        println!("Task {} is not running", id);
    }

    if deactivate {
        if !storage.tasks.set_active(id, false).await? {
            anyhow::bail!("Task {} not found", id);
        }
        println!("Task {} disabled", id);
    }

    Ok(())
}

pub async fn logs(config: AppConfig, id: i64, limit: i64) -> Result<()> {
    let storage = open_storage(&config).await?;
    let entries = storage.tasks.recent_logs(id, limit).await?;

    if entries.is_empty() {
        println!("No log entries for task {}", id);
        return Ok(());
    }

    // Oldest first reads naturally in a terminal
    for entry in entries.iter().rev() {
        println!(
            "{} {:<8} {:<8} {}",
            local_time(Some(entry.created_at)),
            entry.stage,
            entry.status,
            entry.message
        );
    }

    Ok(())
}

pub async fn queue_stats(config: AppConfig, domain: Option<String>, category: Option<String>) -> Result<()> {
    let storage = open_storage(&config).await?;
    let counts = storage.queue.counts(&Partition::new(domain, category)).await?;

    println!("PENDING:     {}", counts.pending);
    println!("IN_PROGRESS: {}", counts.in_progress);
    println!("CRAWLED:     {}", counts.crawled);
    println!("ERROR:       {}", counts.error);
    println!("TOTAL:       {}", counts.total());

    Ok(())
}

/// Print the effective configuration
pub fn show_config(config: &AppConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    println!("Current configuration:");
    println!("{}", yaml);
    Ok(())
}
