pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted
    Run,

    /// Manage scraping tasks
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Inspect the work queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// Create a task from a YAML definition
    Add {
        #[arg(short, long, required = true)]
        file: PathBuf,
    },

    /// List all tasks
    List,

    /// Show one task in detail
    Show {
        #[arg(required = true)]
        id: i64,
    },

    /// Make a task eligible for scheduling
    Enable {
        #[arg(required = true)]
        id: i64,
    },

    /// Stop scheduling a task
    Disable {
        #[arg(required = true)]
        id: i64,
    },

    /// Run a task at the next scheduler iteration
    RunNow {
        #[arg(required = true)]
        id: i64,
    },

    /// Ask a running task to stop at its next checkpoint
    Cancel {
        #[arg(required = true)]
        id: i64,

        /// Also stop scheduling the task
        #[arg(long)]
        deactivate: bool,
    },

    /// Show the most recent run log entries of a task
    Logs {
        #[arg(required = true)]
        id: i64,

        #[arg(short, long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Link counts per status
    Stats {
        #[arg(long)]
        domain: Option<String>,

        #[arg(long)]
        category: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
}

impl Cli {
    /// True for the long-running scheduler command
    pub fn is_run(&self) -> bool {
        matches!(self.command, Commands::Run)
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = config::AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run => {
            info!("Starting scheduler");
            commands::run(config).await
        }
        Commands::Task { action } => match action {
            TaskAction::Add { file } => commands::add_task(config, file).await,
            TaskAction::List => commands::list_tasks(config).await,
            TaskAction::Show { id } => commands::show_task(config, id).await,
            TaskAction::Enable { id } => commands::set_active(config, id, true).await,
            TaskAction::Disable { id } => commands::set_active(config, id, false).await,
            TaskAction::RunNow { id } => commands::run_now(config, id).await,
            TaskAction::Cancel { id, deactivate } => commands::cancel(config, id, deactivate).await,
            TaskAction::Logs { id, limit } => commands::logs(config, id, limit).await,
        },
        Commands::Queue { action } => match action {
            QueueAction::Stats { domain, category } => commands::queue_stats(config, domain, category).await,
        },
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::show_config(&config),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_cancel_with_deactivate() {
        let cli = Cli::try_parse_from(["harvester", "task", "cancel", "7", "--deactivate"]).unwrap();
        match cli.command {
            Commands::Task { action: TaskAction::Cancel { id, deactivate } } => {
                assert_eq!(id, 7);
                assert!(deactivate);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["harvester", "queue", "stats", "--domain", "homes.example.com", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(
            cli.command,
            Commands::Queue { action: QueueAction::Stats { domain: Some(_), category: None } }
        ));
    }
}
