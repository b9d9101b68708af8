use anyhow::Result;
use tracing::{info, error};

use listing_harvester::cli;
use listing_harvester::utils::{default_log_file, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::parse_args();

    // The scheduler is long-running, so it logs to a file unless told otherwise
    let log_file = args
        .log_file
        .clone()
        .or_else(|| args.is_run().then(default_log_file));
    init_logging(args.verbose, log_file)?;

    info!("Starting listing-harvester v{}", env!("CARGO_PKG_VERSION"));

    // Process commands
    match cli::process_command(args).await {
        Ok(_) => {
            info!("Command completed successfully");
            Ok(())
        }
        Err(e) => {
            error!("Command failed: {:#}", e);
            Err(e)
        }
    }
}
