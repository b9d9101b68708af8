pub mod block;
pub mod cancel;
pub mod controller;
pub mod detail;
pub mod extract;
pub mod images;
pub mod listing;
pub mod report;
pub mod runlog;
pub mod schedule;
pub mod scheduler;
pub mod task;
pub mod template;

// Re-export common types
pub use controller::{CrawlerController, RunOutcome};
pub use scheduler::Scheduler;
pub use task::{Task, TaskDefinition};

/// How a stage stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEnd {
    Finished,
    Cancelled,
    /// Anti-bot wall hit, the run must stop
    Blocked,
}
