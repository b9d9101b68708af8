pub mod logging;
pub mod notify;

// Re-export common functions
pub use logging::{init_logging, default_log_file};
pub use notify::Notifier;
