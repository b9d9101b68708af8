use chrono::{DateTime, Utc};
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::crawler::schedule::Schedule;

/// Status of a link in the work queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkStatus {
    Pending,
    InProgress,
    Crawled,
    Error,
}

impl LinkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkStatus::Pending => "PENDING",
            LinkStatus::InProgress => "IN_PROGRESS",
            LinkStatus::Crawled => "CRAWLED",
            LinkStatus::Error => "ERROR",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(LinkStatus::Pending),
            "IN_PROGRESS" => Some(LinkStatus::InProgress),
            "CRAWLED" => Some(LinkStatus::Crawled),
            "ERROR" => Some(LinkStatus::Error),
            _ => None,
        }
    }

    /// Terminal states are never reverted to PENDING automatically
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkStatus::Crawled | LinkStatus::Error)
    }
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue partition tags. Used both to tag inserted links and to filter leases;
/// a `None` component matches anything when filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl Partition {
    pub fn new(domain: Option<String>, category: Option<String>) -> Self {
        Self { domain, category }
    }

    pub fn matches(&self, domain: Option<&str>, category: Option<&str>) -> bool {
        let domain_ok = match &self.domain {
            Some(wanted) => domain == Some(wanted.as_str()),
            None => true,
        };
        let category_ok = match &self.category {
            Some(wanted) => category == Some(wanted.as_str()),
            None => true,
        };
        domain_ok && category_ok
    }
}

/// A discovered URL in the work queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedLink {
    pub id: i64,
    pub url: String,
    pub status: LinkStatus,
    pub domain: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status link counts for one partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: u64,
    pub in_progress: u64,
    pub crawled: u64,
    pub error: u64,
}

impl QueueCounts {
    pub fn add(&mut self, status: LinkStatus, count: u64) {
        match status {
            LinkStatus::Pending => self.pending += count,
            LinkStatus::InProgress => self.in_progress += count,
            LinkStatus::Crawled => self.crawled += count,
            LinkStatus::Error => self.error += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.in_progress + self.crawled + self.error
    }
}

/// Download status of an image record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Pending,
    Downloaded,
    Failed,
}

impl ImageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "PENDING",
            ImageStatus::Downloaded => "DOWNLOADED",
            ImageStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(ImageStatus::Pending),
            "DOWNLOADED" => Some(ImageStatus::Downloaded),
            "FAILED" => Some(ImageStatus::Failed),
            _ => None,
        }
    }
}

/// Detail record written once per successfully scraped link
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailRecord {
    pub id: i64,
    pub link_id: i64,
    pub url: String,
    pub domain: Option<String>,
    pub fields: serde_json::Value,
    pub image_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for a new detail record and its images
#[derive(Debug, Clone)]
pub struct DetailDraft {
    pub link_id: i64,
    pub url: String,
    pub domain: Option<String>,
    pub fields: serde_json::Value,
    pub images: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: i64,
    pub detail_id: i64,
    pub image_url: String,
    pub idx: i32,
    pub status: ImageStatus,
    pub attempts: i32,
    pub file_path: Option<String>,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Stage a run-log row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Task,
    Listing,
    Detail,
    Image,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Task => "task",
            RunStage::Listing => "listing",
            RunStage::Detail => "detail",
            RunStage::Image => "image",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStatus {
    Queued,
    Start,
    RunNow,
    Info,
    Ok,
    Skip,
    Error,
    Cancel,
    Done,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Queued => "QUEUED",
            LogStatus::Start => "START",
            LogStatus::RunNow => "RUN_NOW",
            LogStatus::Info => "INFO",
            LogStatus::Ok => "OK",
            LogStatus::Skip => "SKIP",
            LogStatus::Error => "ERROR",
            LogStatus::Cancel => "CANCEL",
            LogStatus::Done => "DONE",
        }
    }
}

impl fmt::Display for LogStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only run history row
#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub stage: String,
    pub status: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Random wait between two bounds, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaitRange {
    pub min: f64,
    pub max: f64,
}

impl WaitRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub const fn zero() -> Self {
        Self { min: 0.0, max: 0.0 }
    }

    /// Draw a duration uniformly from the range. Inverted bounds collapse to `min`.
    pub fn sample(&self) -> Duration {
        let lo = if self.min.is_finite() { self.min.max(0.0) } else { 0.0 };
        let hi = if self.max.is_finite() { self.max.max(lo) } else { lo };

        if hi <= 0.0 {
            return Duration::ZERO;
        }
        if hi <= lo {
            return Duration::from_secs_f64(lo);
        }

        Duration::from_secs_f64(thread_rng().gen_range(lo..=hi))
    }
}

/// Which stages a run executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageToggles {
    #[serde(default = "default_true")]
    pub listing: bool,
    #[serde(default = "default_true")]
    pub detail: bool,
    #[serde(default)]
    pub image: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self { listing: true, detail: true, image: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingParams {
    pub start_url: Option<String>,
    pub template_path: Option<PathBuf>,
    pub max_pages: u32,
    pub wait_load: WaitRange,
    pub wait_next: WaitRange,
    pub fake_scroll: bool,
}

impl Default for ListingParams {
    fn default() -> Self {
        Self {
            start_url: None,
            template_path: None,
            max_pages: 1,
            wait_load: WaitRange::new(20.0, 30.0),
            wait_next: WaitRange::new(10.0, 20.0),
            fake_scroll: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailParams {
    pub template_path: Option<PathBuf>,
    pub wait_load: WaitRange,
    pub delay: WaitRange,
    pub max_retries: u32,
}

impl Default for DetailParams {
    fn default() -> Self {
        Self {
            template_path: None,
            wait_load: WaitRange::new(2.0, 5.0),
            delay: WaitRange::new(2.0, 3.0),
            max_retries: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageParams {
    pub image_dir: Option<PathBuf>,
    pub images_per_minute: u32,
}

impl Default for ImageParams {
    fn default() -> Self {
        Self { image_dir: None, images_per_minute: 30 }
    }
}

/// Mutable run-state flags of a task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    pub active: bool,
    pub is_running: bool,
    pub cancel_requested: bool,
    pub run_now: bool,
}

/// A recurring scraping job
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub schedule: Schedule,
    pub flags: TaskFlags,
    pub stages: StageToggles,
    pub partition: Partition,
    pub listing: ListingParams,
    pub detail: DetailParams,
    pub image: ImageParams,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Build a fresh, idle task from an operator definition
    pub fn from_definition(id: i64, def: &TaskDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: def.name.clone(),
            schedule: def.schedule.clone(),
            flags: TaskFlags { active: def.active, ..TaskFlags::default() },
            stages: def.stages,
            partition: def.partition.clone(),
            listing: def.listing.clone(),
            detail: def.detail.clone(),
            image: def.image.clone(),
            last_run_at: None,
            next_run_at: None,
            updated_at: now,
        }
    }
}

/// Operator-facing task definition, read from YAML by `task add`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub schedule: Schedule,
    #[serde(default)]
    pub stages: StageToggles,
    #[serde(flatten)]
    pub partition: Partition,
    #[serde(default)]
    pub listing: ListingParams,
    #[serde(default)]
    pub detail: DetailParams,
    #[serde(default)]
    pub image: ImageParams,
}

impl TaskDefinition {
    pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
        let def: Self = serde_yaml::from_str(contents)?;
        anyhow::ensure!(!def.name.trim().is_empty(), "task name must not be empty");
        Ok(def)
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults() {
        let def = TaskDefinition::from_yaml(
            r#"
name: idealista-madrid
domain: idealista
category: venta
listing:
  start_url: https://example.com/venta/madrid/
  template_path: templates/listing.json
  max_pages: 3
detail:
  template_path: templates/detail.json
"#,
        )
        .unwrap();

        assert!(def.active);
        assert_eq!(def.schedule, Schedule::Interval { minutes: 30 });
        assert_eq!(def.stages, StageToggles { listing: true, detail: true, image: false });
        assert_eq!(def.partition.domain.as_deref(), Some("idealista"));
        assert_eq!(def.listing.max_pages, 3);
        assert_eq!(def.listing.wait_load, WaitRange::new(20.0, 30.0));
        assert_eq!(def.detail.max_retries, 2);
        assert_eq!(def.detail.delay, WaitRange::new(2.0, 3.0));
        assert_eq!(def.image.images_per_minute, 30);
    }

    #[test]
    fn test_definition_requires_name() {
        assert!(TaskDefinition::from_yaml("name: '  '").is_err());
    }

    #[test]
    fn test_wait_range_sample() {
        let range = WaitRange::new(0.01, 0.02);
        for _ in 0..50 {
            let d = range.sample();
            assert!(d >= Duration::from_millis(9) && d <= Duration::from_millis(21));
        }

        assert_eq!(WaitRange::zero().sample(), Duration::ZERO);
        assert_eq!(WaitRange::new(3.0, 1.0).sample(), Duration::from_secs(3));
        assert_eq!(WaitRange::new(-5.0, -1.0).sample(), Duration::ZERO);
    }

    #[test]
    fn test_partition_matches() {
        let any = Partition::default();
        assert!(any.matches(None, None));
        assert!(any.matches(Some("a"), Some("b")));

        let domain_only = Partition::new(Some("a".into()), None);
        assert!(domain_only.matches(Some("a"), Some("x")));
        assert!(!domain_only.matches(Some("b"), None));
        assert!(!domain_only.matches(None, None));
    }
}
