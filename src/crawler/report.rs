use anyhow::{Result, Context};
use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Timelike, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::cli::config::ReportSettings;
use crate::crawler::task::DetailRecord;
use crate::storage::records::RecordStore;

const MARKER_FILE: &str = "last_report_date.txt";
const FIXED_COLUMNS: [&str; 4] = ["id", "url", "domain", "created_at"];

/// Writes `report_<date>.csv` with the day's detail records, once per local day
pub struct DailyReport {
    settings: ReportSettings,
    records: Arc<dyn RecordStore>,
}

impl DailyReport {
    pub fn new(settings: ReportSettings, records: Arc<dyn RecordStore>) -> Self {
        Self { settings, records }
    }

    /// Write today's report if enabled, past the configured hour and not yet
    /// written. Returns the path of a freshly written report.
    pub async fn maybe_write(&self, now: DateTime<Local>) -> Result<Option<PathBuf>> {
        if !self.settings.enabled || now.hour() < self.settings.hour {
            return Ok(None);
        }

        let today = now.date_naive();
        let marker = self.settings.output_dir.join(MARKER_FILE);
        if let Ok(last) = fs::read_to_string(&marker) {
            if last.trim() == today.to_string() {
                return Ok(None);
            }
        }

        let (start, end) = local_day(today)?;
        let details = self.records.details_created_between(start, end).await?;

        fs::create_dir_all(&self.settings.output_dir).context(format!(
            "Failed to create report directory: {}",
            self.settings.output_dir.display()
        ))?;

        let path = self.settings.output_dir.join(format!("report_{}.csv", today));
        write_csv(&path, &details)?;
        fs::write(&marker, today.to_string())
            .context(format!("Failed to write report marker: {}", marker.display()))?;

        info!(rows = details.len(), path = %path.display(), "Wrote daily report");
        Ok(Some(path))
    }
}

fn local_day(day: NaiveDate) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = day.and_hms_opt(0, 0, 0).context("Invalid report date")?;
    let start = Local
        .from_local_datetime(&midnight)
        .earliest()
        .context(format!("Local midnight of {} does not exist", day))?
        .with_timezone(&Utc);
    Ok((start, start + Duration::days(1)))
}

/// Fixed columns, then every extracted field seen that day in name order
fn write_csv(path: &Path, details: &[DetailRecord]) -> Result<()> {
    let field_names: BTreeSet<&str> = details
        .iter()
        .filter_map(|d| d.fields.as_object())
        .flat_map(|fields| fields.keys().map(String::as_str))
        .collect();

    let mut writer = csv::Writer::from_path(path)
        .context(format!("Failed to create report: {}", path.display()))?;

    let header: Vec<&str> = FIXED_COLUMNS.iter().copied().chain(field_names.iter().copied()).collect();
    writer.write_record(&header).context("Failed to write report header")?;

    for detail in details {
        let mut row = vec![
            detail.id.to_string(),
            detail.url.clone(),
            detail.domain.clone().unwrap_or_default(),
            detail.created_at.to_rfc3339(),
        ];
        row.extend(field_names.iter().map(|name| cell(detail.fields.get(*name))));
        writer.write_record(&row).context("Failed to write report row")?;
    }

    writer.flush().context("Failed to flush report")?;
    Ok(())
}

fn cell(value: Option<&serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => String::new(),
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::task::DetailDraft;
    use crate::storage::memory::MemoryStore;

    fn report(dir: &std::path::Path, store: &Arc<MemoryStore>, hour: u32) -> DailyReport {
        DailyReport::new(
            ReportSettings {
                enabled: true,
                output_dir: dir.join("reports"),
                hour,
            },
            store.clone(),
        )
    }

    async fn add_detail(store: &MemoryStore, link_id: i64, fields: serde_json::Value) {
        store
            .insert_detail(&DetailDraft {
                link_id,
                url: format!("https://example.com/inmueble/{}", link_id),
                domain: Some("idealista".into()),
                fields,
                images: Vec::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_report_written_once_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        add_detail(&store, 1, serde_json::json!({"title": "Piso, centro", "price": 1200})).await;
        add_detail(&store, 2, serde_json::json!({"title": "Ático", "rooms": null})).await;

        let report = report(dir.path(), &store, 0);
        let now = Local::now();

        let path = report.maybe_write(now).await.unwrap().unwrap();
        assert_eq!(path.file_name().unwrap().to_string_lossy(), format!("report_{}.csv", now.date_naive()));

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(str::to_string).collect();
        assert_eq!(headers, ["id", "url", "domain", "created_at", "price", "rooms", "title"]);

        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        // Newest first
        assert_eq!(&rows[0][0], "2");
        assert_eq!(&rows[0][6], "Ático");
        assert_eq!(&rows[1][4], "1200");
        assert_eq!(&rows[1][6], "Piso, centro");

        assert!(report.maybe_write(now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_report_waits_for_configured_hour() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let report = report(dir.path(), &store, 23);

        let morning = Local
            .from_local_datetime(&Local::now().date_naive().and_hms_opt(10, 0, 0).unwrap())
            .earliest()
            .unwrap();

        assert!(report.maybe_write(morning).await.unwrap().is_none());
        assert!(!dir.path().join("reports").exists());
    }

    #[tokio::test]
    async fn test_disabled_report_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let report = DailyReport::new(
            ReportSettings {
                enabled: false,
                output_dir: dir.path().to_path_buf(),
                hour: 0,
            },
            store,
        );

        assert!(report.maybe_write(Local::now()).await.unwrap().is_none());
        assert!(!dir.path().join(MARKER_FILE).exists());
    }
}
