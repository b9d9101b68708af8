use chrono::{DateTime, Duration, Local, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Default interval in minutes
pub const DEFAULT_INTERVAL_MINUTES: u32 = 30;

/// Times used when a daily schedule has no usable entries
const DEFAULT_DAILY_TIMES: [(u32, u32); 2] = [(8, 0), (20, 0)];

/// When a task should run again
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Every `minutes` minutes after the start of the previous run
    Interval {
        #[serde(default = "default_interval")]
        minutes: u32,
    },
    /// Fixed local times of day, `HH:MM`
    Daily {
        #[serde(default)]
        times: Vec<String>,
    },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Interval { minutes: DEFAULT_INTERVAL_MINUTES }
    }
}

impl Schedule {
    /// Rebuild a schedule from its stored columns
    pub fn from_columns(kind: &str, interval_minutes: Option<i32>, run_times: Option<&str>) -> Self {
        match kind {
            "daily" => Schedule::Daily {
                times: run_times
                    .unwrap_or_default()
                    .split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
            },
            _ => Schedule::Interval {
                minutes: interval_minutes
                    .and_then(|m| u32::try_from(m).ok())
                    .unwrap_or(DEFAULT_INTERVAL_MINUTES),
            },
        }
    }

    /// Column values `(schedule_type, interval_minutes, run_times)`
    pub fn to_columns(&self) -> (&'static str, Option<i32>, Option<String>) {
        match self {
            Schedule::Interval { minutes } => {
                ("interval", Some(i32::try_from(*minutes).unwrap_or(i32::MAX)), None)
            }
            Schedule::Daily { times } => ("daily", None, Some(times.join(","))),
        }
    }

    /// Parsed daily times, sorted, falling back to the defaults when none parse
    pub fn daily_times(times: &[String]) -> Vec<NaiveTime> {
        let mut parsed: Vec<NaiveTime> = times
            .iter()
            .filter_map(|t| {
                let t = t.trim();
                NaiveTime::parse_from_str(t, "%H:%M")
                    .or_else(|_| NaiveTime::parse_from_str(t, "%H:%M:%S"))
                    .ok()
            })
            .collect();

        if parsed.is_empty() {
            parsed = DEFAULT_DAILY_TIMES
                .iter()
                .filter_map(|(h, m)| NaiveTime::from_hms_opt(*h, *m, 0))
                .collect();
        }

        parsed.sort();
        parsed.dedup();
        parsed
    }

    /// Next run strictly after `now`, evaluated in `now`'s timezone
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        match self {
            Schedule::Interval { minutes } => {
                now.clone() + Duration::minutes(i64::from((*minutes).max(1)))
            }
            Schedule::Daily { times } => {
                let times = Self::daily_times(times);
                let tz = now.timezone();
                let today = now.date_naive();

                // First slot later today
                for time in &times {
                    if let Some(candidate) = tz.from_local_datetime(&today.and_time(*time)).earliest() {
                        if candidate > *now {
                            return candidate;
                        }
                    }
                }

                // Otherwise wrap to the first slot tomorrow
                today
                    .succ_opt()
                    .zip(times.first())
                    .and_then(|(tomorrow, first)| {
                        tz.from_local_datetime(&tomorrow.and_time(*first)).earliest()
                    })
                    .unwrap_or_else(|| now.clone() + Duration::days(1))
            }
        }
    }

    /// Next run in the local timezone, returned as UTC
    pub fn next_run(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.next_run_after(&now.with_timezone(&Local)).with_timezone(&Utc)
    }

    pub fn describe(&self) -> String {
        match self {
            Schedule::Interval { minutes } => format!("every {} min", (*minutes).max(1)),
            Schedule::Daily { times } => {
                let times: Vec<String> = Self::daily_times(times)
                    .iter()
                    .map(|t| t.format("%H:%M").to_string())
                    .collect();
                format!("daily at {}", times.join(", "))
            }
        }
    }
}

fn default_interval() -> u32 {
    DEFAULT_INTERVAL_MINUTES
}
