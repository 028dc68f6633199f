//! Append-only JSONL run journal (`data/<script>/events.jsonl`).

use crate::core::types::{JournalEvent, TimestampedEvent};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Days since the epoch to a UTC (year, month, day).
fn civil_date(days: u64) -> (i64, u32, u32) {
    let mut y = 1970i64;
    let mut remaining = days as i64;
    loop {
        let year_days = if is_leap(y) { 366 } else { 365 };
        if remaining < year_days {
            break;
        }
        remaining -= year_days;
        y += 1;
    }
    let feb = if is_leap(y) { 29 } else { 28 };
    let month_days = [31, feb, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31];
    let mut m = 12;
    for (i, &md) in month_days.iter().enumerate() {
        if remaining < md {
            m = i as u32 + 1;
            break;
        }
        remaining -= md;
    }
    (y, m, remaining as u32 + 1)
}

fn is_leap(y: i64) -> bool {
    (y % 4 == 0 && y % 100 != 0) || y % 400 == 0
}

fn iso8601(secs: u64) -> String {
    let (y, m, d) = civil_date(secs / 86400);
    let t = secs % 86400;
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        y,
        m,
        d,
        t / 3600,
        (t % 3600) / 60,
        t % 60
    )
}

/// Current UTC time as ISO 8601.
pub fn now_iso8601() -> String {
    iso8601(now_secs())
}

fn month_day_year(secs: u64) -> String {
    let (y, m, d) = civil_date(secs / 86400);
    format!("{}-{}-{}", m, d, y)
}

/// Today's UTC date as `M-D-YYYY`, the metadata start date.
pub fn start_date() -> String {
    month_day_year(now_secs())
}

/// Generate a script run ID.
pub fn generate_run_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("r-{:012x}", nanos & 0xFFFF_FFFF_FFFF)
}

/// Journal path for a script under the data directory.
pub fn event_log_path(data_dir: &Path, script: &str) -> PathBuf {
    data_dir.join(script).join("events.jsonl")
}

/// Append one timestamped event to `path`.
pub fn append_event(path: &Path, event: JournalEvent) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
    }
    let te = TimestampedEvent {
        ts: now_iso8601(),
        event,
    };
    let json = serde_json::to_string(&te).map_err(|e| format!("JSON serialize error: {}", e))?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("cannot open event log {}: {}", path.display(), e))?;
    writeln!(file, "{}", json).map_err(|e| format!("write error: {}", e))?;
    Ok(())
}

/// Read every event back, skipping lines that do not parse.
pub fn read_events(path: &Path) -> Result<Vec<TimestampedEvent>, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read event log {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Journal shared by worker threads. Appends are serialized.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Journal {
    pub fn new(data_dir: &Path, script: &str) -> Self {
        Self {
            path: event_log_path(data_dir, script),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `event`. Failures are logged, never propagated.
    pub fn record(&self, event: JournalEvent) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = append_event(&self.path, event) {
            log::warn!("journal: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eventlog_now_iso8601() {
        let ts = now_iso8601();
        assert!(ts.starts_with("20"));
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }

    #[test]
    fn test_eventlog_known_dates() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00Z");
        // 2024-02-29 12:30:15 UTC
        assert_eq!(iso8601(1_709_209_815), "2024-02-29T12:30:15Z");
        assert_eq!(month_day_year(1_709_209_815), "2-29-2024");
        // 2025-12-31
        assert_eq!(month_day_year(1_767_139_200), "12-31-2025");
    }

    #[test]
    fn test_eventlog_start_date_shape() {
        let d = start_date();
        let parts: Vec<&str> = d.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 4);
        assert!(!parts[0].starts_with('0'));
    }

    #[test]
    fn test_eventlog_generate_run_id() {
        let id = generate_run_id();
        assert!(id.starts_with("r-"));
        assert_eq!(id.len(), 14);
    }

    #[test]
    fn test_eventlog_path() {
        let p = event_log_path(Path::new("/work/data"), "demo");
        assert_eq!(p, PathBuf::from("/work/data/demo/events.jsonl"));
    }

    #[test]
    fn test_eventlog_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "demo");
        journal.record(JournalEvent::RunStarted { run: "base_1".into() });
        journal.record(JournalEvent::RunGenerated {
            run: "base_1".into(),
            hash: "blake3:abc".into(),
        });
        let content = std::fs::read_to_string(journal.path()).unwrap();
        assert!(content.contains("\"event\":\"run_started\""));
        let events = read_events(journal.path()).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1].event, JournalEvent::RunGenerated { .. }));
    }

    #[test]
    fn test_eventlog_concurrent_appends() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::new(dir.path(), "demo");
        std::thread::scope(|s| {
            for i in 0..8 {
                let journal = &journal;
                s.spawn(move || journal.record(JournalEvent::RunStarted { run: format!("r{}", i) }));
            }
        });
        assert_eq!(read_events(journal.path()).unwrap().len(), 8);
    }

    #[test]
    fn test_eventlog_is_leap() {
        assert!(is_leap(2000));
        assert!(!is_leap(1900));
        assert!(is_leap(2024));
        assert!(!is_leap(2026));
    }
}
