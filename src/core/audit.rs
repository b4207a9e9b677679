//! 审计日志 - 按日期分文件的 JSON Lines，仅追加

use super::clock::Clock;
use super::mirror::{AttemptOutcome, AttemptTarget, TransferAttempt};
use super::outcome::RecordStatus;
use crate::error::ErrorKind;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// 审计条目
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEntry {
    FileAttempt {
        timestamp: DateTime<Utc>,
        record_id: String,
        target: AttemptTarget,
        source_id: String,
        source_name: String,
        destination_path: String,
        final_name: Option<String>,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        error: Option<String>,
        dry_run: bool,
    },
    RecordSummary {
        timestamp: DateTime<Utc>,
        record_id: String,
        folder_id: Option<String>,
        folder_name: Option<String>,
        files_discovered: usize,
        files_transferred: usize,
        failures: usize,
        status: RecordStatus,
        /// 实际写回的完成标记，未写回时为 None
        checkbox: Option<bool>,
        reason: Option<String>,
        dry_run: bool,
    },
}

impl AuditEntry {
    pub fn attempt(record_id: &str, attempt: &TransferAttempt, dry_run: bool) -> Self {
        AuditEntry::FileAttempt {
            timestamp: attempt.timestamp,
            record_id: record_id.to_string(),
            target: attempt.target,
            source_id: attempt.source_id.clone(),
            source_name: attempt.source_name.clone(),
            destination_path: attempt.destination_path.clone(),
            final_name: attempt.final_name.clone(),
            outcome: attempt.outcome,
            error_kind: attempt.error_kind,
            error: attempt.error.clone(),
            dry_run,
        }
    }
}

struct CurrentFile {
    date: NaiveDate,
    writer: BufWriter<File>,
}

/// 按 UTC 日期切分的审计文件 `audit_YYYYMMDD.jsonl`
#[derive(Clone)]
pub struct AuditLog {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    current: Arc<Mutex<Option<CurrentFile>>>,
}

impl AuditLog {
    pub fn new(dir: &Path, clock: Arc<dyn Clock>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            clock,
            current: Arc::new(Mutex::new(None)),
        })
    }

    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("audit_{}.jsonl", date.format("%Y%m%d")))
    }

    fn open(&self, date: NaiveDate) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(date))?;
        Ok(BufWriter::new(file))
    }

    /// 追加一条记录，日期变化时切换文件
    pub fn append(&self, entry: &AuditEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry)?;
        let today = self.clock.now().date_naive();

        let mut guard = self
            .current
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "audit writer poisoned"))?;

        let stale = guard.as_ref().map_or(true, |c| c.date != today);
        if stale {
            if let Some(mut old) = guard.take() {
                old.writer.flush()?;
            }
            *guard = Some(CurrentFile {
                date: today,
                writer: self.open(today)?,
            });
        }

        if let Some(current) = guard.as_mut() {
            writeln!(current.writer, "{}", line)?;
            current.writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::FixedClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn summary(record_id: &str) -> AuditEntry {
        AuditEntry::RecordSummary {
            timestamp: Utc::now(),
            record_id: record_id.to_string(),
            folder_id: Some("f1".to_string()),
            folder_name: Some("Acme".to_string()),
            files_discovered: 2,
            files_transferred: 1,
            failures: 1,
            status: RecordStatus::PartiallyFailed,
            checkbox: Some(true),
            reason: None,
            dry_run: false,
        }
    }

    #[test]
    fn test_entries_append_as_json_lines() {
        let dir = TempDir::new().unwrap();
        let day = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let log = AuditLog::new(dir.path(), Arc::new(FixedClock(day))).unwrap();

        log.append(&summary("r1")).unwrap();
        log.append(&summary("r2")).unwrap();

        let content = fs::read_to_string(dir.path().join("audit_20240601.jsonl")).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "record_summary");
        assert_eq!(lines[0]["status"], "partially_failed");
        assert_eq!(lines[1]["record_id"], "r2");
    }

    #[test]
    fn test_new_day_goes_to_new_file() {
        let dir = TempDir::new().unwrap();
        let first = Utc.with_ymd_and_hms(2024, 6, 1, 23, 59, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 6, 2, 0, 1, 0).unwrap();

        AuditLog::new(dir.path(), Arc::new(FixedClock(first)))
            .unwrap()
            .append(&summary("r1"))
            .unwrap();
        AuditLog::new(dir.path(), Arc::new(FixedClock(second)))
            .unwrap()
            .append(&summary("r2"))
            .unwrap();

        assert!(dir.path().join("audit_20240601.jsonl").exists());
        assert!(dir.path().join("audit_20240602.jsonl").exists());
    }
}
