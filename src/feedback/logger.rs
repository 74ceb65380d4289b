use anyhow::{Context, Result};
use cadforge_common::FeedbackEntry;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// File an entry written at `at` belongs to.
pub fn feedback_file_name(at: DateTime<Utc>) -> String {
    format!("production_{}.jsonl", at.format("%Y%m"))
}

/// Appends feedback entries to monthly JSONL files.
///
/// Write failures never reach the caller: they are reported through
/// `tracing` and the entry is dropped.
pub struct FeedbackLogger {
    dir: Option<PathBuf>,
    // Serializes appends so concurrent part workers never interleave lines.
    write_lock: Mutex<()>,
}

impl FeedbackLogger {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
            write_lock: Mutex::new(()),
        }
    }

    /// A logger that drops every entry.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Record an entry, degrading to a warning on failure.
    pub fn record(&self, entry: &FeedbackEntry) {
        if !self.is_enabled() {
            return;
        }
        match self.try_record(entry) {
            Ok(path) => tracing::debug!(
                project_id = %entry.project_id,
                unit_id = %entry.unit_id,
                file = %path.display(),
                "Recorded feedback entry"
            ),
            Err(e) => tracing::warn!(
                project_id = %entry.project_id,
                unit_id = %entry.unit_id,
                error = %format!("{:#}", e),
                "Failed to record feedback entry"
            ),
        }
    }

    /// Append an entry and return the file it was written to.
    pub fn try_record(&self, entry: &FeedbackEntry) -> Result<PathBuf> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("feedback logging is disabled"))?;
        let line = serde_json::to_string(entry).context("Failed to serialize feedback entry")?;

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("feedback write lock poisoned"))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create feedback directory {}", dir.display()))?;
        let path = dir.join(feedback_file_name(entry.timestamp));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open feedback log {}", path.display()))?;
        writeln!(file, "{}", line).context("Failed to append feedback entry")?;
        Ok(path)
    }
}

/// Read every entry from every monthly file in `dir`, oldest file first.
///
/// Lines that fail to parse are skipped with a warning.
pub fn read_entries(dir: &Path) -> Result<Vec<FeedbackEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read feedback directory {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("production_") && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();

    let mut entries = Vec::new();
    for path in files {
        let file = fs::File::open(&path)
            .with_context(|| format!("Failed to open feedback log {}", path.display()))?;
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("Failed to read feedback log line")?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedbackEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(
                    file = %path.display(),
                    line = idx + 1,
                    error = %e,
                    "Skipping malformed feedback entry"
                ),
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadforge_common::{Rating, UnitTarget};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn entry(unit_id: &str) -> FeedbackEntry {
        let mut entry = FeedbackEntry::new(
            Uuid::new_v4(),
            "tester",
            UnitTarget::OverallModel,
            unit_id,
            "a cube",
            "result = box(10)",
        );
        entry.rating = Some(Rating::Good);
        entry.outcome = "success".to_string();
        entry.success = true;
        entry
    }

    #[test]
    fn test_file_name_is_monthly() {
        let at = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(feedback_file_name(at), "production_202603.jsonl");
    }

    #[test]
    fn test_record_appends_lines() {
        let dir = tempdir().unwrap();
        let logger = FeedbackLogger::new(&dir.path().join("feedback"));
        let first = logger.try_record(&entry("u1")).unwrap();
        let second = logger.try_record(&entry("u2")).unwrap();
        assert_eq!(first, second);

        let content = fs::read_to_string(&first).unwrap();
        assert_eq!(content.lines().count(), 2);

        let entries = read_entries(&dir.path().join("feedback")).unwrap();
        let ids: Vec<&str> = entries.iter().map(|e| e.unit_id.as_str()).collect();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[test]
    fn test_record_failure_does_not_panic() {
        let dir = tempdir().unwrap();
        // A regular file where the directory should be makes every write fail.
        let blocker = dir.path().join("feedback");
        fs::write(&blocker, "not a directory").unwrap();
        let logger = FeedbackLogger::new(&blocker);
        assert!(logger.try_record(&entry("u1")).is_err());
        logger.record(&entry("u1"));
    }

    #[test]
    fn test_disabled_logger_writes_nothing() {
        let logger = FeedbackLogger::disabled();
        assert!(!logger.is_enabled());
        logger.record(&entry("u1"));
        assert!(logger.try_record(&entry("u1")).is_err());
    }

    #[test]
    fn test_read_entries_skips_malformed_lines() {
        let dir = tempdir().unwrap();
        let logger = FeedbackLogger::new(dir.path());
        let path = logger.try_record(&entry("good")).unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let entries = read_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].unit_id, "good");
    }

    #[test]
    fn test_concurrent_records_do_not_interleave() {
        let dir = tempdir().unwrap();
        let logger = Arc::new(FeedbackLogger::new(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let logger = Arc::clone(&logger);
                std::thread::spawn(move || {
                    for j in 0..10 {
                        logger.record(&entry(&format!("u{}_{}", i, j)));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(read_entries(dir.path()).unwrap().len(), 80);
    }

    #[test]
    fn test_read_entries_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        assert!(read_entries(&dir.path().join("absent")).unwrap().is_empty());
    }
}
