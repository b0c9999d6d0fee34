//! Error-intake tailer.
//!
//! Workers append one JSON [`IncidentMessage`] per line to the intake file;
//! the tailer tracks its offset and surfaces only new messages on each poll.
//! This is the file-backed stand-in for the error-intake queue — a broker
//! adapter would feed the same messages through the identical path.

use std::fs;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::Context;
use tracing::debug;

use crate::types::IncidentMessage;

/// Tails the intake file, parsing new lines into incident messages.
///
/// Tracks file position to avoid re-reading old lines on each poll; a file
/// that shrank (rotation/truncation) resets the offset.
pub struct IntakeTailer {
    path: PathBuf,
    last_offset: u64,
}

impl IntakeTailer {
    /// Create a tailer pointed at the given intake file.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_offset: 0,
        }
    }

    /// Poll for new incident messages since the last call.
    ///
    /// Lines that fail to parse are counted and skipped; a missing file
    /// yields an empty batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the intake file exists but cannot be read.
    pub fn poll(&mut self) -> anyhow::Result<Vec<IncidentMessage>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = fs::File::open(&self.path)
            .with_context(|| format!("failed to open intake file {}", self.path.display()))?;

        let file_len = file
            .metadata()
            .with_context(|| format!("failed to stat intake file {}", self.path.display()))?
            .len();

        if file_len < self.last_offset {
            // Truncated or rotated underneath us.
            self.last_offset = 0;
        }
        if file_len == self.last_offset {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(self.last_offset))
            .with_context(|| format!("failed to seek intake file {}", self.path.display()))?;

        let mut messages = Vec::new();
        let mut skipped: u32 = 0;
        let mut line = String::new();
        loop {
            line.clear();
            let read = reader
                .read_line(&mut line)
                .with_context(|| format!("failed to read intake file {}", self.path.display()))?;
            if read == 0 {
                break;
            }
            self.last_offset = self
                .last_offset
                .saturating_add(u64::try_from(read).unwrap_or(0));

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<IncidentMessage>(trimmed) {
                Ok(message) => messages.push(message),
                Err(_) => skipped = skipped.saturating_add(1),
            }
        }

        if skipped > 0 {
            debug!(skipped, "skipped malformed intake lines");
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_line(task_id: &str) -> String {
        serde_json::json!({
            "error_text": "ModuleNotFoundError: No module named 'requests'",
            "task_id": task_id,
            "worker_type": "ingest",
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "reply_queue": "tasks.ingest",
        })
        .to_string()
    }

    #[test]
    fn poll_reads_only_new_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("intake.jsonl");
        let mut tailer = IntakeTailer::new(path.clone());

        let mut file = fs::File::create(&path).expect("create");
        writeln!(file, "{}", sample_line("t-1")).expect("write");
        file.sync_all().expect("sync");

        let first = tailer.poll().expect("poll");
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task_id, "t-1");

        let second = tailer.poll().expect("poll");
        assert!(second.is_empty());

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        writeln!(file, "{}", sample_line("t-2")).expect("write");
        file.sync_all().expect("sync");

        let third = tailer.poll().expect("poll");
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].task_id, "t-2");
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("intake.jsonl");
        let mut tailer = IntakeTailer::new(path.clone());

        let mut file = fs::File::create(&path).expect("create");
        writeln!(file, "not json at all").expect("write");
        writeln!(file, "{}", sample_line("t-3")).expect("write");
        file.sync_all().expect("sync");

        let messages = tailer.poll().expect("poll");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, "t-3");
    }

    #[test]
    fn missing_file_is_empty_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut tailer = IntakeTailer::new(dir.path().join("absent.jsonl"));
        assert!(tailer.poll().expect("poll").is_empty());
    }

    #[test]
    fn truncation_resets_offset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("intake.jsonl");
        let mut tailer = IntakeTailer::new(path.clone());

        let mut file = fs::File::create(&path).expect("create");
        writeln!(file, "{}", sample_line("t-4")).expect("write");
        drop(file);
        assert_eq!(tailer.poll().expect("poll").len(), 1);

        // Rewrite the file shorter than the previous offset.
        let mut file = fs::File::create(&path).expect("truncate");
        writeln!(file, "{}", sample_line("t-5")).expect("write");
        drop(file);

        let messages = tailer.poll().expect("poll");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].task_id, "t-5");
    }
}
