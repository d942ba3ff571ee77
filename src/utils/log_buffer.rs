use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::sync::{TransferResult, TransferStatus};

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: i64,
    pub level: String,
    pub message: String,
    pub path: Option<String>,
}

/// Ring buffer of recent session log lines, oldest dropped first.
#[derive(Clone)]
pub struct LogBuffer {
    buffer: Arc<Mutex<VecDeque<LogEntry>>>,
    max_entries: usize,
}

impl LogBuffer {
    pub fn new(max_entries: usize) -> Self {
        let max_entries = max_entries.max(1);
        Self {
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(max_entries))),
            max_entries,
        }
    }

    pub fn add_log(&self, level: &str, message: String, path: Option<String>) {
        let entry = LogEntry {
            timestamp: Utc::now().timestamp(),
            level: level.to_string(),
            message,
            path,
        };

        let mut buffer = self.buffer.lock();
        if buffer.len() >= self.max_entries {
            buffer.pop_front();
        }
        buffer.push_back(entry);
    }

    pub fn add_result(&self, result: &TransferResult) {
        let level = match result.status {
            TransferStatus::Updated => "success",
            TransferStatus::Skipped => "info",
            TransferStatus::Cancelled => "warning",
            TransferStatus::Error => "error",
        };
        self.add_log(level, result.message.clone(), Some(result.path.to_string_lossy().to_string()));
    }

    /// The newest `limit` entries (all when `None`), oldest first.
    pub fn get_logs(&self, limit: Option<usize>) -> Vec<LogEntry> {
        let buffer = self.buffer.lock();
        let skip = limit.map_or(0, |n| buffer.len().saturating_sub(n));
        buffer.iter().skip(skip).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_entries_are_dropped() {
        let logs = LogBuffer::new(3);
        for i in 0..5 {
            logs.add_log("info", format!("line {}", i), None);
        }
        let all = logs.get_logs(None);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].message, "line 2");

        let last = logs.get_logs(Some(1));
        assert_eq!(last[0].message, "line 4");
    }

    #[test]
    fn test_result_levels() {
        let logs = LogBuffer::new(10);
        logs.add_result(&TransferResult::error("/x", "denied"));
        logs.add_result(&TransferResult::updated("/y"));
        let entries = logs.get_logs(None);
        assert_eq!(entries[0].level, "error");
        assert_eq!(entries[1].level, "success");
        assert_eq!(entries[1].path.as_deref(), Some("/y"));
    }
}
