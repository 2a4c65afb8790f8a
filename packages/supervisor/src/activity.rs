// ABOUTME: User-facing activity log: a bounded ring buffer of timestamped entries
// ABOUTME: Every entry is also forwarded to tracing at the matching level

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Keep only the last 1000 entries to prevent memory issues
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub project: Option<String>,
    pub message: String,
}

/// Sink accepting `(message, severity)` from every lifecycle component.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, project: Option<&str>, message: &str);

    fn info(&self, project: Option<&str>, message: &str) {
        self.log(LogLevel::Info, project, message);
    }

    fn warning(&self, project: Option<&str>, message: &str) {
        self.log(LogLevel::Warning, project, message);
    }

    fn error(&self, project: Option<&str>, message: &str) {
        self.log(LogLevel::Error, project, message);
    }
}

/// Default [`LogSink`]: in-memory ring buffer plus tracing.
#[derive(Debug)]
pub struct ActivityLog {
    entries: Mutex<VecDeque<LogEntry>>,
    capacity: usize,
}

impl Default for ActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(DEFAULT_LOG_CAPACITY))),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<LogEntry>> {
        // A panic while holding the lock leaves the buffer usable
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read entries back.
    ///
    /// # Arguments
    ///
    /// * `since` - Only entries strictly newer than this timestamp
    /// * `filter` - Case-insensitive substring matched against message and project
    /// * `limit` - Keep only the most recent `limit` entries after filtering
    ///
    /// # Returns
    ///
    /// Matching entries, oldest first.
    pub fn entries(
        &self,
        since: Option<DateTime<Utc>>,
        filter: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<LogEntry> {
        let needle = filter.map(|f| f.to_lowercase());
        let entries = self.lock();

        let mut matched: Vec<LogEntry> = entries
            .iter()
            .filter(|entry| since.map_or(true, |since| entry.timestamp > since))
            .filter(|entry| match &needle {
                Some(needle) => {
                    entry.message.to_lowercase().contains(needle)
                        || entry
                            .project
                            .as_deref()
                            .is_some_and(|p| p.to_lowercase().contains(needle))
                }
                None => true,
            })
            .cloned()
            .collect();

        if let Some(max_count) = limit {
            if matched.len() > max_count {
                matched = matched.split_off(matched.len() - max_count);
            }
        }

        matched
    }

    pub fn clear(&self) {
        self.lock().clear();
        info!("Cleared activity log");
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl LogSink for ActivityLog {
    fn log(&self, level: LogLevel, project: Option<&str>, message: &str) {
        match (level, project) {
            (LogLevel::Info, Some(project)) => info!(project, "{}", message),
            (LogLevel::Info, None) => info!("{}", message),
            (LogLevel::Warning, Some(project)) => warn!(project, "{}", message),
            (LogLevel::Warning, None) => warn!("{}", message),
            (LogLevel::Error, Some(project)) => error!(project, "{}", message),
            (LogLevel::Error, None) => error!("{}", message),
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            project: project.map(str::to_string),
            message: message.to_string(),
        };

        let mut entries = self.lock();
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let log = ActivityLog::with_capacity(3);
        for i in 0..5 {
            log.info(None, &format!("line {}", i));
        }
        let messages: Vec<String> = log
            .entries(None, None, None)
            .into_iter()
            .map(|e| e.message)
            .collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_filter_and_limit() {
        let log = ActivityLog::new();
        log.info(Some("web"), "Starting web");
        log.warning(Some("api"), "npm WARN deprecated");
        log.error(Some("web"), "Exited with code 1");

        let web = log.entries(None, Some("WEB"), None);
        assert_eq!(web.len(), 2);

        let last = log.entries(None, None, Some(1));
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].level, LogLevel::Error);
    }

    #[test]
    fn test_since_and_clear() {
        let log = ActivityLog::new();
        log.info(None, "old");
        let cutoff = log.entries(None, None, None)[0].timestamp;
        std::thread::sleep(std::time::Duration::from_millis(5));
        log.info(None, "new");

        let recent = log.entries(Some(cutoff), None, None);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].message, "new");

        log.clear();
        assert!(log.is_empty());
    }
}
