// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Session log shared by every hook invocation of a session.
//!
//! Lines look like
//!
//! ```text
//! [2025-06-01T12:00:00Z] [nextjs] [WARN] [recommend] middleware.ts matched
//! ```
//!
//! and are appended whole under the advisory lock, so concurrent hooks never
//! interleave partial lines. Internal diagnostics about the logger itself go
//! through `tracing` to stderr instead.

use crate::lock::{with_lock, LockProvider};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Component used when the caller does not name one.
pub const DEFAULT_COMPONENT: &str = "main";

/// Log severity, lowest first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    #[default]
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }

    /// Strict parse, case-insensitive. `WARNING` is accepted for `WARN`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            "FATAL" => Some(LogLevel::Fatal),
            _ => None,
        }
    }

    /// Unknown names fall back to `DEBUG` with a diagnostic.
    pub fn parse_lenient(name: &str) -> Self {
        Self::parse(name).unwrap_or_else(|| {
            tracing::warn!(level = name, "Unknown log level, treating as DEBUG");
            LogLevel::Debug
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One formatted log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub plugin: String,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(plugin: &str, level: LogLevel, component: Option<&str>, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            plugin: plugin.to_string(),
            level,
            component: component.unwrap_or(DEFAULT_COMPONENT).to_string(),
            message: message.to_string(),
        }
    }

    /// Render as a single line, newline included.
    pub fn to_line(&self) -> String {
        format!(
            "[{}] [{}] [{}] [{}] {}\n",
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.plugin,
            self.level,
            self.component,
            escape_line_breaks(&self.message)
        )
    }
}

fn escape_line_breaks(message: &str) -> String {
    message.replace('\r', "\\r").replace('\n', "\\n")
}

/// Anything plugin logic can log to.
pub trait LoggingSink: Send + Sync {
    /// Whether a message at `level` would be written.
    fn enabled(&self, level: LogLevel) -> bool;

    /// Append a message. Never fails; write problems are swallowed.
    fn log(&self, level: LogLevel, message: &str, component: Option<&str>);

    fn debug(&self, component: &str, message: &str) {
        self.log(LogLevel::Debug, message, Some(component));
    }

    fn info(&self, component: &str, message: &str) {
        self.log(LogLevel::Info, message, Some(component));
    }

    fn warn(&self, component: &str, message: &str) {
        self.log(LogLevel::Warn, message, Some(component));
    }

    fn error(&self, component: &str, message: &str) {
        self.log(LogLevel::Error, message, Some(component));
    }

    fn fatal(&self, component: &str, message: &str) {
        self.log(LogLevel::Fatal, message, Some(component));
    }
}

/// Where session log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stderr,
}

impl LogTarget {
    /// `-` selects stderr.
    pub fn from_path(path: &Path) -> Self {
        if path.as_os_str() == "-" {
            LogTarget::Stderr
        } else {
            LogTarget::File(path.to_path_buf())
        }
    }
}

/// Lock-protected, level-filtered file logger.
pub struct SessionLogger {
    target: LogTarget,
    plugin: String,
    min_level: LogLevel,
    lock: Arc<dyn LockProvider>,
}

impl SessionLogger {
    pub fn new(
        target: LogTarget,
        plugin: impl Into<String>,
        min_level: LogLevel,
        lock: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            target,
            plugin: plugin.into(),
            min_level,
            lock,
        }
    }

    pub fn target(&self) -> &LogTarget {
        &self.target
    }

    pub fn min_level(&self) -> LogLevel {
        self.min_level
    }

    fn append(&self, line: &str) {
        match &self.target {
            LogTarget::Stderr => {
                let mut stderr = std::io::stderr().lock();
                // Reader gone: drop the line.
                let _ = stderr.write_all(line.as_bytes());
            }
            LogTarget::File(path) => {
                let result = with_lock(self.lock.as_ref(), path, || append_to_file(path, line));
                if let Err(err) = result {
                    tracing::debug!(
                        path = %path.display(),
                        error = %err,
                        "Dropped session log line"
                    );
                }
            }
        }
    }
}

impl LoggingSink for SessionLogger {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    fn log(&self, level: LogLevel, message: &str, component: Option<&str>) {
        if !self.enabled(level) {
            return;
        }
        let entry = LogEntry::new(&self.plugin, level, component, message);
        self.append(&entry.to_line());
    }
}

/// Append `data` in a single write. Used by the logger and the journal.
pub(crate) fn append_to_file(path: &Path, data: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(data.as_bytes())
}

/// Captures entries in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    min_level: LogLevel,
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySink {
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            min_level,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }
}

impl LoggingSink for MemorySink {
    fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    fn log(&self, level: LogLevel, message: &str, component: Option<&str>) {
        if self.enabled(level) {
            self.entries
                .lock()
                .push(LogEntry::new("memory", level, component, message));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLockProvider;
    use std::time::Duration;

    fn file_logger(path: &Path, level: LogLevel) -> SessionLogger {
        SessionLogger::new(
            LogTarget::File(path.to_path_buf()),
            "nextjs",
            level,
            Arc::new(FileLockProvider::new(Duration::from_secs(2))),
        )
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Warn < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("info"), Some(LogLevel::Info));
        assert_eq!(LogLevel::parse("Warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("verbose"), None);
        assert_eq!(LogLevel::parse_lenient("verbose"), LogLevel::Debug);
    }

    #[test]
    fn test_filtered_message_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let logger = file_logger(&path, LogLevel::Error);

        logger.log(LogLevel::Warn, "not interesting", Some("scanner"));
        assert!(!path.exists());

        logger.log(LogLevel::Error, "disk on fire", Some("scanner"));
        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("disk on fire"));
        assert!(lines[0].contains("[nextjs]"));
        assert!(lines[0].contains("[ERROR]"));
        assert!(lines[0].contains("[scanner]"));
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains('Z'));
    }

    #[test]
    fn test_multiline_message_is_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let logger = file_logger(&path, LogLevel::Debug);

        logger.info("main", "first\nsecond");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains("first\\nsecond"));
    }

    #[test]
    fn test_default_component() {
        let entry = LogEntry::new("p", LogLevel::Info, None, "m");
        assert!(entry.to_line().contains("[main]"));
    }

    #[test]
    fn test_missing_target_directory_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        let logger = file_logger(&blocker.join("nested.log"), LogLevel::Debug);

        // Parent is a regular file: the write fails and must not panic.
        logger.fatal("main", "still alive");
    }

    #[test]
    fn test_memory_sink_filters() {
        let sink = MemorySink::new(LogLevel::Info);
        sink.debug("c", "hidden");
        sink.info("c", "shown");
        let entries = sink.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "shown");
    }

    #[test]
    fn test_log_target_from_path() {
        assert_eq!(LogTarget::from_path(Path::new("-")), LogTarget::Stderr);
        assert_eq!(
            LogTarget::from_path(Path::new("/tmp/a.log")),
            LogTarget::File(PathBuf::from("/tmp/a.log"))
        );
    }
}
