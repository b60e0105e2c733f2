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

//! Error journal: one JSON object per line, never filtered by log level.
//!
//! The session log is for humans and honours `MARKETPLACE_LOG_LEVEL`. The
//! journal is for post-mortems, so every failure lands here regardless of
//! verbosity.

use crate::error::HookResult;
use crate::lock::{with_lock, LockProvider};
use crate::logger::append_to_file;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Failure categories recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PluginFailure,
    PluginPanic,
    InvalidBlock,
    FailOpenOverride,
    Truncation,
    MalformedInput,
    CorruptState,
    LockUnavailable,
    IoFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PluginFailure => "plugin_failure",
            ErrorKind::PluginPanic => "plugin_panic",
            ErrorKind::InvalidBlock => "invalid_block",
            ErrorKind::FailOpenOverride => "fail_open_override",
            ErrorKind::Truncation => "truncation",
            ErrorKind::MalformedInput => "malformed_input",
            ErrorKind::CorruptState => "corrupt_state",
            ErrorKind::LockUnavailable => "lock_unavailable",
            ErrorKind::IoFailure => "io_failure",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(name.trim().to_string())).ok()
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One self-contained journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub plugin: String,
    pub event: String,
    pub pid: u32,
    pub context: String,
    pub kind: ErrorKind,
    pub detail: String,
}

/// Identity stamped on every record written by one journal handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalScope {
    pub session_id: String,
    pub plugin: String,
    pub event: String,
}

impl JournalScope {
    pub fn new(
        session_id: impl Into<String>,
        plugin: impl Into<String>,
        event: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            plugin: plugin.into(),
            event: event.into(),
        }
    }

    fn entry(&self, context: &str, kind: ErrorKind, detail: &str) -> JournalEntry {
        JournalEntry {
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            plugin: self.plugin.clone(),
            event: self.event.clone(),
            pid: std::process::id(),
            context: context.to_string(),
            kind,
            detail: detail.to_string(),
        }
    }
}

/// Append-only failure record.
pub trait ErrorJournal: Send + Sync {
    /// Append one record. Never fails; write problems go to `tracing`.
    fn record(&self, context: &str, kind: ErrorKind, detail: &str);

    /// Every record written so far, oldest first.
    fn read_all(&self) -> HookResult<Vec<JournalEntry>>;
}

/// JSON-lines journal file guarded by the advisory lock.
pub struct FileJournal {
    path: PathBuf,
    scope: JournalScope,
    lock: Arc<dyn LockProvider>,
}

impl FileJournal {
    pub fn new(path: impl Into<PathBuf>, scope: JournalScope, lock: Arc<dyn LockProvider>) -> Self {
        Self {
            path: path.into(),
            scope,
            lock,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ErrorJournal for FileJournal {
    fn record(&self, context: &str, kind: ErrorKind, detail: &str) {
        let entry = self.scope.entry(context, kind, detail);
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode journal entry");
                return;
            }
        };
        line.push('\n');

        let result = with_lock(self.lock.as_ref(), &self.path, || {
            append_to_file(&self.path, &line)
        });
        if let Err(err) = result {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                kind = %kind,
                "Dropped journal entry"
            );
        }
    }

    fn read_all(&self) -> HookResult<Vec<JournalEntry>> {
        read_journal(&self.path)
    }
}

/// Parse a journal file. A missing file is an empty journal; lines that do
/// not parse (a torn tail after a kill) are skipped.
pub fn read_journal(path: &Path) -> HookResult<Vec<JournalEntry>> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let mut entries = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::debug!(line = index + 1, error = %err, "Skipping unreadable journal line")
            }
        }
    }
    Ok(entries)
}

/// Journal kept in memory.
#[derive(Debug)]
pub struct MemoryJournal {
    scope: JournalScope,
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    pub fn new(scope: JournalScope) -> Self {
        Self {
            scope,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }
}

impl Default for MemoryJournal {
    fn default() -> Self {
        Self::new(JournalScope::new("memory", "unknown", "unknown"))
    }
}

impl ErrorJournal for MemoryJournal {
    fn record(&self, context: &str, kind: ErrorKind, detail: &str) {
        self.entries
            .lock()
            .push(self.scope.entry(context, kind, detail));
    }

    fn read_all(&self) -> HookResult<Vec<JournalEntry>> {
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::FileLockProvider;
    use std::time::Duration;

    fn journal(path: &Path) -> FileJournal {
        FileJournal::new(
            path,
            JournalScope::new("sess-1", "nextjs", "PreToolUse"),
            Arc::new(FileLockProvider::new(Duration::from_secs(2))),
        )
    }

    #[test]
    fn test_record_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let journal = journal(&path);

        journal.record("run", ErrorKind::PluginFailure, "scanner exploded");
        journal.record("respond", ErrorKind::InvalidBlock, "empty message");

        let entries = journal.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, ErrorKind::PluginFailure);
        assert_eq!(entries[0].session_id, "sess-1");
        assert_eq!(entries[0].plugin, "nextjs");
        assert_eq!(entries[0].event, "PreToolUse");
        assert_eq!(entries[0].pid, std::process::id());
        assert_eq!(entries[1].detail, "empty message");
    }

    #[test]
    fn test_missing_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_journal(&dir.path().join("absent.jsonl"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_torn_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("errors.jsonl");
        let journal = journal(&path);
        journal.record("run", ErrorKind::Truncation, "cut");
        append_to_file(&path, "{\"timestamp\":\"2025").unwrap();

        let entries = read_journal(&path).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::FailOpenOverride.as_str(), "fail_open_override");
        assert_eq!(ErrorKind::parse("corrupt_state"), Some(ErrorKind::CorruptState));
        assert_eq!(ErrorKind::parse("nope"), None);
        let json = serde_json::to_string(&ErrorKind::LockUnavailable).unwrap();
        assert_eq!(json, "\"lock_unavailable\"");
    }

    #[test]
    fn test_memory_journal() {
        let journal = MemoryJournal::default();
        journal.record("ctx", ErrorKind::IoFailure, "disk");
        assert_eq!(journal.read_all().unwrap().len(), 1);
    }
}
