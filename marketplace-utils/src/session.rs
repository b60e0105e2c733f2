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

//! Per-session state shared by every hook invocation.
//!
//! The record is one JSON document. Mutations are read-modify-write under
//! the advisory lock:
//!
//! ```text
//! acquire lock -> read (missing/corrupt = empty) -> mutate -> write -> release
//! ```
//!
//! Writes replace the file atomically (temp file + rename), so readers that
//! skip the lock see either the old or the new document, never a torn one.
//!
//! When no locking primitive is available, replacing the whole document
//! would let concurrent writers overwrite each other. In that mode each
//! mutation is appended as one JSON line to a pending log next to the
//! document instead, and every read replays the pending lines on top of it.
//! The next locked mutation folds them back into the document. A lock that
//! is merely contended past its bound is not degraded mode: mutations fail
//! with [`HookError::LockTimeout`].
//!
//! Recommendation flags are monotonic: once shown, a flag only goes away
//! with [`SessionStore::init`] or [`SessionStore::reset`].

use crate::config::UNKNOWN;
use crate::error::{HookError, HookResult};
use crate::journal::{ErrorJournal, ErrorKind};
use crate::lock::{with_lock, LockGuard, LockProvider};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The persisted session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(default)]
    pub session_id: String,
    /// Plugin that last initialized the record. Diagnostic only.
    #[serde(default)]
    pub plugin: String,
    /// plugin -> recommendation type -> already shown
    #[serde(default)]
    pub flags: BTreeMap<String, BTreeMap<String, bool>>,
    /// plugin -> key -> value
    #[serde(default)]
    pub values: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, plugin: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            plugin: plugin.into(),
            flags: BTreeMap::new(),
            values: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_shown(&self, plugin: &str, recommendation: &str) -> bool {
        self.flags
            .get(plugin)
            .and_then(|flags| flags.get(recommendation))
            .copied()
            .unwrap_or(false)
    }

    /// Set the flag; true when it was not set before.
    pub fn mark_shown(&mut self, plugin: &str, recommendation: &str) -> bool {
        let flag = self
            .flags
            .entry(plugin.to_string())
            .or_default()
            .entry(recommendation.to_string())
            .or_insert(false);
        let first = !*flag;
        *flag = true;
        first
    }

    pub fn get(&self, plugin: &str, key: &str) -> Option<&Value> {
        self.values.get(plugin).and_then(|values| values.get(key))
    }

    pub fn set(&mut self, plugin: &str, key: &str, value: Value) {
        self.values
            .entry(plugin.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }
}

/// One mutation, as written to the pending log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum SessionOp {
    Set {
        plugin: String,
        key: String,
        value: Value,
    },
    MarkShown {
        plugin: String,
        recommendation: String,
    },
}

impl SessionOp {
    /// Apply to `record`; true when the record changed.
    fn apply(&self, record: &mut SessionRecord) -> bool {
        match self {
            SessionOp::Set { plugin, key, value } => {
                if record.get(plugin, key) == Some(value) {
                    return false;
                }
                record.set(plugin, key, value.clone());
                true
            }
            SessionOp::MarkShown {
                plugin,
                recommendation,
            } => record.mark_shown(plugin, recommendation),
        }
    }
}

/// Raw storage for the session document.
pub trait SessionBackend: Send + Sync {
    /// Resource name the lock is scoped to.
    fn resource(&self) -> &Path;

    /// Current bytes, `None` when nothing has been stored.
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the stored bytes.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Drop the stored document. Removing nothing is not an error.
    fn remove(&self) -> io::Result<()>;

    /// Append one line to the pending log. Each call must land as a whole.
    fn append_pending(&self, line: &[u8]) -> io::Result<()>;

    /// Pending log contents, `None` when there is none.
    fn read_pending(&self) -> io::Result<Option<Vec<u8>>>;

    /// Drop the pending log. Removing nothing is not an error.
    fn clear_pending(&self) -> io::Result<()>;
}

/// Session document on the local filesystem.
///
/// The pending log lives at `<path>.pending`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
    pending: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut pending: OsString = path.as_os_str().to_owned();
        pending.push(".pending");
        Self {
            path,
            pending: PathBuf::from(pending),
        }
    }

    pub fn pending_path(&self) -> &Path {
        &self.pending
    }
}

fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

fn remove_optional(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

impl SessionBackend for FileBackend {
    fn resource(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.path)
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        remove_optional(&self.path)
    }

    fn append_pending(&self, line: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.pending.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // O_APPEND with one write per line: concurrent appenders never
        // overwrite each other.
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.pending)?;
        file.write_all(line)
    }

    fn read_pending(&self) -> io::Result<Option<Vec<u8>>> {
        read_optional(&self.pending)
    }

    fn clear_pending(&self) -> io::Result<()> {
        remove_optional(&self.pending)
    }
}

/// In-memory backend. Clones share the same document.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    resource: PathBuf,
    data: Arc<Mutex<Option<Vec<u8>>>>,
    pending: Arc<Mutex<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new(resource: impl Into<PathBuf>) -> Self {
        Self {
            resource: resource.into(),
            data: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Overwrite the raw bytes, bypassing serialization.
    pub fn put_raw(&self, data: &[u8]) {
        *self.data.lock() = Some(data.to_vec());
    }
}

impl SessionBackend for MemoryBackend {
    fn resource(&self) -> &Path {
        &self.resource
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.data.lock().clone())
    }

    fn write(&self, data: &[u8]) -> io::Result<()> {
        *self.data.lock() = Some(data.to_vec());
        Ok(())
    }

    fn remove(&self) -> io::Result<()> {
        *self.data.lock() = None;
        Ok(())
    }

    fn append_pending(&self, line: &[u8]) -> io::Result<()> {
        self.pending.lock().extend_from_slice(line);
        Ok(())
    }

    fn read_pending(&self) -> io::Result<Option<Vec<u8>>> {
        let pending = self.pending.lock();
        Ok((!pending.is_empty()).then(|| pending.clone()))
    }

    fn clear_pending(&self) -> io::Result<()> {
        self.pending.lock().clear();
        Ok(())
    }
}

/// Handle on one session's record.
pub struct SessionStore {
    session_id: String,
    backend: Box<dyn SessionBackend>,
    lock: Arc<dyn LockProvider>,
    journal: Option<Arc<dyn ErrorJournal>>,
    degraded_reported: AtomicBool,
}

impl SessionStore {
    pub fn new(
        session_id: impl Into<String>,
        backend: Box<dyn SessionBackend>,
        lock: Arc<dyn LockProvider>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            backend,
            lock,
            journal: None,
            degraded_reported: AtomicBool::new(false),
        }
    }

    /// Report corrupt documents and lock trouble to `journal` as well as to
    /// `tracing`.
    pub fn with_journal(mut self, journal: Arc<dyn ErrorJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// (Re)create the record for `plugin`, clearing all flags and values.
    pub fn init(&self, plugin: &str) -> HookResult<()> {
        let _guard = self.acquire()?;
        // Only to surface corruption diagnostics; the old content is discarded.
        let _ = self.load();
        self.store(&SessionRecord::new(self.session_id.clone(), plugin))?;
        self.clear_pending()
    }

    /// Unlocked read; the value may be stale.
    pub fn get(&self, plugin: &str, key: &str) -> Option<Value> {
        self.load().get(plugin, key).cloned()
    }

    pub fn set(&self, plugin: &str, key: &str, value: Value) -> HookResult<()> {
        self.mutate(SessionOp::Set {
            plugin: plugin.to_string(),
            key: key.to_string(),
            value,
        })
        .map(|_| ())
    }

    /// Locked read. A lock that cannot be had in time still yields the
    /// current document.
    pub fn has_shown(&self, plugin: &str, recommendation: &str) -> bool {
        with_lock(self.lock.as_ref(), self.backend.resource(), || {
            self.load().has_shown(plugin, recommendation)
        })
    }

    pub fn mark_shown(&self, plugin: &str, recommendation: &str) -> HookResult<()> {
        self.mark_shown_once(plugin, recommendation).map(|_| ())
    }

    /// Test-and-set in a single locked read-modify-write. Returns true for
    /// exactly one caller per session and key while locking works. Without
    /// a locking primitive, racing callers may each see true.
    pub fn mark_shown_once(&self, plugin: &str, recommendation: &str) -> HookResult<bool> {
        self.mutate(SessionOp::MarkShown {
            plugin: plugin.to_string(),
            recommendation: recommendation.to_string(),
        })
    }

    /// Delete the record.
    pub fn reset(&self) -> HookResult<()> {
        let _guard = self.acquire()?;
        self.backend.remove().map_err(|err| self.store_error(err))?;
        self.clear_pending()
    }

    /// Unlocked view of the whole record, for diagnostics.
    pub fn snapshot(&self) -> SessionRecord {
        self.load()
    }

    /// Lock for a read-modify-write. Contention past the bound is an error;
    /// a missing primitive is reported once and let through.
    fn acquire(&self) -> HookResult<LockGuard> {
        let guard = self.lock.acquire(self.backend.resource());
        if guard.is_timed_out() {
            let err = HookError::LockTimeout {
                path: self.backend.resource().to_path_buf(),
            };
            self.journal_record(ErrorKind::LockUnavailable, &err.to_string());
            return Err(err);
        }
        if guard.is_degraded() && !self.degraded_reported.swap(true, Ordering::SeqCst) {
            self.journal_record(
                ErrorKind::LockUnavailable,
                &format!(
                    "{} provider has no lock for {}; writes go to the pending log",
                    self.lock.name(),
                    self.backend.resource().display()
                ),
            );
        }
        Ok(guard)
    }

    fn mutate(&self, op: SessionOp) -> HookResult<bool> {
        let guard = self.acquire()?;
        let mut record = self.load();
        if !op.apply(&mut record) {
            return Ok(false);
        }

        if guard.is_degraded() {
            let mut line = serde_json::to_vec(&op)?;
            line.push(b'\n');
            self.backend
                .append_pending(&line)
                .map_err(|err| self.store_error(err))?;
        } else {
            record.updated_at = Utc::now();
            self.store(&record)?;
            // The document now carries everything the pending log held.
            self.clear_pending()?;
        }
        Ok(true)
    }

    /// Read the record with any pending mutations replayed on top.
    fn load(&self) -> SessionRecord {
        let mut record = self.load_document();
        match self.backend.read_pending() {
            Ok(Some(pending)) => {
                for line in pending.split(|b| *b == b'\n') {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<SessionOp>(line) {
                        Ok(op) => {
                            op.apply(&mut record);
                        }
                        Err(err) => tracing::debug!(
                            resource = %self.backend.resource().display(),
                            error = %err,
                            "Skipping torn pending session line"
                        ),
                    }
                }
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(
                resource = %self.backend.resource().display(),
                error = %err,
                "Pending session log unreadable, ignoring it"
            ),
        }
        record
    }

    /// Read the document. Missing, empty, unreadable or invalid documents all
    /// come back as a fresh record.
    fn load_document(&self) -> SessionRecord {
        let fresh = || SessionRecord::new(self.session_id.clone(), UNKNOWN);
        let bytes = match self.backend.read() {
            Ok(Some(bytes)) if !bytes.iter().all(u8::is_ascii_whitespace) => bytes,
            Ok(_) => return fresh(),
            Err(err) => {
                tracing::warn!(
                    resource = %self.backend.resource().display(),
                    error = %err,
                    "Session state unreadable, treating as uninitialized"
                );
                return fresh();
            }
        };

        match serde_json::from_slice::<SessionRecord>(&bytes) {
            Ok(mut record) => {
                if record.session_id.is_empty() {
                    record.session_id = self.session_id.clone();
                }
                record
            }
            Err(err) => {
                tracing::warn!(
                    resource = %self.backend.resource().display(),
                    error = %err,
                    "Session state corrupt, treating as uninitialized"
                );
                self.journal_record(ErrorKind::CorruptState, &err.to_string());
                fresh()
            }
        }
    }

    fn store(&self, record: &SessionRecord) -> HookResult<()> {
        let data = serde_json::to_vec_pretty(record)?;
        self.backend
            .write(&data)
            .map_err(|err| self.store_error(err))
    }

    fn clear_pending(&self) -> HookResult<()> {
        self.backend
            .clear_pending()
            .map_err(|err| self.store_error(err))
    }

    fn journal_record(&self, kind: ErrorKind, detail: &str) {
        if let Some(journal) = &self.journal {
            journal.record("session", kind, detail);
        }
    }

    fn store_error(&self, err: io::Error) -> HookError {
        HookError::SessionStore {
            path: self.backend.resource().to_path_buf(),
            message: err.to_string(),
        }
    }
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStore")
            .field("session_id", &self.session_id)
            .field("resource", &self.backend.resource())
            .field("lock", &self.lock.name())
            .finish()
    }
}
