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

//! Advisory locking for shared session resources.
//!
//! Every shared file (session record, log, journal) is guarded by a sibling
//! `<file>.lock` taken with `flock(2)` through [`fs2`]. The kernel drops the
//! lock when the owning descriptor is closed, which includes process death by
//! `SIGKILL`, so a killed hook can never leave a lock behind.
//!
//! Acquisition never fails from the caller's point of view; the guard says
//! what was obtained:
//!
//! - exclusive: the caller owns the resource until the guard drops.
//! - degraded: no locking primitive could be used on this resource. The
//!   caller proceeds unsynchronized and the first such fallback per provider
//!   is reported with a warning.
//! - timed out: another holder kept the lock past the configured bound.
//!   Appenders may still write; read-modify-write callers must give up.

use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const INITIAL_BACKOFF: Duration = Duration::from_millis(2);
const MAX_BACKOFF: Duration = Duration::from_millis(50);
/// File in the state directory used to check that `flock` works there.
pub const LOCK_CHECK_FILE: &str = ".marketplace-lock-check";

/// Cross-process mutual exclusion scoped to a named resource.
pub trait LockProvider: Send + Sync {
    /// Acquire the lock for `resource`, waiting up to the provider's bound.
    fn acquire(&self, resource: &Path) -> LockGuard;

    /// Provider name for diagnostics.
    fn name(&self) -> &'static str;

    /// Whether any acquisition so far fell back to unsynchronized access
    /// because the primitive was unavailable. Timeouts do not count.
    fn is_degraded(&self) -> bool;
}

/// Run `body` while holding the lock for `resource`.
///
/// The guard is dropped on every exit path, including unwinding.
pub fn with_lock<T>(provider: &dyn LockProvider, resource: &Path, body: impl FnOnce() -> T) -> T {
    let _guard = provider.acquire(resource);
    body()
}

/// Path of the lock file guarding `resource`.
pub fn lock_path_for(resource: &Path) -> PathBuf {
    let mut name: OsString = resource.as_os_str().to_owned();
    name.push(".lock");
    PathBuf::from(name)
}

/// Held lock. Released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    inner: GuardInner,
}

enum GuardInner {
    File(File),
    InProcess {
        table: Arc<LockTable>,
        resource: PathBuf,
    },
    Unlocked,
    TimedOut,
}

impl LockGuard {
    fn unlocked() -> Self {
        Self {
            inner: GuardInner::Unlocked,
        }
    }

    fn timed_out() -> Self {
        Self {
            inner: GuardInner::TimedOut,
        }
    }

    /// True when the guard actually excludes other holders.
    pub fn is_exclusive(&self) -> bool {
        matches!(
            self.inner,
            GuardInner::File(_) | GuardInner::InProcess { .. }
        )
    }

    /// True when no primitive was available and the caller runs unsynchronized.
    pub fn is_degraded(&self) -> bool {
        matches!(self.inner, GuardInner::Unlocked)
    }

    /// True when another holder kept the lock past the wait bound.
    pub fn is_timed_out(&self) -> bool {
        matches!(self.inner, GuardInner::TimedOut)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &self.inner {
            GuardInner::File(file) => {
                // Closing the descriptor releases the lock anyway.
                let _ = FileExt::unlock(file);
            }
            GuardInner::InProcess { table, resource } => table.release(resource),
            GuardInner::Unlocked | GuardInner::TimedOut => {}
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("exclusive", &self.is_exclusive())
            .field("timed_out", &self.is_timed_out())
            .finish()
    }
}

/// Tracks whether the degraded path has been taken, warning only once.
#[derive(Debug, Default)]
struct DegradedFlag(AtomicBool);

impl DegradedFlag {
    /// A flag whose warning was already emitted elsewhere.
    fn reported() -> Self {
        Self(AtomicBool::new(true))
    }

    fn trip(&self, provider: &'static str, resource: &Path, reason: &str) {
        if !self.0.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                provider,
                resource = %resource.display(),
                reason,
                "Advisory lock unavailable, continuing with unsynchronized writes"
            );
        } else {
            tracing::debug!(
                provider,
                resource = %resource.display(),
                reason,
                "Advisory lock unavailable"
            );
        }
    }

    fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// OS-level advisory lock on `<resource>.lock`.
#[derive(Debug)]
pub struct FileLockProvider {
    timeout: Duration,
    degraded: DegradedFlag,
}

impl FileLockProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            degraded: DegradedFlag::default(),
        }
    }

    fn open_lock_file(resource: &Path) -> std::io::Result<File> {
        let lock_path = lock_path_for(resource);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
    }
}

fn log_timeout(provider: &'static str, resource: &Path, waited: Duration) {
    tracing::warn!(
        provider,
        resource = %resource.display(),
        waited_ms = waited.as_millis() as u64,
        "Timed out waiting for advisory lock"
    );
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl LockProvider for FileLockProvider {
    fn acquire(&self, resource: &Path) -> LockGuard {
        let file = match Self::open_lock_file(resource) {
            Ok(file) => file,
            Err(err) => {
                self.degraded.trip(self.name(), resource, &err.to_string());
                return LockGuard::unlocked();
            }
        };

        let deadline = Instant::now() + self.timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return LockGuard {
                        inner: GuardInner::File(file),
                    }
                }
                Err(err) if is_contended(&err) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log_timeout(self.name(), resource, self.timeout);
                        return LockGuard::timed_out();
                    }
                    std::thread::sleep(backoff.min(deadline - now));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => {
                    self.degraded.trip(self.name(), resource, &err.to_string());
                    return LockGuard::unlocked();
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "flock"
    }

    fn is_degraded(&self) -> bool {
        self.degraded.is_set()
    }
}

/// Pass-through provider used when no locking primitive is available.
#[derive(Debug, Default)]
pub struct UnlockedProvider {
    degraded: DegradedFlag,
}

impl UnlockedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider for a caller that has already warned about the fallback.
    pub fn already_reported() -> Self {
        Self {
            degraded: DegradedFlag::reported(),
        }
    }
}

impl LockProvider for UnlockedProvider {
    fn acquire(&self, resource: &Path) -> LockGuard {
        self.degraded
            .trip(self.name(), resource, "no locking primitive available");
        LockGuard::unlocked()
    }

    fn name(&self) -> &'static str {
        "unlocked"
    }

    fn is_degraded(&self) -> bool {
        self.degraded.is_set()
    }
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl LockTable {
    fn release(&self, resource: &Path) {
        self.held.lock().remove(resource);
        self.released.notify_all();
    }
}

/// Thread-level exclusion inside one process. Pairs with the in-memory
/// session backend.
#[derive(Debug, Clone)]
pub struct InProcessLockProvider {
    table: Arc<LockTable>,
    timeout: Duration,
}

impl InProcessLockProvider {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            timeout,
        }
    }
}

impl Default for InProcessLockProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl LockProvider for InProcessLockProvider {
    fn acquire(&self, resource: &Path) -> LockGuard {
        let deadline = Instant::now() + self.timeout;
        let mut held = self.table.held.lock();
        while held.contains(resource) {
            if self
                .table
                .released
                .wait_until(&mut held, deadline)
                .timed_out()
                && held.contains(resource)
            {
                drop(held);
                log_timeout(self.name(), resource, self.timeout);
                return LockGuard::timed_out();
            }
        }
        held.insert(resource.to_path_buf());
        LockGuard {
            inner: GuardInner::InProcess {
                table: Arc::clone(&self.table),
                resource: resource.to_path_buf(),
            },
        }
    }

    fn name(&self) -> &'static str {
        "in-process"
    }

    fn is_degraded(&self) -> bool {
        false
    }
}

/// Pick the OS lock when `lock_dir` accepts a test lock, otherwise the
/// pass-through provider.
pub fn select_provider(lock_dir: &Path, timeout: Duration) -> Arc<dyn LockProvider> {
    match check_flock(lock_dir) {
        Ok(()) => {
            tracing::debug!(lock_dir = %lock_dir.display(), "Using flock advisory locking");
            Arc::new(FileLockProvider::new(timeout))
        }
        Err(err) => {
            tracing::warn!(
                lock_dir = %lock_dir.display(),
                error = %err,
                "flock unavailable, session writes will be unsynchronized"
            );
            Arc::new(UnlockedProvider::already_reported())
        }
    }
}

fn check_flock(lock_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(lock_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_dir.join(LOCK_CHECK_FILE))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            let _ = FileExt::unlock(&file);
            Ok(())
        }
        // Someone else holds the check file: the primitive works.
        Err(err) if is_contended(&err) => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_lock_path_for() {
        assert_eq!(
            lock_path_for(Path::new("/tmp/session.json")),
            PathBuf::from("/tmp/session.json.lock")
        );
    }

    #[test]
    fn test_file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let resource = dir.path().join("state.json");
        let provider = FileLockProvider::new(Duration::from_millis(50));

        let first = provider.acquire(&resource);
        assert!(first.is_exclusive());

        // A second descriptor on the same lock file cannot get in.
        let second = provider.acquire(&resource);
        assert!(!second.is_exclusive());
        assert!(second.is_timed_out());
        assert!(!second.is_degraded());
        // Contention is not a missing primitive.
        assert!(!provider.is_degraded());

        drop(second);
        drop(first);

        let third = provider.acquire(&resource);
        assert!(third.is_exclusive());
    }

    #[test]
    fn test_file_lock_unopenable_degrades() {
        let dir = tempfile::tempdir().unwrap();
        // Parent "directory" is a regular file, so the lock file cannot exist.
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();
        let provider = FileLockProvider::new(Duration::from_millis(10));

        let guard = provider.acquire(&blocker.join("state.json"));
        assert!(!guard.is_exclusive());
        assert!(guard.is_degraded());
        assert!(!guard.is_timed_out());
        assert!(provider.is_degraded());
    }

    #[test]
    fn test_unlocked_provider_always_degraded() {
        let provider = UnlockedProvider::new();
        assert!(!provider.is_degraded());
        let value = with_lock(&provider, Path::new("/nowhere"), || 7);
        assert_eq!(value, 7);
        assert!(provider.is_degraded());
    }

    #[test]
    fn test_in_process_lock_serializes_threads() {
        let provider = InProcessLockProvider::new(Duration::from_secs(5));
        let inside = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let resource = PathBuf::from("/virtual/resource");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider = provider.clone();
                let inside = Arc::clone(&inside);
                let overlaps = Arc::clone(&overlaps);
                let resource = resource.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        with_lock(&provider, &resource, || {
                            if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(!provider.is_degraded());
    }

    #[test]
    fn test_in_process_lock_released_on_panic() {
        let provider = InProcessLockProvider::new(Duration::from_millis(50));
        let resource = PathBuf::from("/virtual/panics");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_lock(&provider, &resource, || panic!("boom"))
        }));
        assert!(result.is_err());

        let guard = provider.acquire(&resource);
        assert!(guard.is_exclusive());
    }

    #[test]
    fn test_in_process_lock_times_out_while_held() {
        let provider = InProcessLockProvider::new(Duration::from_millis(20));
        let resource = PathBuf::from("/virtual/held");

        let held = provider.acquire(&resource);
        let waiting = provider.acquire(&resource);
        assert!(waiting.is_timed_out());
        assert!(!provider.is_degraded());

        drop(waiting);
        drop(held);
        assert!(provider.acquire(&resource).is_exclusive());
    }

    #[test]
    fn test_select_provider_on_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let provider = select_provider(dir.path(), Duration::from_millis(100));
        assert_eq!(provider.name(), "flock");
        assert!(!provider.is_degraded());
    }

    #[test]
    fn test_select_provider_fallback_starts_reported() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let provider = select_provider(&blocker, Duration::from_millis(10));
        assert_eq!(provider.name(), "unlocked");
        // Selection already warned; acquiring must not take the first-warning path.
        assert!(provider.is_degraded());
        assert!(provider.acquire(&blocker.join("state.json")).is_degraded());
    }
}
