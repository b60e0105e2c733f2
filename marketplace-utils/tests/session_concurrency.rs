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

// Cross-descriptor and cross-process behaviour of the session files.

use marketplace_utils::config::{
    ENV_LOCK_TIMEOUT_MS, ENV_LOG_LEVEL, ENV_PLUGIN_NAME, ENV_SESSION_ID, ENV_STATE_DIR,
};
use marketplace_utils::journal::read_journal;
use marketplace_utils::{
    ErrorKind, FileBackend, FileLockProvider, HookEnv, HookError, HookRuntime, Identity,
    LockProvider, LogLevel, LogTarget, LoggingSink, SessionLogger, SessionStore,
    UnlockedProvider,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

const HOLD_LOCK_ENV: &str = "MARKETPLACE_TEST_HOLD_LOCK";

fn env_for(dir: &Path, session: &str) -> HookEnv {
    env_with(dir, session, &[])
}

fn env_with(dir: &Path, session: &str, extra: &[(&'static str, &str)]) -> HookEnv {
    let mut vars: HashMap<&str, String> = [
        (ENV_SESSION_ID, session.to_string()),
        (ENV_STATE_DIR, dir.display().to_string()),
        (ENV_PLUGIN_NAME, "nextjs".to_string()),
        (ENV_LOG_LEVEL, "DEBUG".to_string()),
    ]
    .into_iter()
    .collect();
    vars.extend(extra.iter().map(|(k, v)| (*k, v.to_string())));
    HookEnv::from_lookup(|key| vars.get(key).cloned())
}

#[test]
fn test_concurrent_log_lines_are_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.log");
    let writers = 8;
    let per_writer = 25;

    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let path = path.clone();
            std::thread::spawn(move || {
                let logger = SessionLogger::new(
                    LogTarget::File(path),
                    format!("writer-{w}"),
                    LogLevel::Debug,
                    Arc::new(FileLockProvider::new(Duration::from_secs(10))),
                );
                for i in 0..per_writer {
                    logger.info("stress", &format!("writer {w} line {i} {}", "x".repeat(512)));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let contents = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), writers * per_writer);
    for line in &lines {
        assert!(line.starts_with('['), "corrupt line: {line}");
        assert!(line.contains("[INFO] [stress] writer "), "corrupt line: {line}");
        assert!(line.ends_with(&"x".repeat(512)), "truncated line: {line}");
    }
    for w in 0..writers {
        for i in 0..per_writer {
            let needle = format!("writer {w} line {i} ");
            assert_eq!(lines.iter().filter(|l| l.contains(&needle)).count(), 1);
        }
    }
}

#[test]
fn test_runtime_sessions_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let a = HookRuntime::from_env(&env_for(dir.path(), "alpha"), Identity::new("nextjs", "cli"));
    let b = HookRuntime::from_env(&env_for(dir.path(), "beta"), Identity::new("nextjs", "cli"));

    a.session().init("nextjs").unwrap();
    b.session().init("nextjs").unwrap();
    a.session().mark_shown("nextjs", "middleware_warning").unwrap();

    assert!(a.session().has_shown("nextjs", "middleware_warning"));
    assert!(!b.session().has_shown("nextjs", "middleware_warning"));
    assert!(dir.path().join("marketplace-session-alpha.json").exists());
    assert!(dir.path().join("marketplace-session-beta.json").exists());
}

#[test]
fn test_corrupt_file_recovers_through_init() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    std::fs::write(&path, b"\x00\x01 definitely not json").unwrap();

    let store = SessionStore::new(
        "s",
        Box::new(FileBackend::new(&path)),
        Arc::new(FileLockProvider::new(Duration::from_secs(2))),
    );
    assert!(!store.has_shown("nextjs", "middleware_warning"));
    store.init("nextjs").unwrap();

    let record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(record["plugin"], "nextjs");
    assert_eq!(record["flags"], serde_json::json!({}));
}

#[test]
fn test_degraded_store_keeps_every_concurrent_write() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("marketplace-session-shared.json");
    let threads = 8;
    let rounds = 20;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let path = path.clone();
            std::thread::spawn(move || {
                // One provider and descriptor set per thread, like separate
                // processes on a filesystem without flock.
                let store = SessionStore::new(
                    "shared",
                    Box::new(FileBackend::new(&path)),
                    Arc::new(UnlockedProvider::new()),
                );
                for r in 0..rounds {
                    store.set("p", &format!("k{t}-{r}"), serde_json::json!(r)).unwrap();
                    store.mark_shown("p", &format!("tip{t}-{r}")).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let store = SessionStore::new(
        "shared",
        Box::new(FileBackend::new(&path)),
        Arc::new(FileLockProvider::new(Duration::from_secs(2))),
    );
    let record = store.snapshot();
    let mut lost = Vec::new();
    for t in 0..threads {
        for r in 0..rounds {
            if record.get("p", &format!("k{t}-{r}")) != Some(&serde_json::json!(r)) {
                lost.push(format!("k{t}-{r}"));
            }
            if !record.has_shown("p", &format!("tip{t}-{r}")) {
                lost.push(format!("tip{t}-{r}"));
            }
        }
    }
    assert!(lost.is_empty(), "lost {} of {}: {lost:?}", lost.len(), 2 * threads * rounds);

    // Once locking works again the first write folds everything back.
    store.set("p", "after", serde_json::json!(true)).unwrap();
    let folded: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(folded["values"]["p"].as_object().unwrap().len(), threads * rounds + 1);
    assert_eq!(folded["flags"]["p"].as_object().unwrap().len(), threads * rounds);
}

#[test]
fn test_contended_lock_times_out_instead_of_writing() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_with(dir.path(), "busy", &[(ENV_LOCK_TIMEOUT_MS, "50")]);
    let paths = env.paths();
    let runtime = HookRuntime::from_env(&env, Identity::new("nextjs", "PreToolUse"));

    let (locked_tx, locked_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    let state = paths.state.clone();
    let holder = std::thread::spawn(move || {
        let provider = FileLockProvider::new(Duration::from_secs(5));
        let guard = provider.acquire(&state);
        assert!(guard.is_exclusive());
        locked_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        drop(guard);
    });
    locked_rx.recv().unwrap();

    let started = Instant::now();
    let result = runtime
        .session()
        .mark_shown_once("nextjs", "middleware_warning");
    assert!(matches!(result, Err(HookError::LockTimeout { .. })), "{result:?}");
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!paths.state.exists());

    let entries = read_journal(&paths.journal).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].kind, ErrorKind::LockUnavailable);

    release_tx.send(()).unwrap();
    holder.join().unwrap();

    // Exactly one winner once the holder is gone.
    assert!(runtime
        .session()
        .mark_shown_once("nextjs", "middleware_warning")
        .unwrap());
    assert!(!runtime
        .session()
        .mark_shown_once("nextjs", "middleware_warning")
        .unwrap());
}

#[test]
fn test_end_session_keeps_lock_files() {
    let dir = tempfile::tempdir().unwrap();
    let env = env_for(dir.path(), "ending");
    let paths = env.paths();
    let runtime = HookRuntime::from_env(&env, Identity::new("nextjs", "SessionEnd"));

    runtime.session().mark_shown("nextjs", "middleware_warning").unwrap();
    runtime.logger().error("test", "before end");
    let state_lock = marketplace_utils::lock::lock_path_for(&paths.state);
    assert!(paths.state.exists());
    assert!(state_lock.exists());

    runtime.end_session();

    assert!(!paths.state.exists());
    assert!(!paths.log.exists());
    // Lock files may still be held by another invocation; they stay.
    assert!(state_lock.exists());
    assert!(dir.path().join(marketplace_utils::lock::LOCK_CHECK_FILE).exists());
}

/// Helper run in a child process by the kill test below; does nothing when
/// run normally.
#[test]
fn lock_holder_child() {
    let Ok(resource) = std::env::var(HOLD_LOCK_ENV) else {
        return;
    };
    let provider = FileLockProvider::new(Duration::from_secs(5));
    let guard = provider.acquire(Path::new(&resource));
    assert!(guard.is_exclusive());
    std::fs::write(format!("{resource}.ready"), b"1").unwrap();
    std::thread::sleep(Duration::from_secs(60));
    drop(guard);
}

#[cfg(unix)]
#[test]
fn test_lock_released_when_holder_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let resource = dir.path().join("state.json");
    let ready = dir.path().join("state.json.ready");

    let mut child = std::process::Command::new(std::env::current_exe().unwrap())
        .args(["lock_holder_child", "--exact", "--nocapture", "--test-threads=1"])
        .env(HOLD_LOCK_ENV, &resource)
        .stdout(std::process::Stdio::null())
        .spawn()
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while !ready.exists() {
        assert!(Instant::now() < deadline, "child never took the lock");
        std::thread::sleep(Duration::from_millis(20));
    }

    let contender = FileLockProvider::new(Duration::from_millis(100));
    assert!(contender.acquire(&resource).is_timed_out());

    // SIGKILL: no cleanup code runs in the child.
    child.kill().unwrap();
    child.wait().unwrap();

    let after = FileLockProvider::new(Duration::from_secs(2));
    assert!(after.acquire(&resource).is_exclusive());
}
