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

//! Hook runtime configuration
//!
//! Everything is read from the environment the host hands to each hook
//! process. Nothing here fails: unparsable values fall back to defaults.

use crate::logger::LogLevel;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const ENV_SESSION_ID: &str = "MARKETPLACE_SESSION_ID";
pub const ENV_LOG_FILE: &str = "MARKETPLACE_LOG_FILE";
pub const ENV_LOG_LEVEL: &str = "MARKETPLACE_LOG_LEVEL";
pub const ENV_PLUGIN_NAME: &str = "MARKETPLACE_PLUGIN_NAME";
pub const ENV_HOOK_EVENT: &str = "MARKETPLACE_HOOK_EVENT";
pub const ENV_STATE_DIR: &str = "MARKETPLACE_STATE_DIR";
pub const ENV_RETAIN_LOGS: &str = "MARKETPLACE_RETAIN_LOGS";
pub const ENV_LOCK_TIMEOUT_MS: &str = "MARKETPLACE_LOCK_TIMEOUT_MS";
pub const ENV_RULES_FILE: &str = "MARKETPLACE_RULES_FILE";

/// Placeholder used when no plugin or event name was supplied.
pub const UNKNOWN: &str = "unknown";

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2000;

/// Hex digits of the raw-id hash appended to escaped session keys.
const KEY_HASH_LEN: usize = 12;

/// Runtime settings for one hook invocation.
#[derive(Debug, Clone)]
pub struct HookEnv {
    /// Explicit session identifier; derived from the parent pid when absent.
    pub session_id: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_level: LogLevel,
    pub plugin: Option<String>,
    pub event: Option<String>,
    pub state_dir: PathBuf,
    pub retain_logs: bool,
    pub lock_timeout: Duration,
    pub rules_file: Option<PathBuf>,
}

impl HookEnv {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            session_id: get(ENV_SESSION_ID),
            log_file: get(ENV_LOG_FILE).map(PathBuf::from),
            log_level: get(ENV_LOG_LEVEL)
                .map(|v| LogLevel::parse_lenient(&v))
                .unwrap_or_default(),
            plugin: get(ENV_PLUGIN_NAME),
            event: get(ENV_HOOK_EVENT),
            state_dir: get(ENV_STATE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(env::temp_dir),
            retain_logs: get(ENV_RETAIN_LOGS)
                .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            lock_timeout: Duration::from_millis(
                get(ENV_LOCK_TIMEOUT_MS)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),
            ),
            rules_file: get(ENV_RULES_FILE).map(PathBuf::from),
        }
    }

    /// Session key for this invocation, safe to embed in a file name.
    pub fn session_key(&self) -> String {
        match &self.session_id {
            Some(id) => sanitize_key(id),
            None => format!("ppid-{}", parent_pid()),
        }
    }

    /// Paths of every per-session artifact.
    pub fn paths(&self) -> SessionPaths {
        let key = self.session_key();
        let default_log = self.state_dir.join(format!("marketplace-{key}.log"));
        let (log, log_is_default) = match &self.log_file {
            Some(path) => (path.clone(), false),
            None => (default_log, true),
        };
        SessionPaths {
            state: self
                .state_dir
                .join(format!("marketplace-session-{key}.json")),
            journal: self
                .state_dir
                .join(format!("marketplace-{key}.errors.jsonl")),
            log,
            log_is_default,
        }
    }

    pub fn plugin_name(&self) -> &str {
        self.plugin.as_deref().unwrap_or(UNKNOWN)
    }
}

impl Default for HookEnv {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

/// Filesystem locations of one session's artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub state: PathBuf,
    /// `-` means stderr.
    pub log: PathBuf,
    pub journal: PathBuf,
    /// False when the log path came from an override; overrides are never
    /// removed by session cleanup.
    pub log_is_default: bool,
}

/// Make `raw` a single path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`. When anything had to be
/// replaced, a short hash of the raw id is appended so that distinct ids
/// never share a key (`team/a` and `team_a` stay apart).
pub fn sanitize_key(raw: &str) -> String {
    let raw = raw.trim();
    let mut cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." would escape the state dir
    if cleaned.chars().all(|c| c == '.') {
        cleaned = cleaned.replace('.', "_");
    }
    if cleaned == raw {
        return cleaned;
    }
    let digest = blake3::hash(raw.as_bytes()).to_hex();
    format!("{cleaned}-{}", &digest.as_str()[..KEY_HASH_LEN])
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    // No portable ppid outside unix; fall back to our own pid.
    std::process::id()
}
