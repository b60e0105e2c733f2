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

//! Marketplace hook utilities
//!
//! Hook lifecycle and session coordination for marketplace plugins. The host
//! spawns one short-lived process per tool-use event; these processes share
//! per-session state through a locked JSON file, log to a shared session
//! log, and always answer the host with exactly one decision.
//!
//! # Components
//!
//! - **Protocol** ([`protocol`]): request parsing, dotted-path lookup,
//!   responses and the fixed exit-code contract
//! - **Session store** ([`session`]): plugin-scoped flags and values,
//!   read-modify-write under the advisory lock
//! - **Advisory lock** ([`lock`]): `flock` with a pass-through fallback
//! - **Logger** ([`logger`]) and **error journal** ([`journal`])
//! - **Lifecycle** ([`lifecycle`]): START → IDENTIFY → RUN → RESPOND → END,
//!   fail-open on any plugin failure
//! - **Recommenders** ([`recommend`], [`rules`]): once-per-session advice
//!
//! # Example
//!
//! ```rust,ignore
//! use marketplace_utils::{execute, finish, HookEnv, Recommender, RuleSet};
//!
//! let env = HookEnv::from_env();
//! let plugin = Recommender::new(&RuleSet::builtin())?;
//! let exit = execute(
//!     &env,
//!     &plugin,
//!     std::io::stdin().lock(),
//!     &mut std::io::stdout(),
//!     &mut std::io::stderr(),
//! );
//! finish(exit);
//! ```

pub mod config;
pub mod error;
pub mod journal;
pub mod lifecycle;
pub mod lock;
pub mod logger;
pub mod protocol;
pub mod recommend;
pub mod rules;
pub mod session;

pub use config::{HookEnv, SessionPaths};
pub use error::{HookError, HookResult};
pub use journal::{ErrorJournal, ErrorKind, FileJournal, JournalEntry, JournalScope, MemoryJournal};
pub use lifecycle::{execute, CleanupPlan, HookContext, HookPlugin, HookRuntime, Identity};
pub use lock::{
    select_provider, with_lock, FileLockProvider, InProcessLockProvider, LockGuard, LockProvider,
    UnlockedProvider,
};
pub use logger::{LogLevel, LogTarget, LoggingSink, MemorySink, SessionLogger};
pub use protocol::{
    finish, get_field, get_str, read_request, respond, Decision, Document, HookExit, HookResponse,
};
pub use recommend::{ContentScanner, PatternScanner, Recommender, ScannerPlugin};
pub use rules::{Rule, RuleSet};
pub use session::{FileBackend, MemoryBackend, SessionBackend, SessionRecord, SessionStore};
