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

//! Per-invocation lifecycle.
//!
//! ```text
//! START -> IDENTIFY(plugin, event) -> RUN -> RESPOND -> END
//! ```
//!
//! Whatever RUN does, including returning an error or panicking, RESPOND
//! writes exactly one response. Failures become a default allow
//! ([`HookExit::FailOpen`]) plus one journal record. END is the caller's
//! call to [`crate::protocol::finish`].

use crate::config::{HookEnv, SessionPaths, UNKNOWN};
use crate::error::{HookError, HookResult};
use crate::journal::{ErrorJournal, ErrorKind, FileJournal, JournalScope};
use crate::lock::{select_provider, LockProvider};
use crate::logger::{LogTarget, LoggingSink, SessionLogger};
use crate::protocol::{
    get_str, read_request_detailed, respond, Document, HookExit, HookResponse, RequestRead,
};
use crate::session::{FileBackend, SessionStore};
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

/// Event that (re)initializes the session record.
pub const SESSION_START_EVENT: &str = "SessionStart";
/// Event after which ephemeral session artifacts are removed.
pub const SESSION_END_EVENT: &str = "SessionEnd";

const COMPONENT: &str = "lifecycle";

/// Plugin logic run inside the lifecycle.
pub trait HookPlugin {
    fn name(&self) -> &str;

    fn run(&self, ctx: &HookContext<'_>, request: &Document) -> HookResult<HookResponse>;
}

/// Lifecycle stage, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Identify,
    Run,
    Respond,
    End,
}

/// Plugin and event names stamped on every log line of the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub plugin: String,
    pub event: String,
}

impl Identity {
    pub fn new(plugin: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            event: event.into(),
        }
    }

    /// Environment first, then `hook_event_name` from the request.
    pub fn resolve(env: &HookEnv, request: &Document) -> Self {
        let event = env
            .event
            .clone()
            .or_else(|| {
                Some(get_str(request, "hook_event_name"))
                    .filter(|e| !e.is_empty())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| UNKNOWN.to_string());
        Self::new(env.plugin_name(), event)
    }
}

/// What plugin logic gets to work with.
pub struct HookContext<'a> {
    pub identity: &'a Identity,
    pub session: &'a SessionStore,
    pub logger: &'a dyn LoggingSink,
    pub journal: &'a dyn ErrorJournal,
}

impl HookContext<'_> {
    pub fn plugin(&self) -> &str {
        &self.identity.plugin
    }

    pub fn event(&self) -> &str {
        &self.identity.event
    }
}

/// Files removed after `SessionEnd`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupPlan {
    pub files: Vec<PathBuf>,
}

impl CleanupPlan {
    /// Log and journal go unless retained or the log path was overridden.
    pub fn for_session(paths: &SessionPaths, retain_logs: bool) -> Self {
        let mut files = Vec::new();
        if !retain_logs {
            if paths.log_is_default {
                files.push(paths.log.clone());
            }
            files.push(paths.journal.clone());
        }
        Self { files }
    }
}

/// The collaborators of one invocation, wired together.
pub struct HookRuntime {
    identity: Identity,
    session: SessionStore,
    logger: Arc<dyn LoggingSink>,
    journal: Arc<dyn ErrorJournal>,
    cleanup: CleanupPlan,
}

impl HookRuntime {
    pub fn new(
        identity: Identity,
        session: SessionStore,
        logger: Arc<dyn LoggingSink>,
        journal: Arc<dyn ErrorJournal>,
    ) -> Self {
        Self {
            identity,
            session,
            logger,
            journal,
            cleanup: CleanupPlan::default(),
        }
    }

    pub fn with_cleanup(mut self, cleanup: CleanupPlan) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// File-backed runtime for the session described by `env`.
    pub fn from_env(env: &HookEnv, identity: Identity) -> Self {
        let lock: Arc<dyn LockProvider> = select_provider(&env.state_dir, env.lock_timeout);
        let session_key = env.session_key();
        let paths = env.paths();

        let logger: Arc<dyn LoggingSink> = Arc::new(SessionLogger::new(
            LogTarget::from_path(&paths.log),
            identity.plugin.clone(),
            env.log_level,
            Arc::clone(&lock),
        ));
        let journal: Arc<dyn ErrorJournal> = Arc::new(FileJournal::new(
            paths.journal.clone(),
            JournalScope::new(&session_key, &identity.plugin, &identity.event),
            Arc::clone(&lock),
        ));
        let session = SessionStore::new(
            session_key,
            Box::new(FileBackend::new(paths.state.clone())),
            lock,
        )
        .with_journal(Arc::clone(&journal));

        Self::new(identity, session, logger, journal)
            .with_cleanup(CleanupPlan::for_session(&paths, env.retain_logs))
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn logger(&self) -> &dyn LoggingSink {
        self.logger.as_ref()
    }

    pub fn journal(&self) -> &dyn ErrorJournal {
        self.journal.as_ref()
    }

    fn context(&self) -> HookContext<'_> {
        HookContext {
            identity: &self.identity,
            session: &self.session,
            logger: self.logger.as_ref(),
            journal: self.journal.as_ref(),
        }
    }

    /// IDENTIFY through RESPOND for an already-read request.
    pub fn run(
        &self,
        plugin: &dyn HookPlugin,
        request: RequestRead,
        out: &mut dyn Write,
        side: &mut dyn Write,
    ) -> HookExit {
        self.enter(Phase::Identify);
        if let Some(err) = &request.malformed {
            self.journal
                .record("protocol.read_request", ErrorKind::MalformedInput, err);
            self.logger
                .debug(COMPONENT, "Request was not JSON, using an empty document");
        }
        if request.truncated {
            self.journal.record(
                "protocol.read_request",
                ErrorKind::Truncation,
                "request exceeded the size limit and was discarded",
            );
        }
        if self.identity.event == SESSION_START_EVENT {
            if let Err(err) = self.session.init(&self.identity.plugin) {
                self.journal
                    .record("session.init", ErrorKind::IoFailure, &err.to_string());
            }
        }

        self.enter(Phase::Run);
        let (response, mut exit) = self.run_plugin(plugin, &request.doc);

        self.enter(Phase::Respond);
        if let Err(err) = respond(out, side, &response) {
            self.journal
                .record("protocol.respond", ErrorKind::IoFailure, &err.to_string());
            // The exit code still carries the decision.
            if !response.exit().blocks() {
                exit = HookExit::FailOpen;
            }
        }

        if self.identity.event == SESSION_END_EVENT {
            self.end_session();
        }
        self.enter(Phase::End);
        exit
    }

    fn run_plugin(&self, plugin: &dyn HookPlugin, request: &Document) -> (HookResponse, HookExit) {
        let ctx = self.context();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| plugin.run(&ctx, request)));

        let failure = match outcome {
            Ok(Ok(response)) => match response.validate() {
                Ok(()) => {
                    let exit = response.exit();
                    return (response, exit);
                }
                Err(err) => (ErrorKind::InvalidBlock, err.to_string()),
            },
            Ok(Err(err)) => (ErrorKind::PluginFailure, err.to_string()),
            Err(payload) => (ErrorKind::PluginPanic, panic_message(payload.as_ref())),
        };

        let (kind, detail) = failure;
        self.journal.record(plugin.name(), kind, &detail);
        self.logger.error(
            COMPONENT,
            &format!("{} failed ({kind}), allowing: {detail}", plugin.name()),
        );
        (HookResponse::allow(), HookExit::FailOpen)
    }

    /// Delete the session record and the ephemeral log/journal files.
    ///
    /// The `<file>.lock` siblings and the state directory's lock test file
    /// stay behind. Another invocation may still hold or be waiting on one of
    /// them, and unlinking a locked file lets the next opener lock a fresh
    /// inode while the old holder keeps running. They are empty files.
    pub fn end_session(&self) {
        match self.session.reset() {
            Ok(()) | Err(HookError::LockTimeout { .. }) => {}
            Err(err) => {
                self.journal
                    .record("session.reset", ErrorKind::IoFailure, &err.to_string())
            }
        }
        for file in &self.cleanup.files {
            match std::fs::remove_file(file) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    tracing::debug!(path = %file.display(), error = %err, "Cleanup failed")
                }
            }
        }
    }

    fn enter(&self, phase: Phase) {
        tracing::debug!(
            plugin = %self.identity.plugin,
            event = %self.identity.event,
            ?phase,
            "Hook lifecycle"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

/// START through RESPOND against the environment: read `input`, identify,
/// build the file-backed runtime, run `plugin` and write the response.
/// The caller finishes with the returned exit.
pub fn execute(
    env: &HookEnv,
    plugin: &dyn HookPlugin,
    input: impl Read,
    out: &mut dyn Write,
    side: &mut dyn Write,
) -> HookExit {
    tracing::debug!(phase = ?Phase::Start, "Hook lifecycle");
    let request = read_request_detailed(input);
    let identity = Identity::resolve(env, &request.doc);
    HookRuntime::from_env(env, identity).run(plugin, request, out, side)
}
