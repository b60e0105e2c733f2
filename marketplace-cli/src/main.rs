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

//! marketplace-hook
//!
//! The process the host spawns for each tool-use event, plus subcommands that
//! expose the session store, logger and journal to shell-based hooks.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use marketplace_utils::journal::read_journal;
use marketplace_utils::protocol::{field_to_string, read_request_detailed};
use marketplace_utils::{
    execute, finish, respond, Decision, Document, ErrorKind, HookContext, HookEnv, HookError,
    HookExit, HookPlugin, HookResponse, HookResult, HookRuntime, Identity, LogLevel, Recommender,
    RuleSet,
};
use serde_json::Value;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "marketplace-hook")]
#[command(about = "Hook lifecycle and session state for marketplace plugins", long_about = None)]
struct Cli {
    /// Plugin name (overrides MARKETPLACE_PLUGIN_NAME)
    #[arg(long, global = true)]
    plugin: Option<String>,

    /// Hook event name (overrides MARKETPLACE_HOOK_EVENT)
    #[arg(long, global = true)]
    event: Option<String>,

    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the recommender against the request on stdin
    Run {
        /// Rules file (TOML or JSON); defaults to the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,
    },

    /// Session store operations
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Append a line to the session log
    Log {
        /// DEBUG, INFO, WARN, ERROR or FATAL
        #[arg(long, default_value = "INFO")]
        level: String,

        /// Component name
        #[arg(long)]
        component: Option<String>,

        /// Message words
        #[arg(required = true)]
        message: Vec<String>,
    },

    /// Error journal operations
    Journal {
        #[command(subcommand)]
        command: JournalCommands,
    },

    /// Print a field of the request on stdin (empty when absent)
    Field {
        /// Dotted path, e.g. tool_input.file_path
        path: String,
    },

    /// Emit a hook response and exit with the matching code
    Respond {
        /// allow, warn or block
        #[arg(long, default_value = "allow")]
        decision: String,

        /// Message shown to the user
        #[arg(long)]
        message: Option<String>,

        /// Additional context as JSON
        #[arg(long)]
        context: Option<String>,
    },
}

#[derive(Subcommand)]
enum SessionCommands {
    /// Create or reset the record for this plugin
    Init,
    /// Delete the record
    Reset,
    /// Print a stored value
    Get { key: String },
    /// Store a value (parsed as JSON when possible)
    Set { key: String, value: String },
    /// Exit 0 when the recommendation was shown, 1 otherwise
    HasShown { recommendation: String },
    /// Mark a recommendation as shown
    MarkShown { recommendation: String },
    /// Print the whole record
    Show,
    /// Delete the record and ephemeral log files
    End,
}

#[derive(Subcommand)]
enum JournalCommands {
    /// Append a record
    Record {
        #[arg(long)]
        context: String,
        /// Error kind, e.g. plugin_failure
        #[arg(long, default_value = "plugin_failure")]
        kind: String,
        detail: String,
    },
    /// Print every record as JSON lines
    List,
}

/// Stands in for the recommender when its rules could not be loaded, so the
/// failure goes through the lifecycle's fail-open path.
struct Unconfigured {
    reason: String,
}

impl HookPlugin for Unconfigured {
    fn name(&self) -> &str {
        "recommender"
    }

    fn run(&self, _ctx: &HookContext<'_>, _request: &Document) -> HookResult<HookResponse> {
        Err(HookError::RulesParse(self.reason.clone()))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stdout belongs to the protocol; diagnostics go to stderr.
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut env = HookEnv::from_env();
    if cli.plugin.is_some() {
        env.plugin = cli.plugin.clone();
    }
    if cli.event.is_some() {
        env.event = cli.event.clone();
    }

    match cli.command {
        Commands::Run { rules } => run_hook(&env, rules),
        Commands::Respond {
            decision,
            message,
            context,
        } => emit_response(&env, &decision, message, context),
        Commands::Field { path } => {
            let request = read_request_detailed(io::stdin().lock());
            println!("{}", field_to_string(&request.doc, &path));
            Ok(())
        }
        Commands::Session { command } => handle_session_command(&env, command),
        Commands::Log {
            level,
            component,
            message,
        } => {
            let runtime = runtime_for(&env);
            let level = LogLevel::parse_lenient(&level);
            runtime
                .logger()
                .log(level, &message.join(" "), component.as_deref());
            Ok(())
        }
        Commands::Journal { command } => handle_journal_command(&env, command),
    }
}

fn runtime_for(env: &HookEnv) -> HookRuntime {
    let event = env.event.clone().unwrap_or_else(|| "cli".to_string());
    HookRuntime::from_env(env, Identity::new(env.plugin_name(), event))
}

fn run_hook(env: &HookEnv, rules: Option<PathBuf>) -> ! {
    let plugin: Box<dyn HookPlugin> = match load_rules(env, rules) {
        Ok(rules) => match Recommender::new(&rules) {
            Ok(recommender) => Box::new(recommender),
            Err(err) => Box::new(Unconfigured {
                reason: err.to_string(),
            }),
        },
        Err(err) => Box::new(Unconfigured {
            reason: format!("{err:#}"),
        }),
    };

    let exit = execute(
        env,
        plugin.as_ref(),
        io::stdin().lock(),
        &mut io::stdout().lock(),
        &mut io::stderr().lock(),
    );
    finish(exit)
}

fn load_rules(env: &HookEnv, rules: Option<PathBuf>) -> Result<RuleSet> {
    match rules.or_else(|| env.rules_file.clone()) {
        Some(path) => RuleSet::load(&path)
            .with_context(|| format!("Failed to load rules from {}", path.display())),
        None => Ok(RuleSet::builtin()),
    }
}

fn emit_response(
    env: &HookEnv,
    decision: &str,
    message: Option<String>,
    context: Option<String>,
) -> Result<()> {
    let decision = Decision::parse(decision).unwrap_or_else(|| {
        tracing::warn!(decision, "Unknown decision, allowing");
        Decision::Allow
    });
    let response = HookResponse {
        decision,
        message: message.filter(|m| !m.is_empty()),
        additional_context: context.map(|raw| parse_value(&raw)),
    };

    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    let exit = match respond(&mut stdout, &mut stderr, &response) {
        Ok(exit) => exit,
        Err(err) => {
            let runtime = runtime_for(env);
            let kind = match err {
                HookError::EmptyBlockMessage => ErrorKind::InvalidBlock,
                _ => ErrorKind::IoFailure,
            };
            runtime.journal().record("respond", kind, &err.to_string());
            if kind == ErrorKind::InvalidBlock {
                let _ = respond(&mut stdout, &mut stderr, &HookResponse::allow());
            }
            HookExit::FailOpen
        }
    };
    drop(stdout);
    drop(stderr);
    finish(exit)
}

fn handle_session_command(env: &HookEnv, command: SessionCommands) -> Result<()> {
    let runtime = runtime_for(env);
    let session = runtime.session();
    let plugin = env.plugin_name();

    match command {
        SessionCommands::Init => session
            .init(plugin)
            .context("Failed to initialize session")?,
        SessionCommands::Reset => session.reset().context("Failed to reset session")?,
        SessionCommands::Get { key } => {
            match session.get(plugin, &key) {
                Some(Value::String(s)) => println!("{s}"),
                Some(value) => println!("{value}"),
                None => println!(),
            }
        }
        SessionCommands::Set { key, value } => session
            .set(plugin, &key, parse_value(&value))
            .with_context(|| format!("Failed to set {key}"))?,
        SessionCommands::HasShown { recommendation } => {
            if !session.has_shown(plugin, &recommendation) {
                std::process::exit(1);
            }
        }
        SessionCommands::MarkShown { recommendation } => session
            .mark_shown(plugin, &recommendation)
            .with_context(|| format!("Failed to mark {recommendation} as shown"))?,
        SessionCommands::Show => {
            let record = session.snapshot();
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        SessionCommands::End => runtime.end_session(),
    }
    Ok(())
}

fn handle_journal_command(env: &HookEnv, command: JournalCommands) -> Result<()> {
    match command {
        JournalCommands::Record {
            context,
            kind,
            detail,
        } => {
            let Some(kind) = ErrorKind::parse(&kind) else {
                bail!("Unknown error kind: {kind}");
            };
            runtime_for(env).journal().record(&context, kind, &detail);
        }
        JournalCommands::List => {
            let path = env.paths().journal;
            let entries = read_journal(&path)
                .with_context(|| format!("Failed to read journal {}", path.display()))?;
            let mut stdout = io::stdout().lock();
            for entry in entries {
                writeln!(stdout, "{}", serde_json::to_string(&entry)?)?;
            }
        }
    }
    Ok(())
}

/// JSON when it parses, a plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
