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

//! Hook protocol adapter.
//!
//! The host writes one JSON document to the hook's stdin and reads back one
//! JSON response from stdout plus the exit code:
//!
//! | exit code | host behaviour                                   |
//! |-----------|--------------------------------------------------|
//! | `0`       | allow, an advisory message may be surfaced       |
//! | `2`       | block the tool action and show the message       |
//! | other     | hook failure, treated as allow (fail-open)       |
//!
//! Requests carry no schema here; fields are looked up by dotted path and
//! anything missing is simply absent.

use crate::error::{HookError, HookResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::io::{Read, Write};

/// Untyped request tree.
pub type Document = Value;

/// Requests larger than this are dropped and treated as empty.
pub const MAX_REQUEST_BYTES: u64 = 8 * 1024 * 1024;

/// Exit code for a deliberate block.
pub const BLOCK_EXIT_CODE: i32 = 2;

/// What the hook tells the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[default]
    Allow,
    /// Allow, but surface the message.
    #[serde(alias = "violation")]
    Warn,
    Block,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Warn => "warn",
            Decision::Block => "block",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "allow" => Some(Decision::Allow),
            "warn" | "violation" => Some(Decision::Warn),
            "block" => Some(Decision::Block),
            _ => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the process ends, translated to a numeric code only at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookExit {
    Allow,
    Block,
    /// Something failed internally; the host is told to allow.
    FailOpen,
}

impl HookExit {
    pub fn code(&self) -> i32 {
        match self {
            HookExit::Allow | HookExit::FailOpen => 0,
            HookExit::Block => BLOCK_EXIT_CODE,
        }
    }

    /// Host-side reading of an exit code. Total over all codes.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => HookExit::Allow,
            BLOCK_EXIT_CODE => HookExit::Block,
            _ => HookExit::FailOpen,
        }
    }

    pub fn blocks(&self) -> bool {
        matches!(self, HookExit::Block)
    }
}

/// The single response of one invocation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookResponse {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_context: Option<Value>,
}

impl HookResponse {
    /// The no-op response.
    pub fn allow() -> Self {
        Self::default()
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Warn,
            message: Some(message.into()),
            additional_context: None,
        }
    }

    pub fn block(message: impl Into<String>) -> Self {
        Self {
            decision: Decision::Block,
            message: Some(message.into()),
            additional_context: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.additional_context = Some(context);
        self
    }

    /// Block responses must explain themselves.
    pub fn validate(&self) -> HookResult<()> {
        let has_message = self
            .message
            .as_deref()
            .map(|m| !m.trim().is_empty())
            .unwrap_or(false);
        if self.decision == Decision::Block && !has_message {
            return Err(HookError::EmptyBlockMessage);
        }
        Ok(())
    }

    pub fn exit(&self) -> HookExit {
        match self.decision {
            Decision::Block => HookExit::Block,
            Decision::Allow | Decision::Warn => HookExit::Allow,
        }
    }
}

/// Result of reading the request, with what went wrong if anything.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRead {
    pub doc: Document,
    /// Parse error for non-empty input that was not JSON.
    pub malformed: Option<String>,
    /// Input exceeded [`MAX_REQUEST_BYTES`] and was discarded.
    pub truncated: bool,
}

/// Read the whole input once. Never fails: anything unusable is an empty
/// document.
pub fn read_request(reader: impl Read) -> Document {
    read_request_detailed(reader).doc
}

pub fn read_request_detailed(reader: impl Read) -> RequestRead {
    let mut buf = Vec::new();
    let empty = || Value::Object(Map::new());

    if let Err(err) = reader.take(MAX_REQUEST_BYTES + 1).read_to_end(&mut buf) {
        return RequestRead {
            doc: empty(),
            malformed: Some(format!("failed to read input: {err}")),
            truncated: false,
        };
    }
    if buf.len() as u64 > MAX_REQUEST_BYTES {
        return RequestRead {
            doc: empty(),
            malformed: None,
            truncated: true,
        };
    }

    match parse_request(&buf) {
        Ok(doc) => RequestRead {
            doc,
            malformed: None,
            truncated: false,
        },
        Err(err) => RequestRead {
            doc: empty(),
            malformed: Some(err.to_string()),
            truncated: false,
        },
    }
}

/// Strict parse. Blank input is an empty document, not an error.
pub fn parse_request(input: &[u8]) -> HookResult<Document> {
    if input.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    Ok(serde_json::from_slice(input)?)
}

/// Resolve a dotted path (`tool_input.file_path`, `edits.0.new_string`).
///
/// Numeric segments index arrays. Missing nodes and explicit `null` are
/// both `None`.
pub fn get_field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(doc).filter(|v| !v.is_null());
    }
    path.split('.')
        .try_fold(doc, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}

/// String at `path`, or `""` when absent or not a string.
pub fn get_str<'a>(doc: &'a Document, path: &str) -> &'a str {
    get_field(doc, path).and_then(Value::as_str).unwrap_or("")
}

/// Shell-friendly rendering: strings verbatim, everything else as JSON,
/// absent as empty.
pub fn field_to_string(doc: &Document, path: &str) -> String {
    match get_field(doc, path) {
        None => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Write `response` to `out` as one JSON line and flush. Block messages are
/// echoed to `side` as well so the host can show them.
pub fn respond(
    out: &mut dyn Write,
    side: &mut dyn Write,
    response: &HookResponse,
) -> HookResult<HookExit> {
    response.validate()?;

    let mut line =
        serde_json::to_string(response).map_err(|e| HookError::ResponseWrite(e.to_string()))?;
    line.push('\n');
    out.write_all(line.as_bytes())
        .and_then(|_| out.flush())
        .map_err(|e| HookError::ResponseWrite(e.to_string()))?;

    if response.decision == Decision::Block {
        if let Some(message) = &response.message {
            // Side channel only; losing it does not change the decision.
            let _ = writeln!(side, "{message}");
            let _ = side.flush();
        }
    }
    Ok(response.exit())
}

/// The one process exit point. Flushes stdout and stderr first.
pub fn finish(exit: HookExit) -> ! {
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
    std::process::exit(exit.code())
}
