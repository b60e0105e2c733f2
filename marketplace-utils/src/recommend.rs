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

//! Built-in hook plugins.
//!
//! - [`Recommender`] shows each matching rule's advice once per session.
//! - [`ScannerPlugin`] passes file content to a [`ContentScanner`] and
//!   forwards its warnings untouched.

use crate::error::{HookError, HookResult};
use crate::journal::ErrorKind;
use crate::lifecycle::{HookContext, HookPlugin};
use crate::protocol::{get_field, get_str, Decision, Document, HookResponse};
use crate::rules::{CompiledRule, RuleSet};
use regex::Regex;
use serde_json::{json, Value};

const COMPONENT: &str = "recommend";

/// Paths a tool call may name, in lookup order.
const PATH_FIELDS: &[&str] = &["tool_input.file_path", "tool_input.notebook_path"];

/// File path touched by the tool call, `""` if none.
pub fn target_path(request: &Document) -> &str {
    PATH_FIELDS
        .iter()
        .map(|field| get_str(request, field))
        .find(|path| !path.is_empty())
        .unwrap_or("")
}

/// Once-per-session advice driven by a [`RuleSet`].
#[derive(Debug, Clone)]
pub struct Recommender {
    rules: Vec<CompiledRule>,
}

impl Recommender {
    pub fn new(rules: &RuleSet) -> HookResult<Self> {
        Ok(Self {
            rules: rules.compile()?,
        })
    }

    pub fn rules(&self) -> &[CompiledRule] {
        &self.rules
    }
}

impl HookPlugin for Recommender {
    fn name(&self) -> &str {
        "recommender"
    }

    fn run(&self, ctx: &HookContext<'_>, request: &Document) -> HookResult<HookResponse> {
        let tool = get_str(request, "tool_name");
        let path = target_path(request);
        if path.is_empty() {
            return Ok(HookResponse::allow());
        }

        let mut decision = Decision::Allow;
        let mut messages = Vec::new();
        let mut shown = Vec::new();

        for compiled in self.rules.iter().filter(|r| r.matches(tool, path)) {
            let rule = &compiled.rule;
            let rule_decision = match ctx
                .session
                .mark_shown_once(&rule.plugin, &rule.recommendation)
            {
                Ok(true) => rule.decision,
                Ok(false) => {
                    ctx.logger.debug(
                        COMPONENT,
                        &format!("{}/{} already shown", rule.plugin, rule.recommendation),
                    );
                    continue;
                }
                Err(err) => {
                    // Not recorded, so it may show again; never block on that.
                    if rule.decision == Decision::Block {
                        ctx.journal.record(
                            &format!("{}/{}", rule.plugin, rule.recommendation),
                            ErrorKind::FailOpenOverride,
                            &err.to_string(),
                        );
                    } else if !matches!(err, HookError::LockTimeout { .. }) {
                        // Lock timeouts are journaled by the store itself.
                        ctx.journal
                            .record("session.mark_shown", ErrorKind::IoFailure, &err.to_string());
                    }
                    rule.decision.min(Decision::Warn)
                }
            };

            ctx.logger.info(
                COMPONENT,
                &format!("{} matched {}/{}", path, rule.plugin, rule.recommendation),
            );
            decision = decision.max(rule_decision);
            if !rule.message.trim().is_empty() {
                messages.push(rule.message.clone());
            }
            shown.push(Value::String(format!("{}/{}", rule.plugin, rule.recommendation)));
        }

        if shown.is_empty() {
            return Ok(HookResponse::allow());
        }

        let mut response = HookResponse {
            decision,
            message: None,
            additional_context: Some(json!({ "file_path": path, "recommendations": shown })),
        };
        if !messages.is_empty() {
            response.message = Some(messages.join("\n\n"));
        }
        Ok(response)
    }
}

/// Stateless content check supplied by a plugin.
pub trait ContentScanner {
    /// Warnings for `content` written to `path`; empty when clean.
    fn scan(&self, path: &str, content: &str) -> Vec<String>;
}

/// Regex-per-warning scanner.
#[derive(Debug, Clone, Default)]
pub struct PatternScanner {
    patterns: Vec<(Regex, String)>,
}

impl PatternScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, pattern: &str, warning: impl Into<String>) -> HookResult<Self> {
        self.patterns.push((Regex::new(pattern)?, warning.into()));
        Ok(self)
    }
}

impl ContentScanner for PatternScanner {
    fn scan(&self, _path: &str, content: &str) -> Vec<String> {
        self.patterns
            .iter()
            .filter(|(regex, _)| regex.is_match(content))
            .map(|(_, warning)| warning.clone())
            .collect()
    }
}

/// Runs a [`ContentScanner`] over the content a tool call writes.
pub struct ScannerPlugin<S> {
    name: String,
    scanner: S,
}

impl<S: ContentScanner> ScannerPlugin<S> {
    pub fn new(name: impl Into<String>, scanner: S) -> Self {
        Self {
            name: name.into(),
            scanner,
        }
    }
}

/// Text the tool call writes: `content`, `new_string`, or every
/// `edits.*.new_string`.
pub fn written_content(request: &Document) -> String {
    let mut parts: Vec<&str> = ["tool_input.content", "tool_input.new_string"]
        .iter()
        .map(|field| get_str(request, field))
        .filter(|s| !s.is_empty())
        .collect();
    if let Some(Value::Array(edits)) = get_field(request, "tool_input.edits") {
        parts.extend(
            edits
                .iter()
                .filter_map(|edit| edit.get("new_string").and_then(Value::as_str)),
        );
    }
    parts.join("\n")
}

impl<S: ContentScanner> HookPlugin for ScannerPlugin<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &HookContext<'_>, request: &Document) -> HookResult<HookResponse> {
        let content = written_content(request);
        if content.is_empty() {
            return Ok(HookResponse::allow());
        }
        let path = target_path(request);
        let warnings = self.scanner.scan(path, &content);
        if warnings.is_empty() {
            return Ok(HookResponse::allow());
        }
        for warning in &warnings {
            ctx.logger.warn(COMPONENT, warning);
        }
        Ok(HookResponse::warn(warnings.join("\n")))
    }
}
