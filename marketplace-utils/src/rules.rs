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

//! Recommendation rules.
//!
//! A rules file lists path patterns and the advice to show, once per
//! session, when a tool touches a matching file:
//!
//! ```toml
//! [[rules]]
//! plugin = "nextjs"
//! recommendation = "middleware_warning"
//! pattern = "(^|/)middleware\\.(ts|js)$"
//! message = "Next.js 16 renamed middleware to proxy; see the migration guide."
//! decision = "warn"
//! tools = ["Write", "Edit"]
//! ```
//!
//! The same structure is accepted as JSON.

use crate::error::{HookError, HookResult};
use crate::protocol::Decision;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One recommendation rule as written in the rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub plugin: String,
    pub recommendation: String,
    /// Regex matched against the file path.
    pub pattern: String,
    #[serde(default)]
    pub message: String,
    #[serde(default = "default_decision")]
    pub decision: Decision,
    /// Tool names the rule applies to; empty means every tool.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

fn default_decision() -> Decision {
    Decision::Warn
}

/// Rules file contents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl RuleSet {
    /// Rules shipped with the binary.
    pub fn builtin() -> Self {
        Self {
            rules: vec![Rule {
                plugin: "nextjs".to_string(),
                recommendation: "middleware_warning".to_string(),
                pattern: r"(^|/)middleware\.(ts|js)$".to_string(),
                message: "Next.js 16 renamed middleware to proxy; see the migration guide."
                    .to_string(),
                decision: Decision::Warn,
                tools: vec!["Write".to_string(), "Edit".to_string()],
            }],
        }
    }

    /// Load from disk. `.toml` and `.json` pick the format; anything else
    /// is tried as TOML, then JSON.
    pub fn load(path: &Path) -> HookResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);

        let rules = match extension.as_deref() {
            Some("toml") => Self::from_toml(&content)?,
            Some("json") => Self::from_json(&content)?,
            _ => match Self::from_toml(&content) {
                Ok(rules) => rules,
                Err(_) => Self::from_json(&content)?,
            },
        };
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_toml(content: &str) -> HookResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> HookResult<Self> {
        serde_json::from_str(content).map_err(|e| HookError::RulesParse(e.to_string()))
    }

    pub fn validate(&self) -> HookResult<()> {
        for (index, rule) in self.rules.iter().enumerate() {
            let invalid = |reason: &str| HookError::InvalidRule {
                index,
                reason: reason.to_string(),
            };
            if rule.plugin.trim().is_empty() {
                return Err(invalid("plugin name is empty"));
            }
            if rule.recommendation.trim().is_empty() {
                return Err(invalid("recommendation name is empty"));
            }
            if rule.decision == Decision::Block && rule.message.trim().is_empty() {
                return Err(invalid("block rules need a message"));
            }
            Regex::new(&rule.pattern).map_err(|e| invalid(&e.to_string()))?;
        }
        Ok(())
    }

    pub fn compile(&self) -> HookResult<Vec<CompiledRule>> {
        self.validate()?;
        self.rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    regex: Regex::new(&rule.pattern)?,
                    rule: rule.clone(),
                })
            })
            .collect()
    }
}

/// A validated rule with its pattern compiled.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub rule: Rule,
    regex: Regex,
}

impl CompiledRule {
    /// Whether the rule fires for `tool` touching `path`. The tool filter is
    /// skipped when the request names no tool.
    pub fn matches(&self, tool: &str, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let tool_ok =
            tool.is_empty() || self.rule.tools.is_empty() || self.rule.tools.iter().any(|t| t == tool);
        tool_ok && self.regex.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOML_RULES: &str = r#"
[[rules]]
plugin = "react"
recommendation = "class_components"
pattern = "\\.jsx$"
message = "Prefer function components."

[[rules]]
plugin = "secrets"
recommendation = "env_file"
pattern = "(^|/)\\.env$"
message = "Do not write .env files."
decision = "block"
tools = ["Write"]
"#;

    #[test]
    fn test_builtin_rules_are_valid() {
        let compiled = RuleSet::builtin().compile().unwrap();
        assert_eq!(compiled.len(), 1);
        assert!(compiled[0].matches("Write", "src/middleware.ts"));
        assert!(compiled[0].matches("Edit", "middleware.js"));
        assert!(!compiled[0].matches("Read", "middleware.ts"));
        assert!(!compiled[0].matches("Write", "src/my-middleware.ts"));
        assert!(compiled[0].matches("", "middleware.ts"));
    }

    #[test]
    fn test_parse_toml() {
        let rules = RuleSet::from_toml(TOML_RULES).unwrap();
        assert_eq!(rules.rules.len(), 2);
        assert_eq!(rules.rules[0].decision, Decision::Warn);
        assert!(rules.rules[0].tools.is_empty());
        assert_eq!(rules.rules[1].decision, Decision::Block);
        rules.validate().unwrap();
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = dir.path().join("rules.json");
        std::fs::write(
            &json_path,
            r#"{"rules":[{"plugin":"p","recommendation":"r","pattern":"x$","decision":"allow"}]}"#,
        )
        .unwrap();
        let rules = RuleSet::load(&json_path).unwrap();
        assert_eq!(rules.rules[0].decision, Decision::Allow);

        let toml_path = dir.path().join("rules.conf");
        std::fs::write(&toml_path, TOML_RULES).unwrap();
        assert_eq!(RuleSet::load(&toml_path).unwrap().rules.len(), 2);
    }

    #[test]
    fn test_validate_rejects_bad_rules() {
        let mut rules = RuleSet::builtin();
        rules.rules[0].pattern = "(unclosed".to_string();
        assert!(matches!(
            rules.validate(),
            Err(HookError::InvalidRule { index: 0, .. })
        ));

        let mut rules = RuleSet::builtin();
        rules.rules[0].decision = Decision::Block;
        rules.rules[0].message = String::new();
        assert!(rules.validate().is_err());

        let mut rules = RuleSet::builtin();
        rules.rules[0].plugin = " ".to_string();
        assert!(rules.validate().is_err());
    }

    #[test]
    fn test_empty_path_never_matches() {
        let mut rules = RuleSet::builtin();
        rules.rules[0].pattern = ".*".to_string();
        rules.rules[0].tools.clear();
        let compiled = rules.compile().unwrap();
        assert!(!compiled[0].matches("Write", ""));
    }
}
