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

//! Hook error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for hook operations
pub type HookResult<T> = Result<T, HookError>;

/// Errors that can occur inside the hook layer.
///
/// None of these reach the host directly: the lifecycle wrapper turns any
/// error raised by plugin logic into a fail-open response.
#[derive(Debug, Error)]
pub enum HookError {
    // Protocol errors
    #[error("Block decision requires a non-empty message")]
    EmptyBlockMessage,

    #[error("Failed to write hook response: {0}")]
    ResponseWrite(String),

    // Session errors
    #[error("Session store error at {path}: {message}")]
    SessionStore { path: PathBuf, message: String },

    #[error("Timed out waiting for the lock on {path}")]
    LockTimeout { path: PathBuf },

    // Rule errors
    #[error("Failed to parse rules: {0}")]
    RulesParse(String),

    #[error("Invalid rule at index {index}: {reason}")]
    InvalidRule { index: usize, reason: String },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    // IO errors
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    // Generic errors
    #[error("Hook error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for HookError {
    fn from(e: serde_json::Error) -> Self {
        HookError::SerializationError(e.to_string())
    }
}

impl From<toml::de::Error> for HookError {
    fn from(e: toml::de::Error) -> Self {
        HookError::RulesParse(e.to_string())
    }
}
