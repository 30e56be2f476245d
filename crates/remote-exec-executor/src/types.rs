//! Tool argument and result shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments of the `execute_command` tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Single-line shell command.
    pub command: String,
    /// Why the caller wants to run it.
    #[serde(default)]
    pub explanation: String,
    /// Launch detached and return immediately.
    #[serde(default)]
    pub background: bool,
    /// Ask for manual approval before running.
    #[serde(default)]
    pub require_approval: bool,
}

impl CommandRequest {
    /// Foreground request without approval.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            explanation: String::new(),
            background: false,
            require_approval: false,
        }
    }

    #[must_use]
    pub const fn background(mut self, background: bool) -> Self {
        self.background = background;
        self
    }

    #[must_use]
    pub const fn require_approval(mut self, require_approval: bool) -> Self {
        self.require_approval = require_approval;
        self
    }

    /// Check the command is non-empty and fits on one line.
    ///
    /// # Errors
    /// Returns a description of the problem.
    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("command must not be empty".to_owned());
        }
        if self.command.contains(['\n', '\r']) {
            return Err("command must be a single line".to_owned());
        }
        Ok(())
    }
}

/// Failure classes reported in [`CommandOutcome::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeErrorKind {
    /// Refused by the command policy.
    SecurityViolation,
    /// Foreground run exceeded its time limit.
    Timeout,
    /// Launch failure, non-zero exit, or signal.
    ExecError,
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Success {
        stdout: String,
        stderr: String,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        truncated: bool,
    },
    Waiting {
        message: String,
    },
    Error {
        kind: OutcomeErrorKind,
        message: String,
        #[serde(default)]
        details: Value,
    },
}

impl CommandOutcome {
    pub(crate) fn error(kind: OutcomeErrorKind, message: impl Into<String>, details: Value) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            details,
        }
    }

    /// Whether this outcome reports a failure.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}
