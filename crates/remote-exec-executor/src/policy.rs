//! Command policy evaluation.
//!
//! A decision is a pure function of the command string, one policy snapshot,
//! and (for [`decide_with_approval`]) the caller's approval flag. The engine
//! reads exactly one snapshot per decision from a [`PolicyStore`]; reloads
//! swap the whole snapshot.

use std::sync::{Arc, PoisonError, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Top-level key of the policy section in a configuration document.
pub const POLICY_KEY: &str = "commandPolicy";

/// Policy error.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Invalid policy document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

/// Allow/deny configuration for shell commands.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyConfig {
    /// Master switch; when off only the denylist applies.
    pub enabled: bool,
    /// Substrings that admit a command.
    pub allowlist: Vec<String>,
    /// Words that deny a command, checked before anything else.
    pub denylist: Vec<String>,
    /// Admit everything the denylist does not catch.
    pub allow_all_others: bool,
}

impl PolicyConfig {
    /// Read the policy section out of a JSON configuration document.
    ///
    /// A document without the section yields the default policy.
    ///
    /// # Errors
    /// Returns error if the document or the section is malformed.
    pub fn from_document(text: &str) -> Result<Self, PolicyError> {
        let mut doc: Value = serde_json::from_str(text)?;
        match doc.get_mut(POLICY_KEY).map(Value::take) {
            Some(section) => Ok(serde_json::from_value(section)?),
            None => Ok(Self::default()),
        }
    }

    /// First denylist pattern found in `command` as a whole word, ignoring case.
    #[must_use]
    pub fn denylist_match(&self, command: &str) -> Option<&str> {
        patterns(&self.denylist).find(|pattern| contains_word(command, pattern))
    }

    /// First allowlist pattern contained in `command`.
    #[must_use]
    pub fn allowlist_match(&self, command: &str) -> Option<&str> {
        patterns(&self.allowlist).find(|pattern| command.contains(pattern))
    }
}

/// Why a command was denied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    Denylisted { pattern: String },
    NotAllowlisted,
}

/// Policy verdict for one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Admit,
    Deny(DenyReason),
    RequireApproval,
}

/// Evaluate `command` against `config`.
#[must_use]
pub fn decide(command: &str, config: &PolicyConfig) -> Decision {
    if let Some(pattern) = config.denylist_match(command) {
        return Decision::Deny(DenyReason::Denylisted {
            pattern: pattern.to_owned(),
        });
    }

    if !config.enabled || config.allow_all_others || config.allowlist_match(command).is_some() {
        return Decision::Admit;
    }

    Decision::Deny(DenyReason::NotAllowlisted)
}

/// Evaluate `command` and fold in the caller's request for manual approval.
///
/// - A denylist hit stays a denial.
/// - A command denied only for missing the allowlist becomes `RequireApproval`
///   when approval was requested.
/// - An admitted command with approval requested needs approval unless it
///   matches the allowlist on its own.
#[must_use]
pub fn decide_with_approval(command: &str, config: &PolicyConfig, approval_requested: bool) -> Decision {
    let decision = decide(command, config);
    if !approval_requested {
        return decision;
    }

    match decision {
        Decision::Deny(DenyReason::NotAllowlisted) => Decision::RequireApproval,
        Decision::Admit if config.allowlist_match(command).is_none() => Decision::RequireApproval,
        other => other,
    }
}

fn patterns(list: &[String]) -> impl Iterator<Item = &str> {
    list.iter().map(|p| p.trim()).filter(|p| !p.is_empty())
}

/// Case-insensitive match of `pattern` bounded by the string edges or
/// non-word characters on both sides.
fn contains_word(command: &str, pattern: &str) -> bool {
    let expr = format!(r"(?i)(?:^|\W){}(?:$|\W)", regex::escape(pattern));
    match Regex::new(&expr) {
        Ok(re) => re.is_match(command),
        Err(e) => {
            tracing::warn!(pattern, "Unusable denylist pattern: {e}");
            false
        }
    }
}

/// Shared holder of the active policy snapshot.
///
/// Readers clone the inner `Arc` and never observe a half-updated policy.
#[derive(Debug, Default)]
pub struct PolicyStore {
    current: RwLock<Arc<PolicyConfig>>,
}

impl PolicyStore {
    /// Create a store holding `config`.
    #[must_use]
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicyConfig> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Replace the snapshot wholesale, returning the previous one.
    pub fn replace(&self, config: PolicyConfig) -> Arc<PolicyConfig> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(config))
    }
}
