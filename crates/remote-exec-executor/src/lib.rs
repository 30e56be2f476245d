//! Policy-gated shell command execution.
//!
//! Provides:
//! - `PolicyConfig` / `decide` - Allow/deny evaluation of command strings
//! - `PolicyStore` - Atomically swapped policy snapshot
//! - `ExecutionEngine` - Runs admitted commands with timeout and output caps
//! - `CommandRequest` / `CommandOutcome` - Tool argument and result shapes

pub mod engine;
pub mod policy;
pub mod shell;
pub mod types;

pub use engine::{ExecutionEngine, ExecutionLimits};
pub use policy::{Decision, DenyReason, PolicyConfig, PolicyError, PolicyStore, decide, decide_with_approval};
pub use types::{CommandOutcome, CommandRequest, OutcomeErrorKind};
