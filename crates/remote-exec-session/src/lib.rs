//! JSON-RPC sessions over a [`remote_exec_core::Transport`].
//!
//! Provides:
//! - `Session` - Client role: handshake, correlated calls, notifications
//! - `serve` / `RequestHandler` - Server role request loop
//! - `ToolDispatcher` - Handler exposing the `execute_command` tool

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod server;

pub use client::{HANDSHAKE_ID, Session};
pub use dispatcher::{EXECUTE_COMMAND, ToolDispatcher};
pub use error::SessionError;
pub use server::{RequestHandler, serve};
