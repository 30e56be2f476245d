//! Core abstractions for remote command execution over JSON-RPC.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - JSON-RPC 2.0 request/response/notification model
//! - `MethodCall` - Typed payloads for the methods the system understands
//! - `Transport` - Duplex message channel trait
//! - `ChannelTransport` - In-memory transport pair
//! - `CommandBuilder` - Launch command parsing for spawned peers

pub mod channel;
pub mod command;
pub mod message;
pub mod protocol;
pub mod traits;

pub use channel::ChannelTransport;
pub use command::{CommandBuilder, CommandParts};
pub use message::{Message, Notification, Request, RequestId, Response, ResponsePayload, RpcError};
pub use protocol::MethodCall;
pub use traits::{Inbound, Transport, TransportError};
