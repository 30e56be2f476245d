//! Transports carrying JSON-RPC messages between processes.
//!
//! Provides:
//! - `PipeTransport` - NDJSON over a subprocess's stdin/stdout (or any stream pair)
//! - `EventStreamTransport` - HTTP event-stream inbound, POST outbound
//! - `NdjsonCodec` / `SseParser` - Framing for the two wire formats
//! - `TransportDescriptor` / `connect` - Build a transport from configuration
//! - HTTP/SSE server (feature: http)

pub mod codec;
pub mod descriptor;
pub mod event_stream;
pub mod pipe;
pub mod sse;

#[cfg(feature = "http")]
pub mod http;

pub use codec::NdjsonCodec;
pub use descriptor::{TransportDescriptor, connect};
pub use event_stream::EventStreamTransport;
pub use pipe::PipeTransport;
pub use sse::{SseEvent, SseParser};
