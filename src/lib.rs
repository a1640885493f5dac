//! Realtime transport layer for agent dashboards.
//!
//! The crate is organized by transport surface:
//! - `realtime`: a managed websocket/SSE channel with reconnect and a typed
//!   event bus.
//! - `stream`: incremental `data:` frame decoding and a streaming POST client.
//! - `retry`: shared backoff, retry, and timeout utilities.

/// Managed realtime channel, event types, and subscriber registry.
pub mod realtime;
/// Retry, backoff, and timeout helpers used across the crate.
pub mod retry;
/// Frame decoder and streaming HTTP client.
pub mod stream;

pub use realtime::{
    ConnectionObserver, ConnectionState, Event, EventType, Protocol, RealtimeManager,
    RealtimeOptions, Subscription,
};
pub use stream::{FrameDecoder, StreamingClient, Termination};
