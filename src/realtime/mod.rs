//! Realtime channel modules.
//!
//! - `event`: event types and the inbound/outbound message shape.
//! - `bus`: subscriber registry keyed by event type.
//! - `transport`: websocket and SSE backends behind one interface.
//! - `manager`: connection lifecycle, reconnect schedule, and dispatch.

/// Subscriber registry.
pub mod bus;
/// Event types and message codec.
pub mod event;
/// Connection lifecycle and reconnect handling.
pub mod manager;
/// Websocket and SSE transports.
pub mod transport;

pub use bus::{EventBus, HandlerId, Subscription};
pub use event::{Event, EventCategory, EventType};
pub use manager::{
    ConnectionObserver, ConnectionState, RealtimeDefaults, RealtimeManager, RealtimeOptions,
};
pub use transport::{Connector, DefaultConnector, Protocol, TransportEvent, TransportHandle};
