//! Bayeux Core Library
//!
//! A client for the Bayeux publish/subscribe protocol (as spoken by CometD
//! servers): handshake, connection keep-alive, channel subscriptions and
//! publishing over HTTP long-polling or REST-style polling.
//!
//! # Modules
//!
//! - [`client`] - Session client and its state machine
//! - [`message`] - Wire message types and channel helpers
//! - [`dispatcher`] - Channel pattern dispatch (`*` and `**` wildcards)
//! - [`subscription`] - Per-channel listener bookkeeping
//! - [`transport`] - Long-polling and REST-polling transports and negotiation
//! - [`http`] - HTTP client abstraction used by the transports
//! - [`extension`] - Incoming/outgoing message extensions
//! - [`batch`] - Message batching
//! - [`backoff`] - Reconnect backoff
//! - [`pending`] - Acknowledgement futures
//! - [`events`] - Event sink trait for session lifecycle events
//! - [`config`] - Client configuration
//! - [`error`] - Error types

pub mod backoff;
pub mod batch;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod extension;
pub mod http;
pub mod message;
pub mod pending;
pub mod subscription;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use client::{SessionClient, SessionStatus};
pub use config::ClientConfig;
pub use dispatcher::{ChannelDispatcher, Listener};
pub use error::{BayeuxError, Result};
pub use events::{BroadcastEventSink, EventSink, SessionEvent, SessionEventKind, StdoutEventSink};
pub use extension::{Extension, ExtensionPipeline};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use message::{meta, Advice, Message, Reconnect};
pub use pending::PendingFuture;
pub use transport::{Transport, TransportError, TransportRegistry};
