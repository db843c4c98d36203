//! Client/server transport: framing, messages, the broadcast hub and the
//! reconnecting client.

pub mod client;
pub mod codec;
pub mod hub;
pub mod message;

pub use client::{backoff_delay, ServerConnection};
pub use hub::{serve, ClientHub, ClientId, Inbound};
pub use message::*;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown method id {0}")]
    UnknownMethod(u16),

    #[error("method id {0} is not valid in this direction")]
    WrongDirection(u16),

    #[error("frame truncated")]
    Truncated,

    #[error("payload of {0} bytes exceeds limit")]
    TooLarge(usize),
}

/// Destination for server events.
pub trait EventSink: Send + Sync {
    fn publish(&self, message: ServerMessage);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _message: ServerMessage) {}
}
