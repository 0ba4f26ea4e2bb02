//! # Transport Abstraction
//!
//! A minimal, async interface for moving messages between two peers.
//!
//! ## Philosophy
//!
//! - **Message-Oriented**: The transport moves whole `Message`s. Framing and
//!   byte encoding live behind this trait.
//! - **Duplex**: Either side may send at any time. Requests, responses and
//!   one-way invocations all share the same channel.

use std::fmt;

use crate::message::Message;

/// Identifies one connection. Scopes its dynamic registry and its invokers.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer is unreachable or the connection was dropped.
    ConnectionLost(String),
    /// The local side closed the channel.
    Closed,
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::Closed => write!(f, "Channel closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional message channel to one peer.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn channel_id(&self) -> ChannelId;

    /// Hands a message to the channel. Returns once the channel accepted it.
    async fn send(&self, message: Message) -> Result<()>;

    /// Waits for the next message. `Ok(None)` means the peer closed the channel.
    async fn recv(&self) -> Result<Option<Message>>;

    /// Stops sending. The peer observes end-of-stream.
    async fn close(&self);
}
