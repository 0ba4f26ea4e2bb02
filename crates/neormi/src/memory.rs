//! In-process duplex transport.
//!
//! Connects two nodes in the same process. Messages are moved, not encoded,
//! so `send` checks wire safety itself to stand in for a serializer: a message
//! that still carries a live object or proxy is rejected.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::message::Message;
use crate::transport;
use crate::transport::ChannelId;
use crate::transport::Transport;

static NEXT_CHANNEL: AtomicU64 = AtomicU64::new(1);

/// One end of an in-memory channel.
///
/// Messages sent on one end appear on the other end's `recv()`.
pub struct MemoryTransport {
    channel: ChannelId,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
}

impl MemoryTransport {
    /// Creates a pair of transports connected to each other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Self {
            channel: ChannelId(NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed)),
            tx: Mutex::new(Some(tx_a)),
            rx: Arc::new(tokio::sync::Mutex::new(rx_b)),
        };

        let b = Self {
            channel: ChannelId(NEXT_CHANNEL.fetch_add(1, Ordering::Relaxed)),
            tx: Mutex::new(Some(tx_b)),
            rx: Arc::new(tokio::sync::Mutex::new(rx_a)),
        };

        (a, b)
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn channel_id(&self) -> ChannelId {
        self.channel
    }

    async fn send(&self, message: Message) -> transport::Result<()> {
        if !message.is_wire_safe() {
            return Err(transport::Error::Io("message carries a live object".into()));
        }
        let Some(tx) = self.sender() else {
            return Err(transport::Error::Closed);
        };
        tx.send(message)
            .map_err(|_| transport::Error::ConnectionLost("Channel closed".into()))
    }

    async fn recv(&self) -> transport::Result<Option<Message>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    async fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::binding::Call;
    use crate::binding::Remote;
    use crate::interface::Interface;
    use crate::message::Payload;
    use crate::message::Token;
    use crate::value::Value;

    #[tokio::test]
    async fn test_pair_is_duplex() {
        let (a, b) = MemoryTransport::pair();
        assert_ne!(a.channel_id(), b.channel_id());

        let lookup = Message::Request { token: Token(1), payload: Payload::Lookup("g".into()) };
        a.send(lookup).await.unwrap();
        b.send(Message::Response { token: Token(1), outcome: Ok(Value::Null) })
            .await
            .unwrap();

        assert!(matches!(b.recv().await.unwrap(), Some(Message::Request { .. })));
        assert!(matches!(a.recv().await.unwrap(), Some(Message::Response { .. })));
    }

    #[tokio::test]
    async fn test_close_ends_peer_stream() {
        let (a, b) = MemoryTransport::pair();
        a.close().await;
        assert_eq!(b.recv().await.unwrap(), None);
        let err = a
            .send(Message::Response { token: Token(1), outcome: Ok(Value::Null) })
            .await
            .unwrap_err();
        assert_eq!(err, transport::Error::Closed);
    }

    #[tokio::test]
    async fn test_live_objects_are_rejected() {
        struct Nothing;
        impl Remote for Nothing {
            fn interfaces(&self) -> Vec<Arc<Interface>> {
                vec![]
            }
            fn invoke(&self, _call: Call<'_>) -> anyhow::Result<Value> {
                Ok(Value::Null)
            }
        }

        let (a, _b) = MemoryTransport::pair();
        let err = a
            .send(Message::Response { token: Token(1), outcome: Ok(Value::object(Nothing)) })
            .await
            .unwrap_err();
        assert!(matches!(err, transport::Error::Io(_)));
    }
}
