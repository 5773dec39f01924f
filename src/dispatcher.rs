use std::net::SocketAddr;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tracing::debug;

/// Receives application payloads, per peer in sequence order and each exactly once
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PayloadDispatcher: Send + Sync + 'static {
    async fn on_payload(&self, from: SocketAddr, payload: Bytes);
}

/// Forwards payloads to a channel, for applications that prefer pulling over callbacks
pub struct ChannelDispatcher {
    sender: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl ChannelDispatcher {
    pub fn new() -> (ChannelDispatcher, mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelDispatcher { sender }, receiver)
    }
}

#[async_trait]
impl PayloadDispatcher for ChannelDispatcher {
    async fn on_payload(&self, from: SocketAddr, payload: Bytes) {
        if self.sender.send((from, payload)).is_err() {
            debug!("payload receiver was dropped - discarding payload from {:?}", from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_dispatcher() {
        let (dispatcher, mut receiver) = ChannelDispatcher::new();
        let from = SocketAddr::from(([1, 2, 3, 4], 5));

        dispatcher.on_payload(from, Bytes::from_static(b"a")).await;
        dispatcher.on_payload(from, Bytes::from_static(b"b")).await;

        assert_eq!(receiver.recv().await, Some((from, Bytes::from_static(b"a"))));
        assert_eq!(receiver.recv().await, Some((from, Bytes::from_static(b"b"))));

        drop(receiver);
        dispatcher.on_payload(from, Bytes::from_static(b"c")).await;
    }
}
