use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BridgeError;

/// A string-only channel into the other side of the boundary. Delivery is
/// at-least-once-or-drop; correlation is the caller's job.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, frame: String) -> Result<(), BridgeError>;
}

/// In-process transport backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<String>,
}

pub fn channel() -> (ChannelTransport, mpsc::UnboundedReceiver<String>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (ChannelTransport { sender }, receiver)
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn post(&self, frame: String) -> Result<(), BridgeError> {
        self.sender
            .send(frame)
            .map_err(|_| BridgeError::unavailable("channel transport closed"))
    }
}
