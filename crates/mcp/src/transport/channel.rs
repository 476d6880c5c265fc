use async_trait::async_trait;
use tokio::sync::mpsc;

use super::McpTransport;
use crate::error::McpError;

/// In-memory transport backed by channel pairs. Built-in providers are served
/// over one of these.
pub struct ChannelTransport {
    rx: mpsc::Receiver<String>,
    tx: Option<mpsc::Sender<String>>,
}

impl ChannelTransport {
    /// Create a pair of connected transports.
    ///
    /// Messages sent on one transport are received by the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(32);
        let (tx_b, rx_a) = mpsc::channel(32);
        (
            Self {
                rx: rx_a,
                tx: Some(tx_a),
            },
            Self {
                rx: rx_b,
                tx: Some(tx_b),
            },
        )
    }
}

#[async_trait]
impl McpTransport for ChannelTransport {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.rx.recv().await)
    }

    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        let tx = self.tx.as_ref().ok_or(McpError::NotConnected)?;
        tx.send(message.to_string()).await.map_err(|e| {
            McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e))
        })?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), McpError> {
        // Dropping our sender ends the peer's receive loop.
        self.tx = None;
        self.rx.close();
        Ok(())
    }
}
