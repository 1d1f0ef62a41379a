use async_trait::async_trait;

/// The socket of one authenticated device, as seen by its delivery
/// connection.
#[async_trait]
pub trait ClientSession: Send + Sync {
    /// Writes one framed envelope.
    async fn send(&self, frame: &[u8]) -> Result<(), anyhow::Error>;

    async fn disconnect(&self);
}
