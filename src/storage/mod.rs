//! Persistence of envelopes that could not be delivered to a live connection.

pub mod memory;

use async_trait::async_trait;
use dispatchcore::DeviceAddress;
use dispatchcore::proto::envelope::Envelope;
use thiserror::Error;

pub use memory::InMemoryMessageStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Serialization/deserialization error: {0}")]
    Serialization(String),

    #[error("Message store backend error: {0}")]
    Backend(#[from] Box<dyn std::error::Error + Send + Sync>),

    #[error("Message store is full for {0}")]
    Full(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// An envelope waiting for its device to come online.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: u64,
    pub envelope: Envelope,
}

impl StoredMessage {
    pub fn sender(&self) -> &str {
        self.envelope.source()
    }

    pub fn timestamp(&self) -> u64 {
        self.envelope.timestamp()
    }
}

/// Oldest-first slice of a device's stored messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub has_more: bool,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persists `envelope` for `recipient` and returns its id.
    async fn store(&self, envelope: &Envelope, recipient: &DeviceAddress) -> Result<u64>;

    /// Loads the oldest stored messages of `recipient`. Messages stay stored
    /// until they are removed.
    async fn load_page(&self, recipient: &DeviceAddress) -> Result<MessagePage>;

    /// Removes the message `sender` sent at `timestamp`, if still stored.
    async fn remove(
        &self,
        recipient: &DeviceAddress,
        sender: &str,
        timestamp: u64,
    ) -> Result<Option<StoredMessage>>;

    async fn count(&self, recipient: &DeviceAddress) -> Result<usize>;
}
