//! Cross-process pub/sub plumbing on top of the cache service.
//!
//! The transport owns the sockets. It knows nothing about handlers: incoming
//! publishes are handed to a [`DispatchRouter`] (the pub/sub registry), and
//! subscription changes are reconciled against the router's current state.

pub mod connection;
pub mod publisher;
pub mod redis;

use async_trait::async_trait;
use dispatchcore::resp::ProtocolError;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use redis::{RedisDispatchTransport, TcpConnector};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cache service replied with an error: {0}")]
    Server(String),
    #[error("Connection is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// Receiver of events published on a channel.
///
/// Callbacks run on the transport's receive loop, in the order the events
/// arrived. Implementations must only do in-memory work here and hand anything
/// slower to the dispatch executor.
#[async_trait]
pub trait DispatchChannel: Send + Sync {
    async fn on_dispatch_message(&self, channel: &str, data: &[u8]);

    fn on_dispatch_subscribed(&self, _channel: &str) {}

    fn on_dispatch_unsubscribed(&self, _channel: &str) {}
}

/// What the transport needs from the registry.
#[async_trait]
pub trait DispatchRouter: Send + Sync {
    /// Whether a local handler currently holds `channel`.
    fn is_subscribed(&self, channel: &str) -> bool;

    /// Every channel that must be subscribed on the cache service.
    fn subscribed_channels(&self) -> Vec<String>;

    /// Delivers an incoming publish.
    async fn route(&self, channel: &str, data: &[u8]);

    /// Called when the cache service confirms a SUBSCRIBE or UNSUBSCRIBE.
    fn on_subscription_confirmed(&self, _channel: &str, _subscribed: bool) {}
}

#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Starts the receive loop. Calling it twice is a no-op.
    fn start(&self, router: Arc<dyn DispatchRouter>);

    /// Publishes `payload` and returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<u64>;

    /// Brings the cache-side subscription of `channel` in line with
    /// `router.is_subscribed(channel)`.
    async fn sync_subscription(&self, channel: &str, router: &dyn DispatchRouter) -> Result<()>;

    async fn shutdown(&self);
}

pub type CacheReader = Box<dyn AsyncRead + Send + Unpin>;
pub type CacheWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens raw connections to the cache service.
#[async_trait]
pub trait CacheConnector: Send + Sync {
    async fn connect(&self) -> Result<(CacheReader, CacheWriter)>;
}
