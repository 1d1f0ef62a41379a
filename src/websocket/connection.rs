use super::session::ClientSession;
use crate::dispatch::DispatchChannel;
use crate::framing::{FramingError, encode_frame};
use crate::pubsub::{PubSubError, PubSubManager};
use crate::storage::{MessageStore, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dispatchcore::event::decode_envelope;
use dispatchcore::{DeviceAddress, PubSubEvent};
use log::{debug, info, trace, warn};
use prost::Message;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::{Notify, mpsc};

const INACTIVE: u8 = 0;
const ACTIVE: u8 = 1;
const CLOSED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Inactive,
    Active,
    Closed,
}

impl From<u8> for ConnectionState {
    fn from(value: u8) -> Self {
        match value {
            INACTIVE => Self::Inactive,
            ACTIVE => Self::Active,
            _ => Self::Closed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Connection is {0:?}, expected it to be inactive")]
    InvalidState(ConnectionState),
    #[error("Could not subscribe connection: {0}")]
    Subscription(#[from] PubSubError),
    #[error("Could not frame envelope: {0}")]
    Framing(#[from] FramingError),
    #[error("Message store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] anyhow::Error),
}

/// Delivers envelopes published for one device to that device's session.
///
/// Incoming deliveries are queued on a bounded per-connection queue; a writer
/// task frames and writes them, after first flushing whatever was stored for
/// the device while it was offline. A full queue or a failed write closes the
/// connection.
pub struct DeliveryConnection {
    weak_self: Weak<DeliveryConnection>,
    address: DeviceAddress,
    session: Arc<dyn ClientSession>,
    pubsub: Arc<PubSubManager>,
    store: Arc<dyn MessageStore>,
    state: AtomicU8,
    outbound: mpsc::Sender<Bytes>,
    receiver: Mutex<Option<mpsc::Receiver<Bytes>>>,
    closed: Notify,
}

impl DeliveryConnection {
    pub fn new(
        address: DeviceAddress,
        session: Arc<dyn ClientSession>,
        pubsub: Arc<PubSubManager>,
        store: Arc<dyn MessageStore>,
        queue_size: usize,
    ) -> Arc<Self> {
        let (outbound, receiver) = mpsc::channel(queue_size.max(1));
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            address,
            session,
            pubsub,
            store,
            state: AtomicU8::new(INACTIVE),
            outbound,
            receiver: Mutex::new(Some(receiver)),
            closed: Notify::new(),
        })
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from(self.state.load(Ordering::Acquire))
    }

    /// Announces the device on its connection-info channel, which cancels
    /// pending push fallbacks, then takes over the device channel.
    pub async fn activate(&self) -> Result<(), ConnectionError> {
        if let Err(state) =
            self.state
                .compare_exchange(INACTIVE, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
        {
            return Err(ConnectionError::InvalidState(state.into()));
        }
        let Some(this) = self.weak_self.upgrade() else {
            return Err(ConnectionError::InvalidState(ConnectionState::Closed));
        };

        let info = self.address.connection_info();
        if let Err(e) = self.pubsub.publish(&info, &PubSubEvent::Connected).await {
            warn!(target: "Dispatch/Connection", "Could not announce {info}: {e}");
        }

        if let Err(e) = self.pubsub.subscribe(&self.address, this.clone()).await {
            warn!(target: "Dispatch/Connection", "Could not subscribe {}: {e}", self.address);
            self.close().await;
            return Err(e.into());
        }
        // Closed while announcing; the deactivation found nothing to release.
        if self.state() != ConnectionState::Active {
            debug!(target: "Dispatch/Connection", "Connection for {} closed while activating", self.address);
            self.pubsub.unsubscribe(&self.address, self).await;
            return Err(ConnectionError::InvalidState(ConnectionState::Closed));
        }

        let receiver = self.receiver.lock().ok().and_then(|mut r| r.take());
        if let Some(receiver) = receiver {
            tokio::spawn(this.run_writer(receiver));
        }
        info!(target: "Dispatch/Connection", "Connection for {} is active", self.address);
        Ok(())
    }

    /// The session went away. Safe to call any number of times.
    pub async fn deactivate(&self) {
        if self.state.swap(CLOSED, Ordering::AcqRel) == CLOSED {
            return;
        }
        self.closed.notify_one();
        self.pubsub.unsubscribe(&self.address, self).await;
        debug!(target: "Dispatch/Connection", "Connection for {} deactivated", self.address);
    }

    /// Deactivates and drops the client's session.
    pub async fn close(&self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.deactivate().await;
        self.session.disconnect().await;
    }

    /// Publishes a KEEPALIVE on the device channel. If nobody received it the
    /// subscription was lost and the connection is closed, so the client
    /// reconnects and subscribes again.
    pub async fn verify_subscription(&self) -> bool {
        if self.state() != ConnectionState::Active {
            return false;
        }
        match self.pubsub.publish(&self.address, &PubSubEvent::KeepAlive).await {
            Ok(true) => true,
            Ok(false) => {
                warn!(target: "Dispatch/Connection", "No subscriber for {}, closing connection", self.address);
                self.close().await;
                false
            }
            Err(e) => {
                warn!(target: "Dispatch/Connection", "Keepalive for {} failed: {e}", self.address);
                true
            }
        }
    }

    fn enqueue(&self, content: Bytes) {
        if self.state() != ConnectionState::Active {
            self.store_later(content);
            return;
        }

        match self.outbound.try_send(content) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(content)) => {
                warn!(target: "Dispatch/Connection", "Outbound queue of {} is full, closing", self.address);
                self.store_later(content);
                if let Some(this) = self.weak_self.upgrade() {
                    tokio::spawn(async move { this.close().await });
                }
            }
            Err(mpsc::error::TrySendError::Closed(content)) => self.store_later(content),
        }
    }

    /// Keeps a delivery that reached this connection too late to be written.
    fn store_later(&self, content: Bytes) {
        let envelope = match decode_envelope(&content) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Dispatch/Connection", "Dropping undecodable delivery for {}: {e}", self.address);
                return;
            }
        };
        let store = self.store.clone();
        let address = self.address.clone();
        tokio::spawn(async move {
            if let Err(e) = store.store(&envelope, &address).await {
                warn!(target: "Dispatch/Connection", "Could not store delivery for {address}: {e}");
            }
        });
    }

    async fn run_writer(self: Arc<Self>, mut receiver: mpsc::Receiver<Bytes>) {
        if let Err(e) = self.write_all(&mut receiver).await {
            if self.state() == ConnectionState::Active {
                warn!(target: "Dispatch/Connection", "Write to {} failed: {e}", self.address);
                self.close().await;
            } else {
                debug!(target: "Dispatch/Connection", "Write to closed {} failed: {e}", self.address);
            }
        }

        // Anything still queued was acknowledged by the cache service as
        // delivered; keep it for the next connection.
        receiver.close();
        while let Ok(content) = receiver.try_recv() {
            self.store_later(content);
        }
        debug!(target: "Dispatch/Connection", "Writer for {} stopped", self.address);
    }

    async fn write_all(&self, receiver: &mut mpsc::Receiver<Bytes>) -> Result<(), ConnectionError> {
        self.drain_stored().await?;
        loop {
            let content = tokio::select! {
                biased;
                _ = self.closed.notified() => return Ok(()),
                content = receiver.recv() => match content {
                    Some(content) => content,
                    None => return Ok(()),
                },
            };
            match self.write(&content).await {
                Ok(()) => {}
                Err(ConnectionError::Framing(e)) => {
                    warn!(target: "Dispatch/Connection", "Dropping delivery for {}: {e}", self.address);
                }
                Err(e) => {
                    self.store_later(content);
                    return Err(e);
                }
            }
        }
    }

    async fn drain_stored(&self) -> Result<(), ConnectionError> {
        loop {
            let page = self.store.load_page(&self.address).await?;
            if page.messages.is_empty() {
                return Ok(());
            }
            debug!(target: "Dispatch/Connection", "Sending {} stored messages to {}", page.messages.len(), self.address);

            for stored in &page.messages {
                match self.write(&stored.envelope.encode_to_vec()).await {
                    Ok(()) => {}
                    // Could never be sent; retrying it would fail every reconnect.
                    Err(ConnectionError::Framing(e)) => {
                        warn!(target: "Dispatch/Connection", "Discarding stored message for {}: {e}", self.address);
                    }
                    Err(e) => return Err(e),
                }
                self.store
                    .remove(&self.address, stored.sender(), stored.timestamp())
                    .await?;
            }

            if !page.has_more {
                return Ok(());
            }
        }
    }

    async fn write(&self, content: &[u8]) -> Result<(), ConnectionError> {
        let frame = encode_frame(content)?;
        self.session.send(&frame).await?;
        trace!(target: "Dispatch/Connection", "Wrote {} bytes to {}", frame.len(), self.address);
        Ok(())
    }
}

#[async_trait]
impl DispatchChannel for DeliveryConnection {
    async fn on_dispatch_message(&self, channel: &str, data: &[u8]) {
        match PubSubEvent::decode(data) {
            Ok(PubSubEvent::Deliver(content)) => self.enqueue(content),
            Ok(PubSubEvent::KeepAlive) => trace!(target: "Dispatch/Connection", "Keepalive on {channel}"),
            Ok(PubSubEvent::Connected) => debug!(target: "Dispatch/Connection", "Ignoring CONNECTED on {channel}"),
            Ok(PubSubEvent::Unrecognized(kind)) => {
                warn!(target: "Dispatch/Connection", "Unknown pubsub event type {kind} on {channel}");
            }
            Err(e) => warn!(target: "Dispatch/Connection", "Bad pubsub message on {channel}: {e}"),
        }
    }

    fn on_dispatch_unsubscribed(&self, channel: &str) {
        debug!(target: "Dispatch/Connection", "Unsubscribed from {channel}");
    }
}
