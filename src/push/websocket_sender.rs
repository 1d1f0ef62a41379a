use crate::pubsub::PubSubManager;
use crate::storage::{self, MessageStore};
use dispatchcore::proto::envelope::Envelope;
use dispatchcore::{DeviceAddress, PubSubEvent};
use log::{debug, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// A live connection, here or in another process, took the envelope.
    Delivered,
    /// Nobody was connected; the envelope was stored under this id.
    Stored(u64),
    /// Nobody was connected and the envelope was not worth keeping.
    Dropped,
}

impl DeliveryStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// Delivers envelopes to connected devices and stores the rest.
pub struct WebsocketSender {
    pubsub: Arc<PubSubManager>,
    store: Arc<dyn MessageStore>,
}

impl WebsocketSender {
    pub fn new(pubsub: Arc<PubSubManager>, store: Arc<dyn MessageStore>) -> Self {
        Self { pubsub, store }
    }

    /// Hands `envelope` to the device's connection, locally if it is attached
    /// to this process, otherwise over the cache service. When no connection
    /// took it, it is stored unless `online_only` is set.
    pub async fn send_message(
        &self,
        device: &DeviceAddress,
        envelope: &Envelope,
        online_only: bool,
    ) -> storage::Result<DeliveryStatus> {
        let event = PubSubEvent::deliver(envelope);

        if self.pubsub.deliver_local(device, &event).await {
            debug!(target: "Dispatch/Websocket", "Delivered to {device} locally");
            return Ok(DeliveryStatus::Delivered);
        }

        match self.pubsub.publish(device, &event).await {
            Ok(true) => {
                debug!(target: "Dispatch/Websocket", "Delivered to {device} through the cache service");
                return Ok(DeliveryStatus::Delivered);
            }
            Ok(false) => {}
            Err(e) => warn!(target: "Dispatch/Websocket", "Publish to {device} failed, treating as offline: {e}"),
        }

        if online_only {
            return Ok(DeliveryStatus::Dropped);
        }

        let id = self.store.store(envelope, device).await?;
        debug!(target: "Dispatch/Websocket", "Stored message {id} for {device}");
        Ok(DeliveryStatus::Stored(id))
    }
}
