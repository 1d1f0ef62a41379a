use crate::dispatch::{DispatchChannel, DispatchError, DispatchRouter, PubSubTransport};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use dispatchcore::{PubSubAddress, PubSubEvent, is_connection_info_channel};
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Channel {0} already has a local subscriber")]
    SubscriptionConflict(String),
    #[error("Dispatch transport error: {0}")]
    Transport(#[from] DispatchError),
}

/// Registry of local channel handlers.
///
/// Holds at most one handler per channel and keeps the cache-side
/// subscriptions in line with its contents. Incoming publishes are routed to
/// the channel's handler; device-channel publishes that nobody here handles go
/// to the dead-letter sink.
pub struct PubSubManager {
    transport: Arc<dyn PubSubTransport>,
    handlers: DashMap<String, Arc<dyn DispatchChannel>>,
    dead_letter: Option<Arc<dyn DispatchChannel>>,
}

impl PubSubManager {
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        dead_letter: Option<Arc<dyn DispatchChannel>>,
    ) -> Self {
        Self {
            transport,
            handlers: DashMap::new(),
            dead_letter,
        }
    }

    /// Starts the transport's receive loop with this registry as its router.
    pub fn start(self: &Arc<Self>) {
        self.transport.start(self.clone());
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }

    /// Registers `handler` for `address`. A channel that already has a
    /// handler is left untouched and the call fails.
    pub async fn subscribe(
        &self,
        address: &impl PubSubAddress,
        handler: Arc<dyn DispatchChannel>,
    ) -> Result<(), PubSubError> {
        let channel = address.serialize();

        match self.handlers.entry(channel.clone()) {
            Entry::Occupied(_) => {
                return Err(PubSubError::SubscriptionConflict(channel));
            }
            Entry::Vacant(entry) => {
                entry.insert(handler);
            }
        }

        debug!(target: "Dispatch/PubSub", "Subscribing {channel}");
        self.sync(&channel).await;
        Ok(())
    }

    /// Removes `handler` from `address`, but only if it is the handler
    /// currently registered there. Returns whether anything was removed.
    pub async fn unsubscribe(
        &self,
        address: &impl PubSubAddress,
        handler: &dyn DispatchChannel,
    ) -> bool {
        let channel = address.serialize();
        let removed = self
            .handlers
            .remove_if(&channel, |_, stored| same_handler(stored, handler))
            .is_some();

        if removed {
            debug!(target: "Dispatch/PubSub", "Unsubscribing {channel}");
            self.sync(&channel).await;
        } else {
            debug!(target: "Dispatch/PubSub", "Ignoring unsubscribe of {channel} by a handler that does not own it");
        }
        removed
    }

    /// Publishes `event`; `true` when at least one subscriber, in any process,
    /// received it.
    pub async fn publish(
        &self,
        address: &impl PubSubAddress,
        event: &PubSubEvent,
    ) -> Result<bool, PubSubError> {
        let receivers = self
            .transport
            .publish(&address.serialize(), &event.encode())
            .await?;
        Ok(receivers > 0)
    }

    pub fn has_local_subscriber(&self, address: &impl PubSubAddress) -> bool {
        self.handlers.contains_key(&address.serialize())
    }

    /// Whether `handler` is the one registered for `address`.
    pub fn is_subscribed_by(&self, address: &impl PubSubAddress, handler: &dyn DispatchChannel) -> bool {
        self.handlers
            .get(&address.serialize())
            .is_some_and(|stored| same_handler(stored.value(), handler))
    }

    /// Hands `event` straight to the local handler of `address`, skipping the
    /// cache service. Returns `false` when there is no local handler.
    pub async fn deliver_local(&self, address: &impl PubSubAddress, event: &PubSubEvent) -> bool {
        let channel = address.serialize();
        let Some(handler) = self.handler(&channel) else {
            return false;
        };
        handler.on_dispatch_message(&channel, &event.encode()).await;
        true
    }

    pub fn subscription_count(&self) -> usize {
        self.handlers.len()
    }

    // DashMap guards must not be held across an await.
    fn handler(&self, channel: &str) -> Option<Arc<dyn DispatchChannel>> {
        self.handlers.get(channel).map(|h| h.value().clone())
    }

    async fn sync(&self, channel: &str) {
        if let Err(e) = self.transport.sync_subscription(channel, self).await {
            // The transport resubscribes from the registry once it reconnects.
            warn!(target: "Dispatch/PubSub", "Failed to sync subscription for {channel}: {e}");
        }
    }
}

#[async_trait]
impl DispatchRouter for PubSubManager {
    fn is_subscribed(&self, channel: &str) -> bool {
        self.handlers.contains_key(channel)
    }

    fn subscribed_channels(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }

    async fn route(&self, channel: &str, data: &[u8]) {
        if let Some(handler) = self.handler(channel) {
            handler.on_dispatch_message(channel, data).await;
            return;
        }

        if is_connection_info_channel(channel) {
            debug!(target: "Dispatch/PubSub", "No subscriber for {channel}, dropping");
            return;
        }

        match &self.dead_letter {
            Some(dead_letter) => dead_letter.on_dispatch_message(channel, data).await,
            None => warn!(target: "Dispatch/PubSub", "No subscriber and no dead-letter sink for {channel}"),
        }
    }

    fn on_subscription_confirmed(&self, channel: &str, subscribed: bool) {
        let Some(handler) = self.handler(channel) else {
            return;
        };
        if subscribed {
            handler.on_dispatch_subscribed(channel);
        } else {
            handler.on_dispatch_unsubscribed(channel);
        }
    }
}

fn same_handler(stored: &Arc<dyn DispatchChannel>, handler: &dyn DispatchChannel) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(stored), std::ptr::from_ref(handler))
}
