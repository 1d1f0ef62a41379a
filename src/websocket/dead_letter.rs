use crate::dispatch::DispatchChannel;
use crate::executor::BlockingExecutor;
use crate::storage::MessageStore;
use async_trait::async_trait;
use dispatchcore::event::decode_envelope;
use dispatchcore::{DeviceAddress, PubSubEvent, is_connection_info_channel};
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Stores deliveries published to a device channel that no connection in this
/// process holds.
///
/// Connection-info channels are ignored; their events only matter to live
/// listeners.
pub struct DeadLetterHandler {
    executor: Arc<BlockingExecutor>,
    store: Arc<dyn MessageStore>,
}

impl DeadLetterHandler {
    pub fn new(executor: Arc<BlockingExecutor>, store: Arc<dyn MessageStore>) -> Self {
        Self { executor, store }
    }
}

#[async_trait]
impl DispatchChannel for DeadLetterHandler {
    async fn on_dispatch_message(&self, channel: &str, data: &[u8]) {
        if is_connection_info_channel(channel) {
            return;
        }
        info!(target: "Dispatch/DeadLetter", "Handling dead letter to {channel}");

        let address = match channel.parse::<DeviceAddress>() {
            Ok(address) => address,
            Err(e) => {
                warn!(target: "Dispatch/DeadLetter", "Invalid device address: {e}");
                return;
            }
        };

        let content = match PubSubEvent::decode(data) {
            Ok(PubSubEvent::Deliver(content)) => content,
            Ok(other) => {
                debug!(target: "Dispatch/DeadLetter", "Ignoring {other:?} to {channel}");
                return;
            }
            Err(e) => {
                warn!(target: "Dispatch/DeadLetter", "Bad pubsub message: {e}");
                return;
            }
        };

        let envelope = match decode_envelope(&content) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "Dispatch/DeadLetter", "Bad envelope to {channel}: {e}");
                return;
            }
        };

        let store = self.store.clone();
        let submitted = self
            .executor
            .submit(async move {
                if let Err(e) = store.store(&envelope, &address).await {
                    error!(target: "Dispatch/DeadLetter", "Could not store dead letter for {address}: {e}");
                }
            })
            .await;
        if let Err(e) = submitted {
            error!(target: "Dispatch/DeadLetter", "Dropping dead letter to {channel}: {e}");
        }
    }

    fn on_dispatch_subscribed(&self, channel: &str) {
        warn!(target: "Dispatch/DeadLetter", "Dead-letter sink got a subscription notice for {channel}");
    }

    fn on_dispatch_unsubscribed(&self, channel: &str) {
        warn!(target: "Dispatch/DeadLetter", "Dead-letter sink got an unsubscribe notice for {channel}");
    }
}
