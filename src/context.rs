use crate::config::DispatchConfig;
use crate::dispatch::{PubSubTransport, RedisDispatchTransport};
use crate::executor::BlockingExecutor;
use crate::pubsub::PubSubManager;
use crate::push::{FallbackScheduler, PushNotifier, PushSender, WebsocketSender};
use crate::storage::MessageStore;
use crate::websocket::{ClientSession, DeadLetterHandler, DeliveryConnection};
use dispatchcore::DeviceAddress;
use log::info;
use std::sync::Arc;

/// Owns every long-lived piece of the fabric and wires them together.
///
/// Built once at startup and passed to whatever accepts client sessions or
/// sends messages. Must be created inside a tokio runtime.
pub struct DispatchContext {
    pub config: DispatchConfig,
    pub pubsub: Arc<PubSubManager>,
    pub executor: Arc<BlockingExecutor>,
    pub store: Arc<dyn MessageStore>,
    pub fallback: Arc<FallbackScheduler>,
    pub websocket_sender: Arc<WebsocketSender>,
    pub push_sender: Arc<PushSender>,
}

impl DispatchContext {
    pub fn new(
        config: DispatchConfig,
        transport: Arc<dyn PubSubTransport>,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let executor = Arc::new(BlockingExecutor::new(
            config.push_workers,
            config.push_queue_size,
        ));
        let dead_letter = Arc::new(DeadLetterHandler::new(executor.clone(), store.clone()));
        let pubsub = Arc::new(PubSubManager::new(transport, Some(dead_letter)));
        let fallback = FallbackScheduler::new(
            notifier.clone(),
            pubsub.clone(),
            config.fallback_standard_delay(),
        );
        let websocket_sender = Arc::new(WebsocketSender::new(pubsub.clone(), store.clone()));
        let push_sender = Arc::new(PushSender::new(
            executor.clone(),
            websocket_sender.clone(),
            fallback.clone(),
            notifier,
            config.fallback_delay(),
        ));

        Self {
            config,
            pubsub,
            executor,
            store,
            fallback,
            websocket_sender,
            push_sender,
        }
    }

    /// A context talking to the cache service named in `config`.
    pub fn with_cache(
        config: DispatchConfig,
        store: Arc<dyn MessageStore>,
        notifier: Arc<dyn PushNotifier>,
    ) -> Self {
        let transport = Arc::new(RedisDispatchTransport::tcp(
            config.cache_address.clone(),
            config.transport_options(),
        ));
        Self::new(config, transport, store, notifier)
    }

    pub fn start(&self) {
        info!(target: "Dispatch/Context", "Starting dispatch against {}", self.config.cache_address);
        self.pubsub.start();
    }

    /// A delivery connection for a freshly authenticated session. The caller
    /// activates it, and deactivates it when the session ends.
    pub fn connection(
        &self,
        address: DeviceAddress,
        session: Arc<dyn ClientSession>,
    ) -> Arc<DeliveryConnection> {
        DeliveryConnection::new(
            address,
            session,
            self.pubsub.clone(),
            self.store.clone(),
            self.config.outbound_queue_size,
        )
    }

    pub async fn shutdown(&self) {
        self.pubsub.shutdown().await;
        self.executor.shutdown().await;
        info!(target: "Dispatch/Context", "Dispatch stopped");
    }
}
