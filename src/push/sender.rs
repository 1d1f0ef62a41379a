use super::fallback::{FallbackScheduler, FallbackTask};
use super::websocket_sender::{DeliveryStatus, WebsocketSender};
use super::{ApnMessage, GcmMessage, MAX_EXPIRATION, PushError, PushNotification, PushNotifier};
use crate::executor::{BlockingExecutor, ExecutorError};
use dispatchcore::DeviceAddress;
use dispatchcore::proto::envelope::Envelope;
use log::{debug, error, warn};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Lifetime of a wake push at the gateway; a late wake-up is useless.
const WAKE_PUSH_TTL: Duration = Duration::from_secs(30);

/// How a device is reached when it has no live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushRoute {
    /// The device polls; nothing to push.
    FetchOnly,
    Gcm {
        gcm_id: String,
    },
    Apn {
        apn_id: String,
        voip_apn_id: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    pub address: DeviceAddress,
    pub route: PushRoute,
}

impl DeviceTarget {
    pub fn new(address: DeviceAddress, route: PushRoute) -> Self {
        Self { address, route }
    }
}

/// Sends envelopes to devices: over a live connection when there is one,
/// otherwise by storing them and nudging the device with a push.
///
/// All work runs on the dispatch executor, so a slow push gateway slows down
/// submitters instead of piling up unbounded work.
pub struct PushSender {
    executor: Arc<BlockingExecutor>,
    websocket: Arc<WebsocketSender>,
    fallback: Arc<FallbackScheduler>,
    notifier: Arc<dyn PushNotifier>,
    fallback_delay: Duration,
}

impl PushSender {
    pub fn new(
        executor: Arc<BlockingExecutor>,
        websocket: Arc<WebsocketSender>,
        fallback: Arc<FallbackScheduler>,
        notifier: Arc<dyn PushNotifier>,
        fallback_delay: Duration,
    ) -> Self {
        Self {
            executor,
            websocket,
            fallback,
            notifier,
            fallback_delay,
        }
    }

    /// Queues delivery of `envelope` to `target`. Waits while the executor is
    /// full.
    pub async fn send_message(
        self: &Arc<Self>,
        target: DeviceTarget,
        envelope: Envelope,
    ) -> Result<(), ExecutorError> {
        let this = self.clone();
        self.executor
            .submit(async move { this.deliver(&target, &envelope).await })
            .await
    }

    async fn deliver(&self, target: &DeviceTarget, envelope: &Envelope) {
        let address = &target.address;
        let status = match self.websocket.send_message(address, envelope, false).await {
            Ok(status) => status,
            Err(e) => {
                error!(target: "Dispatch/Push", "Could not deliver or store message for {address}: {e}");
                return;
            }
        };

        if status == DeliveryStatus::Delivered {
            return;
        }

        match &target.route {
            PushRoute::FetchOnly => {
                debug!(target: "Dispatch/Push", "{address} fetches its messages, no push");
            }
            PushRoute::Gcm { gcm_id } => {
                let notification = PushNotification::Gcm(GcmMessage {
                    gcm_id: gcm_id.clone(),
                    number: address.number().to_string(),
                    device_id: address.device_id(),
                    message: notification_payload(envelope),
                });
                self.send_push(address, notification).await;
            }
            PushRoute::Apn {
                apn_id,
                voip_apn_id: Some(voip_apn_id),
            } => {
                let message = ApnMessage {
                    apn_id: apn_id.clone(),
                    number: address.number().to_string(),
                    device_id: address.device_id(),
                    message: notification_payload(envelope),
                    is_voip: true,
                    expiration: wake_expiration(),
                };
                let task = FallbackTask::new(apn_id.clone(), voip_apn_id.clone(), message, self.fallback_delay);
                self.fallback.schedule(address, task).await;
            }
            PushRoute::Apn {
                apn_id,
                voip_apn_id: None,
            } => {
                let notification = PushNotification::Apn(ApnMessage {
                    apn_id: apn_id.clone(),
                    number: address.number().to_string(),
                    device_id: address.device_id(),
                    message: notification_payload(envelope),
                    is_voip: false,
                    expiration: MAX_EXPIRATION,
                });
                self.send_push(address, notification).await;
            }
        }
    }

    async fn send_push(&self, address: &DeviceAddress, notification: PushNotification) {
        match self.notifier.send_push(notification).await {
            Ok(()) => debug!(target: "Dispatch/Push", "Pushed {address}"),
            Err(PushError::NotRegistered(id)) => {
                warn!(target: "Dispatch/Push", "Push id {id} of {address} is not registered");
            }
            Err(e) => warn!(target: "Dispatch/Push", "Push to {address} failed: {e}"),
        }
    }
}

fn notification_payload(envelope: &Envelope) -> String {
    json!({
        "alert": { "loc-key": "APN_Message" },
        "sound": "default",
        "source": envelope.source(),
        "timestamp": envelope.timestamp(),
    })
    .to_string()
}

fn wake_expiration() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now + WAKE_PUSH_TTL).as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload_is_json() {
        let envelope = Envelope {
            source: Some("+14151111111".into()),
            timestamp: Some(42),
            ..Default::default()
        };
        let payload: serde_json::Value = serde_json::from_str(&notification_payload(&envelope)).unwrap();
        assert_eq!(payload["source"], "+14151111111");
        assert_eq!(payload["timestamp"], 42);
        assert_eq!(payload["alert"]["loc-key"], "APN_Message");
    }

    #[test]
    fn test_wake_expiration_is_in_the_future() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64;
        let expiration = wake_expiration();
        assert!(expiration > now && expiration <= now + WAKE_PUSH_TTL.as_millis() as u64 + 1000);
    }
}
