//! Outbound delivery: the local/cross-process websocket path, the push
//! notification path, and the APN wake-up fallback that ties them together.

pub mod fallback;
pub mod sender;
pub mod websocket_sender;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use fallback::{FallbackHandle, FallbackScheduler, FallbackState, FallbackTask};
pub use sender::{DeviceTarget, PushRoute, PushSender};
pub use websocket_sender::{DeliveryStatus, WebsocketSender};

/// Expiration used for the final, standard push of a fallback: effectively
/// "never expires" for the push gateway.
pub const MAX_EXPIRATION: u64 = i32::MAX as u64 * 1000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PushError {
    /// The push id is no longer registered with the gateway. Never retried.
    #[error("Device {0} is not registered for push")]
    NotRegistered(String),
    #[error("Push transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApnMessage {
    pub apn_id: String,
    pub number: String,
    pub device_id: u64,
    pub message: String,
    pub is_voip: bool,
    pub expiration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GcmMessage {
    pub gcm_id: String,
    pub number: String,
    pub device_id: u64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "service", rename_all = "lowercase")]
pub enum PushNotification {
    Apn(ApnMessage),
    Gcm(GcmMessage),
}

impl PushNotification {
    pub fn push_id(&self) -> &str {
        match self {
            Self::Apn(m) => &m.apn_id,
            Self::Gcm(m) => &m.gcm_id,
        }
    }
}

/// Gateway to the platform push services.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn send_push(&self, notification: PushNotification) -> Result<(), PushError>;
}
