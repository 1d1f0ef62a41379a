//! Real-time delivery fabric of a messaging server.
//!
//! Connected devices hold a subscription on a shared cache service; messages
//! are published to them from any process. Devices that are not connected get
//! their messages stored and, where possible, a push notification.

pub use dispatchcore::{address, event, proto, resp};

pub mod config;
pub mod context;
pub mod dispatch;
pub mod executor;
pub mod framing;
pub mod pubsub;
pub mod push;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod websocket;

pub use config::DispatchConfig;
pub use context::DispatchContext;
pub use dispatchcore::{ConnectionInfoAddress, DeviceAddress, PubSubAddress, PubSubEvent};
pub use executor::{BlockingExecutor, ExecutorError};
pub use pubsub::{PubSubError, PubSubManager};
