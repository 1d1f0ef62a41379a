//! The device side of the fabric: live client connections and the sink for
//! deliveries that found none.

pub mod connection;
pub mod dead_letter;
pub mod session;

pub use connection::{ConnectionError, ConnectionState, DeliveryConnection};
pub use dead_letter::DeadLetterHandler;
pub use session::ClientSession;
