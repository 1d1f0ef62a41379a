//! Runtime-agnostic building blocks of the delivery fabric: the cache wire
//! codec, channel addressing and the pub/sub event model.

pub use dispatchproto as proto;

pub mod address;
pub mod event;
pub mod resp;

pub use address::{
    ChannelAddress, ChannelKind, ConnectionInfoAddress, DeviceAddress, InvalidAddressError,
    PubSubAddress, is_connection_info_channel,
};
pub use event::{EncodingError, PubSubEvent};
pub use resp::{ProtocolError, ReplyHeader, StringReplyHeader};
