use bytes::Bytes;
use dispatchproto::envelope::Envelope;
use dispatchproto::pubsub::PubSubMessage;
use dispatchproto::pubsub::pub_sub_message::Type;
use prost::Message;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("Bad pubsub message: {0}")]
    PubSub(String),
    #[error("Bad envelope: {0}")]
    Envelope(String),
}

/// Decoded form of a [`PubSubMessage`].
///
/// Unknown type numbers are kept as `Unrecognized` so newer peers can add
/// event types without breaking older ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    Connected,
    Deliver(Bytes),
    KeepAlive,
    Unrecognized(i32),
}

impl PubSubEvent {
    pub fn decode(data: &[u8]) -> Result<Self, EncodingError> {
        let message =
            PubSubMessage::decode(data).map_err(|e| EncodingError::PubSub(e.to_string()))?;
        Ok(Self::from(message))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_message().encode_to_vec()
    }

    pub fn to_message(&self) -> PubSubMessage {
        match self {
            Self::Connected => PubSubMessage {
                r#type: Type::Connected as i32,
                content: Vec::new(),
            },
            Self::Deliver(content) => PubSubMessage {
                r#type: Type::Deliver as i32,
                content: content.to_vec(),
            },
            Self::KeepAlive => PubSubMessage {
                r#type: Type::Keepalive as i32,
                content: Vec::new(),
            },
            Self::Unrecognized(value) => PubSubMessage {
                r#type: *value,
                content: Vec::new(),
            },
        }
    }

    pub fn deliver(envelope: &Envelope) -> Self {
        Self::Deliver(Bytes::from(envelope.encode_to_vec()))
    }
}

impl From<PubSubMessage> for PubSubEvent {
    fn from(message: PubSubMessage) -> Self {
        match Type::try_from(message.r#type) {
            Ok(Type::Connected) => Self::Connected,
            Ok(Type::Deliver) => Self::Deliver(Bytes::from(message.content)),
            Ok(Type::Keepalive) => Self::KeepAlive,
            Err(_) => Self::Unrecognized(message.r#type),
        }
    }
}

pub fn decode_envelope(data: &[u8]) -> Result<Envelope, EncodingError> {
    Envelope::decode(data).map_err(|e| EncodingError::Envelope(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_has_empty_payload() {
        let encoded = PubSubEvent::Connected.encode();
        let message = PubSubMessage::decode(encoded.as_slice()).unwrap();
        assert_eq!(message.r#type, 0);
        assert!(message.content.is_empty());
        assert_eq!(
            PubSubEvent::decode(&encoded).unwrap(),
            PubSubEvent::Connected
        );
    }

    #[test]
    fn test_deliver_carries_envelope() {
        let envelope = Envelope {
            source: Some("+14151111111".into()),
            source_device: Some(1),
            timestamp: Some(1234),
            content: Some(vec![1, 2, 3]),
            ..Default::default()
        };

        let event = PubSubEvent::deliver(&envelope);
        let decoded = PubSubEvent::decode(&event.encode()).unwrap();

        match decoded {
            PubSubEvent::Deliver(bytes) => {
                assert_eq!(decode_envelope(&bytes).unwrap(), envelope);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_is_not_fatal() {
        let message = PubSubMessage {
            r#type: 42,
            content: vec![9],
        };
        let decoded = PubSubEvent::decode(&message.encode_to_vec()).unwrap();
        assert_eq!(decoded, PubSubEvent::Unrecognized(42));
    }

    #[test]
    fn test_garbage_is_an_encoding_error() {
        assert!(matches!(
            PubSubEvent::decode(&[0xff, 0xff, 0xff]),
            Err(EncodingError::PubSub(_))
        ));
    }
}
