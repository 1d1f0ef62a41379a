use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SEPARATOR: char = ':';
const CONNECTION_INFO_MARKER: &str = "c";
const CONNECTION_INFO_SUFFIX: &str = ":c";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidAddressError {
    #[error("Bad address: {0:?}")]
    Format(String),
    #[error("Unknown channel kind {kind:?} in {address:?}")]
    UnknownKind { kind: String, address: String },
    #[error("Bad device id in {address:?}: {reason}")]
    DeviceId { address: String, reason: String },
}

/// Anything that names a pub/sub channel.
pub trait PubSubAddress {
    fn serialize(&self) -> String;
}

/// A single device of an account, `<number>:<device id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    number: String,
    device_id: u64,
}

impl DeviceAddress {
    pub fn new(number: impl Into<String>, device_id: u64) -> Self {
        Self {
            number: number.into(),
            device_id,
        }
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn device_id(&self) -> u64 {
        self.device_id
    }

    pub fn connection_info(&self) -> ConnectionInfoAddress {
        ConnectionInfoAddress::new(self.clone())
    }
}

impl PubSubAddress for DeviceAddress {
    fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SEPARATOR}{}", self.number, self.device_id)
    }
}

impl FromStr for DeviceAddress {
    type Err = InvalidAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ChannelAddress::from_str(s)? {
            ChannelAddress {
                kind: ChannelKind::Device,
                device,
            } => Ok(device),
            _ => Err(InvalidAddressError::Format(s.to_string())),
        }
    }
}

/// Channel used for connect/disconnect announcements of a device,
/// `<number>:<device id>:c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfoAddress {
    address: DeviceAddress,
}

impl ConnectionInfoAddress {
    pub fn new(address: DeviceAddress) -> Self {
        Self { address }
    }

    pub fn device_address(&self) -> &DeviceAddress {
        &self.address
    }
}

impl PubSubAddress for ConnectionInfoAddress {
    fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ConnectionInfoAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{CONNECTION_INFO_SUFFIX}", self.address)
    }
}

impl FromStr for ConnectionInfoAddress {
    type Err = InvalidAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match ChannelAddress::from_str(s)? {
            ChannelAddress {
                kind: ChannelKind::ConnectionInfo,
                device,
            } => Ok(Self::new(device)),
            _ => Err(InvalidAddressError::Format(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Envelope delivery; also the key used for dead letters.
    Device,
    ConnectionInfo,
}

/// A parsed channel name of either kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    pub device: DeviceAddress,
    pub kind: ChannelKind,
}

impl ChannelAddress {
    pub fn new(device: DeviceAddress, kind: ChannelKind) -> Self {
        Self { device, kind }
    }
}

impl PubSubAddress for ChannelAddress {
    fn serialize(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChannelKind::Device => write!(f, "{}", self.device),
            ChannelKind::ConnectionInfo => write!(f, "{}{CONNECTION_INFO_SUFFIX}", self.device),
        }
    }
}

impl FromStr for ChannelAddress {
    type Err = InvalidAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(SEPARATOR).collect();

        let kind = match parts.as_slice() {
            [_, _] => ChannelKind::Device,
            [_, _, CONNECTION_INFO_MARKER] => ChannelKind::ConnectionInfo,
            [_, _, other] => {
                return Err(InvalidAddressError::UnknownKind {
                    kind: other.to_string(),
                    address: s.to_string(),
                });
            }
            _ => return Err(InvalidAddressError::Format(s.to_string())),
        };

        if parts[0].is_empty() {
            return Err(InvalidAddressError::Format(s.to_string()));
        }

        let device_id = parts[1]
            .parse::<u64>()
            .map_err(|e| InvalidAddressError::DeviceId {
                address: s.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            device: DeviceAddress::new(parts[0], device_id),
            kind,
        })
    }
}

impl From<DeviceAddress> for ChannelAddress {
    fn from(device: DeviceAddress) -> Self {
        Self::new(device, ChannelKind::Device)
    }
}

impl From<ConnectionInfoAddress> for ChannelAddress {
    fn from(info: ConnectionInfoAddress) -> Self {
        Self::new(info.address, ChannelKind::ConnectionInfo)
    }
}

/// Cheap check used to route incoming events without a full parse.
pub fn is_connection_info_channel(channel: &str) -> bool {
    channel.ends_with(CONNECTION_INFO_SUFFIX)
}
