use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Externally visible state of the link to the peripheral.
///
/// `Stopped` is absorbing: once the link is closed it never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Stopped,
    Disconnected,
    Bonding,
    Connecting,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Disconnected => "disconnected",
            Self::Bonding => "bonding",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// Routing key for a GATT characteristic: (service, characteristic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CharacteristicAddress {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicAddress {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Platform identifier of a remote peripheral (MAC address or platform id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pairing state reported by the platform for a peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondState {
    None,
    Bonding,
    Bonded,
}

/// Events published to session observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    DeviceFound(PeripheralId),
    BondFailed(PeripheralId),
    Disconnected,
    ConnectionError { consecutive_failures: u32 },
}
