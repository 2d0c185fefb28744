//! GATT Transport Seam
//!
//! Outbound operations are a synchronous submission API: each call only says
//! whether the platform accepted the request. The outcome arrives later as a
//! [`TransportEvent`] posted back to the link.

use crate::domain::models::{BondState, CharacteristicAddress, PeripheralId};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("bluetooth adapter is disabled")]
    AdapterDisabled,
    #[error("no GATT session is open")]
    NotConnected,
    #[error("characteristic {0} is not available")]
    Unavailable(CharacteristicAddress),
    #[error("peripheral {0} is unknown")]
    UnknownPeripheral(PeripheralId),
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Platform status code attached to GATT callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: Self = Self(0x00);
    pub const REQUEST_NOT_SUPPORTED: Self = Self(0x06);
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);
    pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
    pub const LOCAL_HOST_TERMINATED: Self = Self(0x16);
    pub const GATT_ERROR: Self = Self(0x85);
    pub const FAILURE: Self = Self(0x101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Disconnect reasons after which the peer no longer honours our bond.
    pub fn indicates_revoked_bond(self) -> bool {
        self == Self::REMOTE_USER_TERMINATED || self == Self::GATT_ERROR
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Platform BLE central operations used by the link.
pub trait GattTransport {
    fn is_adapter_enabled(&self) -> bool;
    fn enable_adapter(&mut self) -> Result<(), TransportError>;
    fn disable_adapter(&mut self) -> Result<(), TransportError>;

    fn start_scan(&mut self) -> Result<(), TransportError>;
    fn stop_scan(&mut self);

    fn bond_state(&self, peripheral: &PeripheralId) -> BondState;
    fn create_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    fn remove_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;

    /// Open a GATT session. Completion: [`TransportEvent::ConnectionStateChanged`].
    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError>;
    /// Release the GATT session. No event follows.
    fn close(&mut self);

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError>;
    fn discover_services(&mut self) -> Result<(), TransportError>;
    fn has_service(&self, service: &Uuid) -> bool;
    fn has_characteristic(&self, address: &CharacteristicAddress) -> bool;

    /// Route local notification delivery for `address`.
    fn enable_notifications(&mut self, address: &CharacteristicAddress)
        -> Result<(), TransportError>;
    /// Completion: [`TransportEvent::DescriptorWritten`].
    fn write_descriptor(
        &mut self,
        address: &CharacteristicAddress,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError>;
    /// Completion: [`TransportEvent::CharacteristicWritten`].
    fn write_characteristic(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;
    /// Completion: [`TransportEvent::CharacteristicRead`].
    fn read_characteristic(&mut self, address: &CharacteristicAddress)
        -> Result<(), TransportError>;
}

/// One variant per platform callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ScanResult {
        peripheral: PeripheralId,
        name: Option<String>,
    },
    ScanFailed {
        code: i32,
    },
    BondStateChanged {
        peripheral: PeripheralId,
        previous: BondState,
        current: BondState,
    },
    ConnectionStateChanged {
        status: GattStatus,
        connected: bool,
    },
    MtuChanged {
        mtu: u16,
        status: GattStatus,
    },
    ServicesDiscovered {
        status: GattStatus,
    },
    DescriptorWritten {
        address: CharacteristicAddress,
        status: GattStatus,
    },
    CharacteristicWritten {
        address: CharacteristicAddress,
        status: GattStatus,
    },
    CharacteristicRead {
        address: CharacteristicAddress,
        value: Vec<u8>,
        status: GattStatus,
    },
    CharacteristicChanged {
        address: CharacteristicAddress,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    /// Events consumed by the discovery controller rather than the session.
    pub fn is_discovery_event(&self) -> bool {
        matches!(self, Self::ScanResult { .. } | Self::ScanFailed { .. })
    }
}
