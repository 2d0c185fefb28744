//! btleplug Platform Binding
//!
//! Thin adapter from the synchronous [`GattTransport`] seam to btleplug's
//! async API. Each accepted request is spawned on the runtime and its outcome
//! is posted back to the link as a [`TransportEvent`].
//!
//! btleplug leaves pairing, MTU exchange and adapter power to the OS, so
//! peripherals always report as bonded, MTU requests complete immediately as
//! unsupported and a power cycle only resets the local session.

use crate::domain::models::{BondState, CharacteristicAddress, PeripheralId};
use crate::infrastructure::bluetooth::protocol::DEFAULT_MTU;
use crate::infrastructure::bluetooth::service::LinkHandle;
use crate::infrastructure::bluetooth::transport::{
    GattStatus, GattTransport, TransportError, TransportEvent, WriteMode,
};
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type PlatformId = btleplug::platform::PeripheralId;

/// Peripherals seen while scanning, keyed by the platform peripheral id.
///
/// CoreBluetooth hides hardware addresses, so they cannot tell devices apart.
struct Discovered<P> {
    peripherals: HashMap<PeripheralId, P>,
}

impl<P> Default for Discovered<P> {
    fn default() -> Self {
        Self {
            peripherals: HashMap::new(),
        }
    }
}

impl<P: Clone> Discovered<P> {
    fn record(&mut self, id: &impl fmt::Display, peripheral: P) -> PeripheralId {
        let key = PeripheralId::new(id.to_string());
        self.peripherals.insert(key.clone(), peripheral);
        key
    }

    fn get(&self, key: &PeripheralId) -> Option<P> {
        self.peripherals.get(key).cloned()
    }
}

#[derive(Default)]
struct Shared {
    discovered: Discovered<Peripheral>,
    /// Platform id of the peripheral with an open session.
    connected: Option<PlatformId>,
    characteristics: BTreeSet<Characteristic>,
}

/// [`GattTransport`] backed by the first system Bluetooth adapter.
pub struct BtleplugTransport {
    adapter: Adapter,
    link: LinkHandle,
    shared: Arc<Mutex<Shared>>,
    session: Option<Peripheral>,
    session_tasks: Vec<JoinHandle<()>>,
    watcher: JoinHandle<()>,
    powered: bool,
}

impl BtleplugTransport {
    pub async fn new(link: LinkHandle) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        info!(adapter = %adapter.adapter_info().await?, "Using Bluetooth adapter");

        let shared = Arc::new(Mutex::new(Shared::default()));
        let events = adapter.events().await?;
        let watcher = tokio::spawn(watch_adapter(
            adapter.clone(),
            events,
            shared.clone(),
            link.clone(),
        ));

        Ok(Self {
            adapter,
            link,
            shared,
            session: None,
            session_tasks: Vec::new(),
            watcher,
            powered: true,
        })
    }

    fn characteristic(
        &self,
        address: &CharacteristicAddress,
    ) -> Result<Characteristic, TransportError> {
        let shared = self.shared.lock().map_err(|_| lock_error())?;
        shared
            .characteristics
            .iter()
            .find(|c| c.service_uuid == address.service && c.uuid == address.characteristic)
            .cloned()
            .ok_or(TransportError::Unavailable(*address))
    }

    fn peripheral(&self) -> Result<Peripheral, TransportError> {
        self.session.clone().ok_or(TransportError::NotConnected)
    }

    fn reset_session(&mut self) {
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
        if let Ok(mut shared) = self.shared.lock() {
            shared.connected = None;
            shared.characteristics.clear();
        }
        if let Some(peripheral) = self.session.take() {
            tokio::spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect failed: {}", e);
                }
            });
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        for task in self.session_tasks.drain(..) {
            task.abort();
        }
    }
}

impl GattTransport for BtleplugTransport {
    fn is_adapter_enabled(&self) -> bool {
        self.powered
    }

    fn enable_adapter(&mut self) -> Result<(), TransportError> {
        self.powered = true;
        Ok(())
    }

    fn disable_adapter(&mut self) -> Result<(), TransportError> {
        warn!("Adapter power is managed by the OS, resetting session instead");
        self.reset_session();
        self.powered = false;
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), TransportError> {
        if !self.powered {
            return Err(TransportError::AdapterDisabled);
        }
        let adapter = self.adapter.clone();
        let link = self.link.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Scan failed: {}", e);
                link.dispatch(TransportEvent::ScanFailed { code: -1 });
            }
        });
        Ok(())
    }

    fn stop_scan(&mut self) {
        let adapter = self.adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = adapter.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });
    }

    fn bond_state(&self, _peripheral: &PeripheralId) -> BondState {
        BondState::Bonded
    }

    fn create_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.link.dispatch(TransportEvent::BondStateChanged {
            peripheral: peripheral.clone(),
            previous: BondState::Bonding,
            current: BondState::Bonded,
        });
        Ok(())
    }

    fn remove_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        info!(%peripheral, "Bond removal is left to the OS pairing settings");
        Ok(())
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        let target = {
            let shared = self.shared.lock().map_err(|_| lock_error())?;
            shared
                .discovered
                .get(peripheral)
                .ok_or_else(|| TransportError::UnknownPeripheral(peripheral.clone()))?
        };
        self.reset_session();

        if let Ok(mut shared) = self.shared.lock() {
            shared.connected = Some(target.id());
        }
        self.session = Some(target.clone());

        let link = self.link.clone();
        let shared = self.shared.clone();
        self.session_tasks.push(tokio::spawn(async move {
            match target.connect().await {
                Ok(()) => {
                    link.dispatch(TransportEvent::ConnectionStateChanged {
                        status: GattStatus::SUCCESS,
                        connected: true,
                    });
                    forward_notifications(target, shared, link).await;
                }
                Err(e) => {
                    warn!("Connect failed: {}", e);
                    link.dispatch(TransportEvent::ConnectionStateChanged {
                        status: GattStatus::FAILURE,
                        connected: false,
                    });
                }
            }
        }));
        Ok(())
    }

    fn close(&mut self) {
        self.reset_session();
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        debug!(mtu, "MTU exchange is negotiated by the OS");
        self.link.dispatch(TransportEvent::MtuChanged {
            mtu: DEFAULT_MTU,
            status: GattStatus::REQUEST_NOT_SUPPORTED,
        });
        Ok(())
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let link = self.link.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let status = match peripheral.discover_services().await {
                Ok(()) => {
                    let found = peripheral.characteristics();
                    debug!(count = found.len(), "Characteristics discovered");
                    if let Ok(mut shared) = shared.lock() {
                        shared.characteristics = found;
                    }
                    GattStatus::SUCCESS
                }
                Err(e) => {
                    warn!("Service discovery failed: {}", e);
                    GattStatus::GATT_ERROR
                }
            };
            link.dispatch(TransportEvent::ServicesDiscovered { status });
        });
        Ok(())
    }

    fn has_service(&self, service: &Uuid) -> bool {
        self.shared
            .lock()
            .map(|shared| shared.characteristics.iter().any(|c| c.service_uuid == *service))
            .unwrap_or(false)
    }

    fn has_characteristic(&self, address: &CharacteristicAddress) -> bool {
        self.characteristic(address).is_ok()
    }

    fn enable_notifications(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), TransportError> {
        self.characteristic(address).map(|_| ())
    }

    fn write_descriptor(
        &mut self,
        address: &CharacteristicAddress,
        descriptor: Uuid,
        _value: &[u8],
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(address)?;
        let address = *address;
        let link = self.link.clone();
        debug!(%address, %descriptor, "Subscribing");
        tokio::spawn(async move {
            let status = match peripheral.subscribe(&characteristic).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!(%address, "Subscribe failed: {}", e);
                    GattStatus::GATT_ERROR
                }
            };
            link.dispatch(TransportEvent::DescriptorWritten { address, status });
        });
        Ok(())
    }

    fn write_characteristic(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(address)?;
        let address = *address;
        let value = value.to_vec();
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        let link = self.link.clone();
        tokio::spawn(async move {
            let status = match peripheral.write(&characteristic, &value, write_type).await {
                Ok(()) => GattStatus::SUCCESS,
                Err(e) => {
                    warn!(%address, "Write failed: {}", e);
                    GattStatus::GATT_ERROR
                }
            };
            link.dispatch(TransportEvent::CharacteristicWritten { address, status });
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral()?;
        let characteristic = self.characteristic(address)?;
        let address = *address;
        let link = self.link.clone();
        tokio::spawn(async move {
            let (value, status) = match peripheral.read(&characteristic).await {
                Ok(value) => (value, GattStatus::SUCCESS),
                Err(e) => {
                    warn!(%address, "Read failed: {}", e);
                    (Vec::new(), GattStatus::GATT_ERROR)
                }
            };
            link.dispatch(TransportEvent::CharacteristicRead {
                address,
                value,
                status,
            });
        });
        Ok(())
    }
}

fn lock_error() -> TransportError {
    TransportError::Rejected("transport state lock poisoned".to_string())
}

/// Turn adapter events into scan results and disconnect callbacks.
async fn watch_adapter(
    adapter: Adapter,
    mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    shared: Arc<Mutex<Shared>>,
    link: LinkHandle,
) {
    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let name = match peripheral.properties().await {
                    Ok(properties) => properties.and_then(|p| p.local_name),
                    Err(e) => {
                        debug!("No properties for {:?}: {}", id, e);
                        None
                    }
                };
                let peripheral_id = match shared.lock() {
                    Ok(mut shared) => shared.discovered.record(&id, peripheral),
                    Err(_) => continue,
                };
                if !link.dispatch(TransportEvent::ScanResult {
                    peripheral: peripheral_id,
                    name,
                }) {
                    break;
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let ours = shared
                    .lock()
                    .map(|shared| shared.connected.as_ref() == Some(&id))
                    .unwrap_or(false);
                if ours {
                    info!("Peripheral {:?} disconnected", id);
                    link.dispatch(TransportEvent::ConnectionStateChanged {
                        status: GattStatus::FAILURE,
                        connected: false,
                    });
                }
            }
            _ => {}
        }
    }
    debug!("Adapter event stream ended");
}

async fn forward_notifications(peripheral: Peripheral, shared: Arc<Mutex<Shared>>, link: LinkHandle) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not get notification stream: {}", e);
            return;
        }
    };

    while let Some(notification) = notifications.next().await {
        let service = shared.lock().ok().and_then(|shared| {
            shared
                .characteristics
                .iter()
                .find(|c| c.uuid == notification.uuid)
                .map(|c| c.service_uuid)
        });
        let Some(service) = service else {
            debug!(uuid = %notification.uuid, "Notification from unknown characteristic");
            continue;
        };
        let address = CharacteristicAddress::new(service, notification.uuid);
        if !link.dispatch(TransportEvent::CharacteristicChanged {
            address,
            value: notification.value,
        }) {
            break;
        }
    }
}
