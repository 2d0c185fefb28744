//! Recording transport and plugin used by the link tests.

use crate::domain::command::Command;
use crate::domain::models::{BondState, CharacteristicAddress, PeripheralId};
use crate::infrastructure::bluetooth::plugin::{CommandHandle, ServiceContract, ServiceManager};
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportError, WriteMode};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    EnableAdapter,
    DisableAdapter,
    StartScan,
    StopScan,
    CreateBond(PeripheralId),
    RemoveBond(PeripheralId),
    Connect(PeripheralId),
    Close,
    RequestMtu(u16),
    DiscoverServices,
    EnableNotifications(CharacteristicAddress),
    WriteDescriptor(CharacteristicAddress, Uuid, Vec<u8>),
    Write(CharacteristicAddress, Vec<u8>, WriteMode),
    Read(CharacteristicAddress),
}

/// Failure counters hold how many upcoming submissions to reject.
#[derive(Debug)]
pub(crate) struct MockTransport {
    pub adapter_enabled: bool,
    pub bond: BondState,
    pub services: Vec<Uuid>,
    pub characteristics: Vec<CharacteristicAddress>,
    pub calls: Vec<Call>,
    pub fail_scan: u32,
    pub fail_bond: u32,
    pub fail_connect: u32,
    pub fail_mtu: u32,
    pub fail_discovery: u32,
    pub fail_subscribe: u32,
    pub fail_operation: u32,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            adapter_enabled: true,
            bond: BondState::Bonded,
            services: Vec::new(),
            characteristics: Vec::new(),
            calls: Vec::new(),
            fail_scan: 0,
            fail_bond: 0,
            fail_connect: 0,
            fail_mtu: 0,
            fail_discovery: 0,
            fail_subscribe: 0,
            fail_operation: 0,
        }
    }
}

impl MockTransport {
    pub fn with_service(mut self, service: Uuid, characteristics: &[CharacteristicAddress]) -> Self {
        self.services.push(service);
        self.characteristics.extend_from_slice(characteristics);
        self
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn count_where(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|c| predicate(c)).count()
    }

    fn take_failure(counter: &mut u32) -> Result<(), TransportError> {
        if *counter > 0 {
            *counter -= 1;
            return Err(TransportError::Rejected("mock failure".to_string()));
        }
        Ok(())
    }
}

impl GattTransport for MockTransport {
    fn is_adapter_enabled(&self) -> bool {
        self.adapter_enabled
    }

    fn enable_adapter(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::EnableAdapter);
        self.adapter_enabled = true;
        Ok(())
    }

    fn disable_adapter(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::DisableAdapter);
        self.adapter_enabled = false;
        Ok(())
    }

    fn start_scan(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::StartScan);
        Self::take_failure(&mut self.fail_scan)
    }

    fn stop_scan(&mut self) {
        self.calls.push(Call::StopScan);
    }

    fn bond_state(&self, _peripheral: &PeripheralId) -> BondState {
        self.bond
    }

    fn create_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.calls.push(Call::CreateBond(peripheral.clone()));
        Self::take_failure(&mut self.fail_bond)
    }

    fn remove_bond(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.calls.push(Call::RemoveBond(peripheral.clone()));
        self.bond = BondState::None;
        Ok(())
    }

    fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), TransportError> {
        self.calls.push(Call::Connect(peripheral.clone()));
        Self::take_failure(&mut self.fail_connect)
    }

    fn close(&mut self) {
        self.calls.push(Call::Close);
    }

    fn request_mtu(&mut self, mtu: u16) -> Result<(), TransportError> {
        self.calls.push(Call::RequestMtu(mtu));
        Self::take_failure(&mut self.fail_mtu)
    }

    fn discover_services(&mut self) -> Result<(), TransportError> {
        self.calls.push(Call::DiscoverServices);
        Self::take_failure(&mut self.fail_discovery)
    }

    fn has_service(&self, service: &Uuid) -> bool {
        self.services.contains(service)
    }

    fn has_characteristic(&self, address: &CharacteristicAddress) -> bool {
        self.characteristics.contains(address)
    }

    fn enable_notifications(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::EnableNotifications(*address));
        Ok(())
    }

    fn write_descriptor(
        &mut self,
        address: &CharacteristicAddress,
        descriptor: Uuid,
        value: &[u8],
    ) -> Result<(), TransportError> {
        self.calls
            .push(Call::WriteDescriptor(*address, descriptor, value.to_vec()));
        Self::take_failure(&mut self.fail_subscribe)
    }

    fn write_characteristic(
        &mut self,
        address: &CharacteristicAddress,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::Write(*address, value.to_vec(), mode));
        Self::take_failure(&mut self.fail_operation)
    }

    fn read_characteristic(
        &mut self,
        address: &CharacteristicAddress,
    ) -> Result<(), TransportError> {
        self.calls.push(Call::Read(*address));
        Self::take_failure(&mut self.fail_operation)
    }
}

/// Everything a [`RecordingManager`] saw, shared with the test body.
#[derive(Debug, Default)]
pub(crate) struct Recording {
    pub handled: Vec<(CharacteristicAddress, Vec<u8>)>,
    pub exhausted: Vec<CharacteristicAddress>,
    pub initialized: u32,
    pub closed: u32,
}

pub(crate) struct RecordingContract {
    pub service: Uuid,
    pub subscriptions: Vec<CharacteristicAddress>,
    pub initial_commands: Vec<CharacteristicAddress>,
    pub recording: Arc<Mutex<Recording>>,
}

impl RecordingContract {
    pub fn new(service: Uuid, subscriptions: &[CharacteristicAddress]) -> Self {
        Self {
            service,
            subscriptions: subscriptions.to_vec(),
            initial_commands: Vec::new(),
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }
}

impl ServiceContract for RecordingContract {
    fn service_uuid(&self) -> Uuid {
        self.service
    }

    fn characteristics_to_subscribe(&self) -> Vec<CharacteristicAddress> {
        self.subscriptions.clone()
    }

    fn create_manager(&self, _commands: CommandHandle) -> Box<dyn ServiceManager> {
        Box::new(RecordingManager {
            subscriptions: self.subscriptions.clone(),
            initial_commands: self.initial_commands.clone(),
            recording: self.recording.clone(),
        })
    }
}

struct RecordingManager {
    subscriptions: Vec<CharacteristicAddress>,
    initial_commands: Vec<CharacteristicAddress>,
    recording: Arc<Mutex<Recording>>,
}

impl ServiceManager for RecordingManager {
    fn initialize(&mut self) -> Option<Vec<Command>> {
        self.recording.lock().unwrap().initialized += 1;
        if self.initial_commands.is_empty() {
            return None;
        }
        Some(self.initial_commands.iter().map(|a| Command::read(*a)).collect())
    }

    fn can_handle(&self, address: &CharacteristicAddress) -> bool {
        self.subscriptions.contains(address)
    }

    fn handle(&mut self, address: &CharacteristicAddress, value: &[u8]) {
        self.recording
            .lock()
            .unwrap()
            .handled
            .push((*address, value.to_vec()));
    }

    fn command_exhausted(&mut self, command: &Command) {
        self.recording.lock().unwrap().exhausted.push(command.address());
    }

    fn close(&mut self) {
        self.recording.lock().unwrap().closed += 1;
    }
}
