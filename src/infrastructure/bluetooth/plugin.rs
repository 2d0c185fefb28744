//! Service Plugins
//!
//! A plugin declares the GATT service it understands and builds a manager
//! once that service shows up on the connected peripheral. The registry owns
//! the live managers for the current session and routes characteristic
//! updates to them by address.

use crate::domain::command::Command;
use crate::domain::models::CharacteristicAddress;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Submits commands to the link's command queue.
pub trait CommandHandler {
    fn submit(&self, command: Command);
}

/// Cloneable submitter handed to every manager.
#[derive(Debug, Clone)]
pub struct CommandHandle {
    sender: mpsc::UnboundedSender<Command>,
}

impl CommandHandle {
    pub fn new(sender: mpsc::UnboundedSender<Command>) -> Self {
        Self { sender }
    }
}

impl CommandHandler for CommandHandle {
    fn submit(&self, command: Command) {
        if let Err(mpsc::error::SendError(mut command)) = self.sender.send(command) {
            warn!(address = %command.address(), "Link is gone, dropping command");
            command.complete_with_failure();
        }
    }
}

/// Static description of a supported service.
pub trait ServiceContract: Send {
    fn service_uuid(&self) -> Uuid;
    fn characteristics_to_subscribe(&self) -> Vec<CharacteristicAddress>;
    fn create_manager(&self, commands: CommandHandle) -> Box<dyn ServiceManager>;
}

/// Per-session handler for one service.
pub trait ServiceManager: Send {
    /// Called once the session is ready. Returned commands are queued.
    fn initialize(&mut self) -> Option<Vec<Command>>;
    fn can_handle(&self, address: &CharacteristicAddress) -> bool;
    fn handle(&mut self, address: &CharacteristicAddress, value: &[u8]);
    /// A submitted command failed for the last time.
    fn command_exhausted(&mut self, _command: &Command) {}
    fn close(&mut self);
}

pub struct PluginRegistry {
    contracts: BTreeMap<Uuid, Box<dyn ServiceContract>>,
    managers: BTreeMap<Uuid, Box<dyn ServiceManager>>,
    commands: CommandHandle,
}

impl PluginRegistry {
    /// Create an empty registry whose managers submit through `commands`.
    pub fn new(commands: CommandHandle) -> Self {
        Self {
            contracts: BTreeMap::new(),
            managers: BTreeMap::new(),
            commands,
        }
    }

    /// Add a contract, replacing any previous one for the same service.
    pub fn register(&mut self, contract: Box<dyn ServiceContract>) {
        let service = contract.service_uuid();
        if self.contracts.insert(service, contract).is_some() {
            warn!(%service, "Replacing previously registered service contract");
        }
    }

    pub fn contract_count(&self) -> usize {
        self.contracts.len()
    }

    /// Build managers for every registered service the peripheral exposes and
    /// return the characteristics to subscribe, in service order.
    pub fn activate(&mut self, is_available: impl Fn(&Uuid) -> bool) -> Vec<CharacteristicAddress> {
        self.close_all();

        let mut subscriptions = Vec::new();
        for (service, contract) in &self.contracts {
            if !is_available(service) {
                debug!(%service, "Service not present on peripheral");
                continue;
            }
            info!(%service, "Service found");
            self.managers
                .insert(*service, contract.create_manager(self.commands.clone()));
            subscriptions.extend(contract.characteristics_to_subscribe());
        }
        subscriptions
    }

    /// Collect the start-up commands of every active manager.
    pub fn initialize(&mut self) -> Vec<Command> {
        self.managers
            .values_mut()
            .filter_map(|manager| manager.initialize())
            .flatten()
            .collect()
    }

    /// Hand a characteristic value to the managers that claim it.
    pub fn route(&mut self, address: &CharacteristicAddress, value: &[u8]) -> bool {
        let mut handled = false;
        for manager in self.managers.values_mut() {
            if manager.can_handle(address) {
                manager.handle(address, value);
                handled = true;
            }
        }
        if !handled {
            debug!(%address, "No manager for characteristic update");
        }
        handled
    }

    /// Tell every manager that `command` will not be retried again.
    pub fn command_exhausted(&mut self, command: &Command) {
        for manager in self.managers.values_mut() {
            manager.command_exhausted(command);
        }
    }

    /// Close and drop the managers of the current session.
    pub fn close_all(&mut self) {
        for (_, mut manager) in std::mem::take(&mut self.managers) {
            manager.close();
        }
    }

}
