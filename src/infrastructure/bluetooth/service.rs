//! Link Service Module
//!
//! Main service that owns the transport and coordinates discovery, bonding,
//! the connection lifecycle and plugin commands for the peripheral link.
//! Everything runs on one task: transport callbacks, timer expiries and
//! plugin commands are queued on channels and handled one at a time.

use crate::domain::command::Command;
use crate::domain::models::{ConnectionState, SessionEvent};
use crate::domain::settings::LinkSettings;
use crate::infrastructure::bluetooth::command_queue::QueueConfig;
use crate::infrastructure::bluetooth::connection::{
    ConnectionConfig, ConnectionEffect, ConnectionMachine,
};
use crate::infrastructure::bluetooth::plugin::{CommandHandle, PluginRegistry, ServiceContract};
use crate::infrastructure::bluetooth::scanner::{
    DiscoveryConfig, DiscoveryController, DiscoveryEffect,
};
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use crate::infrastructure::timer::{TimerSlot, TimerTicket};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Everything the link task reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Transport(TransportEvent),
    Timer(TimerTicket),
    Close,
}

/// Sender side used by platform bindings and the owner of the link.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    sender: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkHandle {
    /// Post a transport callback. Returns `false` once the link has stopped.
    pub fn dispatch(&self, event: TransportEvent) -> bool {
        self.sender.send(LinkEvent::Transport(event)).is_ok()
    }

    pub fn close(&self) {
        if self.sender.send(LinkEvent::Close).is_err() {
            debug!("Link already stopped");
        }
    }
}

pub struct LinkInbox {
    receiver: mpsc::UnboundedReceiver<LinkEvent>,
    timer_sender: mpsc::WeakUnboundedSender<LinkEvent>,
}

pub fn channel() -> (LinkHandle, LinkInbox) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let timer_sender = sender.downgrade();
    (
        LinkHandle { sender },
        LinkInbox {
            receiver,
            timer_sender,
        },
    )
}

/// Receives link state for UI and lifecycle collaborators.
pub trait SessionObserver: Send {
    fn on_state_changed(&mut self, state: ConnectionState);

    fn on_session_event(&mut self, _event: &SessionEvent) {}
}

impl SessionObserver for mpsc::UnboundedSender<SessionEvent> {
    fn on_state_changed(&mut self, state: ConnectionState) {
        let _ = self.send(SessionEvent::StateChanged(state));
    }

    fn on_session_event(&mut self, event: &SessionEvent) {
        let _ = self.send(event.clone());
    }
}

/// Turns timer tickets into delayed [`LinkEvent::Timer`] messages.
struct TimerDriver {
    sender: mpsc::WeakUnboundedSender<LinkEvent>,
    tasks: HashMap<TimerSlot, JoinHandle<()>>,
}

impl TimerDriver {
    fn new(sender: mpsc::WeakUnboundedSender<LinkEvent>) -> Self {
        Self {
            sender,
            tasks: HashMap::new(),
        }
    }

    fn arm(&mut self, ticket: TimerTicket) {
        let sender = self.sender.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(ticket.delay()).await;
            if let Some(sender) = sender.upgrade() {
                let _ = sender.send(LinkEvent::Timer(ticket));
            }
        });
        if let Some(previous) = self.tasks.insert(ticket.slot(), task) {
            previous.abort();
        }
    }

    fn abort_all(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }
}

enum Next {
    Event(Option<LinkEvent>),
    Command(Command),
}

/// Main link service coordinating all BLE operations
pub struct LinkService<T: GattTransport> {
    transport: T,
    inbox: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    command_handle: CommandHandle,
    discovery: DiscoveryController,
    connection: ConnectionMachine,
    timers: TimerDriver,
    observers: Vec<Box<dyn SessionObserver>>,
    state: ConnectionState,
    stopped: bool,
}

impl<T: GattTransport> LinkService<T> {
    pub fn new(
        transport: T,
        inbox: LinkInbox,
        settings: &LinkSettings,
        contracts: Vec<Box<dyn ServiceContract>>,
    ) -> Self {
        let (command_sender, commands) = mpsc::unbounded_channel();
        let command_handle = CommandHandle::new(command_sender);

        let mut registry = PluginRegistry::new(command_handle.clone());
        for contract in contracts {
            registry.register(contract);
        }
        info!(plugins = registry.contract_count(), "Link service created");

        Self {
            transport,
            inbox: inbox.receiver,
            commands,
            command_handle,
            discovery: DiscoveryController::new(discovery_config(settings)),
            connection: ConnectionMachine::new(connection_config(settings), registry),
            timers: TimerDriver::new(inbox.timer_sender),
            observers: Vec::new(),
            state: ConnectionState::Disconnected,
            stopped: false,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    /// Submitter for commands issued outside the plugin managers.
    pub fn command_handle(&self) -> CommandHandle {
        self.command_handle.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Run until closed. Hands the transport back afterwards.
    pub async fn run(mut self) -> T {
        self.start();

        while !self.stopped {
            let next = tokio::select! {
                event = self.inbox.recv() => Next::Event(event),
                Some(command) = self.commands.recv() => Next::Command(command),
            };

            match next {
                Next::Event(Some(event)) => self.dispatch(event),
                Next::Event(None) => {
                    info!("All link handles dropped");
                    self.close();
                }
                Next::Command(command) => self.submit(command),
            }
        }

        info!("Link service stopped");
        self.transport
    }

    pub fn start(&mut self) {
        if self.stopped {
            return;
        }
        info!("Starting link service");
        let effects = self.discovery.start(&mut self.transport, Instant::now());
        self.apply_discovery(effects);
    }

    pub fn dispatch(&mut self, event: LinkEvent) {
        if self.stopped {
            debug!(?event, "Link stopped, ignoring event");
            return;
        }

        match event {
            LinkEvent::Transport(event) if event.is_discovery_event() => {
                let effects =
                    self.discovery
                        .handle_event(&mut self.transport, &event, Instant::now());
                self.apply_discovery(effects);
            }
            LinkEvent::Transport(event) => {
                let effects = self.connection.handle_event(&mut self.transport, &event);
                self.apply_connection(effects);
            }
            LinkEvent::Timer(ticket) if ticket.slot() == TimerSlot::Discovery => {
                let effects =
                    self.discovery
                        .handle_timer(&mut self.transport, &ticket, Instant::now());
                self.apply_discovery(effects);
            }
            LinkEvent::Timer(ticket) => {
                let effects = self.connection.handle_timer(&mut self.transport, &ticket);
                self.apply_connection(effects);
            }
            LinkEvent::Close => self.close(),
        }
    }

    pub fn submit(&mut self, command: Command) {
        let effects = self.connection.submit(&mut self.transport, command);
        self.apply_connection(effects);
    }

    pub fn close(&mut self) {
        if self.stopped {
            return;
        }
        info!("Closing link service");
        self.discovery.close(&mut self.transport);
        let effects = self.connection.close(&mut self.transport);
        self.apply_connection(effects);
        self.timers.abort_all();
        self.stopped = true;
    }

    fn apply_discovery(&mut self, effects: Vec<DiscoveryEffect>) {
        for effect in effects {
            match effect {
                DiscoveryEffect::Schedule(ticket) => self.timers.arm(ticket),
                DiscoveryEffect::DeviceFound(peripheral) => {
                    self.publish(SessionEvent::DeviceFound(peripheral.clone()));
                    if self.state != ConnectionState::Disconnected {
                        debug!(%peripheral, state = %self.state, "Already busy with a peripheral");
                        continue;
                    }
                    self.discovery.stop(&mut self.transport);
                    let effects = self.connection.connect(&mut self.transport, peripheral);
                    self.apply_connection(effects);
                }
            }
        }
    }

    fn apply_connection(&mut self, effects: Vec<ConnectionEffect>) {
        for effect in effects {
            match effect {
                ConnectionEffect::Schedule(ticket) => self.timers.arm(ticket),
                ConnectionEffect::StateChanged(state) => {
                    self.state = state;
                    self.publish(SessionEvent::StateChanged(state));
                }
                ConnectionEffect::BondFailed(peripheral) => {
                    warn!(%peripheral, "Bonding failed, resuming discovery");
                    self.publish(SessionEvent::BondFailed(peripheral));
                    self.restart_discovery();
                }
                ConnectionEffect::Disconnected => {
                    self.publish(SessionEvent::Disconnected);
                    self.restart_discovery();
                }
                ConnectionEffect::ConnectionError {
                    consecutive_failures,
                } => {
                    self.publish(SessionEvent::ConnectionError {
                        consecutive_failures,
                    });
                    self.restart_discovery();
                }
            }
        }
    }

    fn restart_discovery(&mut self) {
        let effects = self.discovery.start(&mut self.transport, Instant::now());
        self.apply_discovery(effects);
    }

    fn publish(&mut self, event: SessionEvent) {
        for observer in &mut self.observers {
            match &event {
                SessionEvent::StateChanged(state) => observer.on_state_changed(*state),
                other => observer.on_session_event(other),
            }
        }
    }
}

fn discovery_config(settings: &LinkSettings) -> DiscoveryConfig {
    DiscoveryConfig {
        allowed_names: settings.allowed_device_names.clone(),
        adapter_retry_delay: Duration::from_millis(settings.adapter_retry_delay_ms),
        scan_cooldown: Duration::from_millis(settings.scan_cooldown_ms),
        deferral_delay: Duration::from_millis(settings.scan_deferral_ms),
    }
}

fn connection_config(settings: &LinkSettings) -> ConnectionConfig {
    ConnectionConfig {
        desired_mtu: settings.desired_mtu,
        submit_retries: settings.submit_retries,
        connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        mtu_timeout: Duration::from_millis(settings.mtu_timeout_ms),
        discovery_timeout: Duration::from_millis(settings.discovery_timeout_ms),
        subscription_timeout: Duration::from_millis(settings.subscription_timeout_ms),
        power_cycle_every: settings.power_cycle_every,
        unbond_every: settings.unbond_every,
        queue: QueueConfig {
            operation_timeout: Duration::from_millis(settings.operation_timeout_ms),
            settle_delay: Duration::from_millis(settings.operation_spacing_ms),
            start_attempts: settings.command_start_attempts,
        },
    }
}
