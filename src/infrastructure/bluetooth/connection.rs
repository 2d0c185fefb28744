//! Connection State Machine
//!
//! Takes a discovered peripheral through bonding, GATT connection, MTU
//! negotiation, service discovery and notification subscription until the
//! session is ready. Every step is a transition function that performs the
//! transport submissions and returns the effects the runtime has to carry
//! out (timers, state notifications, error reports).

use crate::domain::command::Command;
use crate::domain::models::{BondState, CharacteristicAddress, ConnectionState, PeripheralId};
use crate::infrastructure::bluetooth::bond::{BondController, BondOutcome};
use crate::infrastructure::bluetooth::command_queue::{
    CommandQueue, QueueConfig, QueueEffect, QueueFault,
};
use crate::infrastructure::bluetooth::plugin::PluginRegistry;
use crate::infrastructure::bluetooth::protocol::{
    CLIENT_CHARACTERISTIC_CONFIG, ENABLE_NOTIFICATION_VALUE,
};
use crate::infrastructure::bluetooth::transport::{
    GattStatus, GattTransport, TransportError, TransportEvent,
};
use crate::infrastructure::timer::{OneShotTimer, TimerSlot, TimerTicket};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// MTU requested after connecting
    pub desired_mtu: u16,
    /// Immediate retries when a setup request is refused
    pub submit_retries: u32,
    pub connect_timeout: Duration,
    pub mtu_timeout: Duration,
    pub discovery_timeout: Duration,
    pub subscription_timeout: Duration,
    /// Every n-th consecutive failure power-cycles the adapter
    pub power_cycle_every: u32,
    /// Every n-th consecutive failure also removes the bond
    pub unbond_every: u32,
    pub queue: QueueConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            desired_mtu: 512,
            submit_retries: 3,
            connect_timeout: Duration::from_millis(5000),
            mtu_timeout: Duration::from_millis(1000),
            discovery_timeout: Duration::from_millis(2000),
            subscription_timeout: Duration::from_millis(3000),
            power_cycle_every: 3,
            unbond_every: 9,
            queue: QueueConfig::default(),
        }
    }
}

/// Internal setup phase. Several phases report the same [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Bonding,
    Connecting,
    MtuNegotiation,
    ServiceDiscovery,
    Subscribing {
        current: CharacteristicAddress,
        retries_left: u32,
        remaining: VecDeque<CharacteristicAddress>,
    },
    Ready,
    Stopped,
}

impl Phase {
    pub fn connection_state(&self) -> ConnectionState {
        match self {
            Self::Idle => ConnectionState::Disconnected,
            Self::Bonding => ConnectionState::Bonding,
            Self::Connecting
            | Self::MtuNegotiation
            | Self::ServiceDiscovery
            | Self::Subscribing { .. } => ConnectionState::Connecting,
            Self::Ready => ConnectionState::Ready,
            Self::Stopped => ConnectionState::Stopped,
        }
    }
}

/// Conditions that abort the session and count towards escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    ConnectRejected(TransportError),
    ConnectTimedOut,
    DiscoveryRejected(TransportError),
    DiscoveryFailed(GattStatus),
    DiscoveryTimedOut,
    NoSupportedServices,
    SubscriptionFailed(CharacteristicAddress),
    SubscriptionTimedOut(CharacteristicAddress),
    Command(QueueFault),
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectRejected(e) => write!(f, "connect rejected: {}", e),
            Self::ConnectTimedOut => write!(f, "connect timed out"),
            Self::DiscoveryRejected(e) => write!(f, "service discovery rejected: {}", e),
            Self::DiscoveryFailed(status) => write!(f, "service discovery failed ({})", status),
            Self::DiscoveryTimedOut => write!(f, "service discovery timed out"),
            Self::NoSupportedServices => write!(f, "no supported services"),
            Self::SubscriptionFailed(address) => write!(f, "subscription to {} failed", address),
            Self::SubscriptionTimedOut(address) => {
                write!(f, "subscription to {} timed out", address)
            }
            Self::Command(QueueFault::StartFailed(address)) => {
                write!(f, "operation on {} could not be started", address)
            }
            Self::Command(QueueFault::TimedOut(address)) => {
                write!(f, "operation on {} timed out", address)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEffect {
    Schedule(TimerTicket),
    StateChanged(ConnectionState),
    BondFailed(PeripheralId),
    Disconnected,
    ConnectionError { consecutive_failures: u32 },
}

pub struct ConnectionMachine {
    config: ConnectionConfig,
    phase: Phase,
    peripheral: Option<PeripheralId>,
    bond: Option<BondController>,
    queue: CommandQueue,
    registry: PluginRegistry,
    timer: OneShotTimer,
    consecutive_failures: u32,
    session_open: bool,
}

impl ConnectionMachine {
    /// Create an idle machine that hands ready sessions to `registry`.
    pub fn new(config: ConnectionConfig, registry: PluginRegistry) -> Self {
        Self {
            queue: CommandQueue::new(config.queue.clone()),
            config,
            phase: Phase::Idle,
            peripheral: None,
            bond: None,
            registry,
            timer: OneShotTimer::new(TimerSlot::Connection),
            consecutive_failures: 0,
            session_open: false,
        }
    }

    /// Externally visible connection state.
    pub fn state(&self) -> ConnectionState {
        self.phase.connection_state()
    }

    /// Current step of the session set-up.
    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Failures since the last session reached Ready.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Stopped
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Begin a session with `peripheral`, bonding first when needed.
    pub fn connect<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        peripheral: PeripheralId,
    ) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.phase != Phase::Idle {
            debug!(phase = ?self.phase, "Connect ignored");
            return effects;
        }

        self.peripheral = Some(peripheral.clone());
        match transport.bond_state(&peripheral) {
            BondState::Bonded => {
                self.open_session(transport, &peripheral, &mut effects)
            }
            _ => self.begin_bonding(transport, peripheral, &mut effects),
        }
        effects
    }

    /// Queue a command from a service manager.
    pub fn submit<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        mut command: Command,
    ) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if !self.session_open {
            debug!(?command, "No session, failing command");
            command.complete_with_failure();
            return effects;
        }
        let queued = self.queue.submit(transport, command);
        self.apply_queue_effects(transport, queued, &mut effects);
        effects
    }

    /// Advance on a transport callback.
    pub fn handle_event<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        event: &TransportEvent,
    ) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.is_closed() {
            return effects;
        }

        match event {
            TransportEvent::BondStateChanged {
                peripheral,
                previous,
                current,
            } => {
                let outcome = self
                    .bond
                    .as_mut()
                    .and_then(|bond| bond.handle_bond_state(peripheral, *previous, *current));
                match outcome {
                    Some(BondOutcome::Bonded(peripheral)) => {
                        info!(%peripheral, "Bonded");
                        self.release_bond();
                        self.open_session(transport, &peripheral, &mut effects);
                    }
                    Some(BondOutcome::Failed(peripheral)) => {
                        self.release_bond();
                        self.enter(Phase::Idle, &mut effects);
                        effects.push(ConnectionEffect::BondFailed(peripheral));
                    }
                    None => {}
                }
            }
            TransportEvent::ConnectionStateChanged { status, connected } => {
                self.on_connection_state(transport, *status, *connected, &mut effects);
            }
            TransportEvent::MtuChanged { mtu, status } => {
                if self.phase == Phase::MtuNegotiation {
                    info!(mtu, %status, "MTU changed");
                    self.timer.cancel();
                    self.begin_discovery(transport, &mut effects);
                }
            }
            TransportEvent::ServicesDiscovered { status } => {
                if self.phase == Phase::ServiceDiscovery {
                    self.timer.cancel();
                    self.on_services_discovered(transport, *status, &mut effects);
                }
            }
            TransportEvent::DescriptorWritten { address, status } => {
                self.on_descriptor_written(transport, address, *status, &mut effects);
            }
            TransportEvent::CharacteristicWritten { address, status } => {
                let queued = self.queue.handle_completion(address, status.is_success());
                self.apply_queue_effects(transport, queued, &mut effects);
            }
            TransportEvent::CharacteristicRead {
                address,
                value,
                status,
            } => {
                if status.is_success() {
                    self.registry.route(address, value);
                }
                let queued = self.queue.handle_completion(address, status.is_success());
                self.apply_queue_effects(transport, queued, &mut effects);
            }
            TransportEvent::CharacteristicChanged { address, value } => {
                if self.session_open {
                    self.registry.route(address, value);
                }
            }
            TransportEvent::ScanResult { .. } | TransportEvent::ScanFailed { .. } => {}
        }
        effects
    }

    /// Handle an expired connection or command queue timer.
    pub fn handle_timer<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        ticket: &TimerTicket,
    ) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.is_closed() {
            return effects;
        }

        if ticket.slot() == TimerSlot::CommandQueue {
            let queued = self.queue.handle_timer(transport, ticket);
            self.apply_queue_effects(transport, queued, &mut effects);
            return effects;
        }

        if !self.timer.claim(ticket) {
            return effects;
        }

        match &self.phase {
            Phase::Connecting => self.fail(transport, ConnectionFault::ConnectTimedOut, &mut effects),
            Phase::MtuNegotiation => {
                info!("MTU negotiation timed out, continuing with default");
                self.begin_discovery(transport, &mut effects);
            }
            Phase::ServiceDiscovery => {
                self.fail(transport, ConnectionFault::DiscoveryTimedOut, &mut effects)
            }
            Phase::Subscribing { current, .. } => {
                let fault = ConnectionFault::SubscriptionTimedOut(*current);
                self.fail(transport, fault, &mut effects);
            }
            Phase::Idle | Phase::Bonding | Phase::Ready | Phase::Stopped => {}
        }
        effects
    }

    /// Release everything and stop for good.
    pub fn close<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> Vec<ConnectionEffect> {
        let mut effects = Vec::new();
        if self.is_closed() {
            return effects;
        }
        info!("Closing connection");
        self.teardown(transport);
        self.phase = Phase::Stopped;
        effects.push(ConnectionEffect::StateChanged(ConnectionState::Stopped));
        effects
    }

    fn enter(&mut self, phase: Phase, effects: &mut Vec<ConnectionEffect>) {
        if self.is_closed() {
            return;
        }
        let previous = self.phase.connection_state();
        self.phase = phase;
        let current = self.phase.connection_state();
        if previous != current {
            info!(%previous, %current, "Connection state changed");
            effects.push(ConnectionEffect::StateChanged(current));
        }
    }

    fn begin_bonding<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        peripheral: PeripheralId,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.enter(Phase::Bonding, effects);
        let mut bond = BondController::new(peripheral.clone());
        if let Err(e) = bond.create_bond(transport) {
            warn!(%peripheral, "Could not start bonding: {}", e);
            self.enter(Phase::Idle, effects);
            effects.push(ConnectionEffect::BondFailed(peripheral));
            return;
        }
        self.bond = Some(bond);
    }

    fn release_bond(&mut self) {
        if let Some(mut bond) = self.bond.take() {
            bond.close();
        }
    }

    fn open_session<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        peripheral: &PeripheralId,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.enter(Phase::Connecting, effects);
        info!(%peripheral, "Connecting");
        match transport.connect(peripheral) {
            Ok(()) => {
                self.session_open = true;
                effects.push(ConnectionEffect::Schedule(
                    self.timer.schedule(self.config.connect_timeout),
                ));
            }
            Err(e) => self.fail(transport, ConnectionFault::ConnectRejected(e), effects),
        }
    }

    fn on_connection_state<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        status: GattStatus,
        connected: bool,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        if !self.session_open {
            debug!(%status, connected, "Connection update without session");
            return;
        }

        if connected && status.is_success() {
            if self.phase == Phase::Connecting {
                info!("Connected, negotiating MTU");
                self.timer.cancel();
                self.begin_mtu_negotiation(transport, effects);
            }
            return;
        }

        warn!(%status, "Disconnected");
        if status.indicates_revoked_bond() {
            if let Some(peripheral) = self.peripheral.clone() {
                warn!(%peripheral, "Peer dropped the bond, removing it");
                if let Err(e) = transport.remove_bond(&peripheral) {
                    warn!("Could not remove bond: {}", e);
                }
            }
        }
        self.teardown(transport);
        self.enter(Phase::Idle, effects);
        effects.push(ConnectionEffect::Disconnected);
    }

    fn begin_mtu_negotiation<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.enter(Phase::MtuNegotiation, effects);
        let mtu = self.config.desired_mtu;
        match self.with_retries(|| transport.request_mtu(mtu)) {
            Ok(()) => effects.push(ConnectionEffect::Schedule(
                self.timer.schedule(self.config.mtu_timeout),
            )),
            Err(e) => {
                info!("MTU request refused ({}), continuing with default", e);
                self.begin_discovery(transport, effects);
            }
        }
    }

    fn begin_discovery<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.enter(Phase::ServiceDiscovery, effects);
        match self.with_retries(|| transport.discover_services()) {
            Ok(()) => effects.push(ConnectionEffect::Schedule(
                self.timer.schedule(self.config.discovery_timeout),
            )),
            Err(e) => self.fail(transport, ConnectionFault::DiscoveryRejected(e), effects),
        }
    }

    fn on_services_discovered<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        status: GattStatus,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        if !status.is_success() {
            self.fail(transport, ConnectionFault::DiscoveryFailed(status), effects);
            return;
        }

        let subscriptions = self.registry.activate(|service| transport.has_service(service));
        if subscriptions.is_empty() {
            self.fail(transport, ConnectionFault::NoSupportedServices, effects);
            return;
        }
        info!(count = subscriptions.len(), "Services discovered, subscribing");
        self.subscribe_next(transport, subscriptions.into(), effects);
    }

    fn subscribe_next<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        mut remaining: VecDeque<CharacteristicAddress>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        match remaining.pop_front() {
            Some(current) => {
                let retries = self.config.submit_retries;
                self.subscribe(transport, current, retries, remaining, effects);
            }
            None => self.become_ready(transport, effects),
        }
    }

    fn subscribe<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        current: CharacteristicAddress,
        mut retries_left: u32,
        remaining: VecDeque<CharacteristicAddress>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        loop {
            let result = transport.enable_notifications(&current).and_then(|()| {
                transport.write_descriptor(
                    &current,
                    CLIENT_CHARACTERISTIC_CONFIG,
                    &ENABLE_NOTIFICATION_VALUE,
                )
            });
            match result {
                Ok(()) => {
                    debug!(address = %current, "Subscription requested");
                    self.enter(
                        Phase::Subscribing {
                            current,
                            retries_left,
                            remaining,
                        },
                        effects,
                    );
                    effects.push(ConnectionEffect::Schedule(
                        self.timer.schedule(self.config.subscription_timeout),
                    ));
                    return;
                }
                Err(e) if retries_left > 0 => {
                    retries_left -= 1;
                    warn!(address = %current, retries_left, "Subscription refused: {}", e);
                }
                Err(e) => {
                    error!(address = %current, "Subscription refused: {}", e);
                    self.fail(transport, ConnectionFault::SubscriptionFailed(current), effects);
                    return;
                }
            }
        }
    }

    fn on_descriptor_written<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        address: &CharacteristicAddress,
        status: GattStatus,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        match &self.phase {
            Phase::Subscribing { current, .. } if current == address => {}
            _ => {
                debug!(%address, "Descriptor write outside subscription");
                return;
            }
        }
        self.timer.cancel();

        let Phase::Subscribing {
            current,
            retries_left,
            remaining,
        } = std::mem::replace(&mut self.phase, Phase::ServiceDiscovery)
        else {
            return;
        };

        if status.is_success() {
            debug!(address = %current, "Subscribed");
            self.subscribe_next(transport, remaining, effects);
        } else if retries_left > 0 {
            warn!(address = %current, %status, "Descriptor write failed, retrying");
            self.subscribe(transport, current, retries_left - 1, remaining, effects);
        } else {
            self.fail(transport, ConnectionFault::SubscriptionFailed(current), effects);
        }
    }

    fn become_ready<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.enter(Phase::Ready, effects);
        self.consecutive_failures = 0;
        info!("Session ready");

        let mut queued = self.queue.activate(transport);
        for command in self.registry.initialize() {
            queued.extend(self.queue.submit(transport, command));
        }
        self.apply_queue_effects(transport, queued, effects);
    }

    fn apply_queue_effects<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        queued: Vec<QueueEffect>,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        for effect in queued {
            match effect {
                QueueEffect::Schedule(ticket) => effects.push(ConnectionEffect::Schedule(ticket)),
                QueueEffect::Exhausted(command) => self.registry.command_exhausted(&command),
                QueueEffect::Escalate(fault) => {
                    self.fail(transport, ConnectionFault::Command(fault), effects);
                    return;
                }
            }
        }
    }

    /// Abort the session, count the failure and escalate on schedule.
    fn fail<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        fault: ConnectionFault,
        effects: &mut Vec<ConnectionEffect>,
    ) {
        self.consecutive_failures += 1;
        let failures = self.consecutive_failures;
        error!(failures, "Connection error: {}", fault);

        self.teardown(transport);

        if self.config.unbond_every > 0 && failures % self.config.unbond_every == 0 {
            if let Some(peripheral) = self.peripheral.clone() {
                warn!(%peripheral, failures, "Removing bond after repeated failures");
                if let Err(e) = transport.remove_bond(&peripheral) {
                    warn!("Could not remove bond: {}", e);
                }
            }
        }
        if self.config.power_cycle_every > 0 && failures % self.config.power_cycle_every == 0 {
            warn!(failures, "Power cycling adapter after repeated failures");
            if let Err(e) = transport.disable_adapter() {
                warn!("Could not disable adapter: {}", e);
            }
        }

        self.enter(Phase::Idle, effects);
        effects.push(ConnectionEffect::ConnectionError {
            consecutive_failures: failures,
        });
    }

    fn teardown<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        self.timer.cancel();
        self.release_bond();
        self.queue.clear();
        self.registry.close_all();
        if self.session_open {
            self.session_open = false;
            transport.close();
        }
    }

    fn with_retries(
        &self,
        mut submit: impl FnMut() -> Result<(), TransportError>,
    ) -> Result<(), TransportError> {
        let mut result = submit();
        for attempt in 1..=self.config.submit_retries {
            match &result {
                Ok(()) => break,
                Err(e) => warn!(attempt, "Request refused, retrying: {}", e),
            }
            result = submit();
        }
        result
    }
}
