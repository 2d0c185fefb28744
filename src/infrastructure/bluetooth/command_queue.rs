//! Command Queue
//!
//! Serializes reads and writes against the connected peripheral: one
//! operation in flight, a short settle delay between operations, and
//! importance-weighted retry of failed commands.

use crate::domain::command::Command;
use crate::domain::models::CharacteristicAddress;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportError, WriteMode};
use crate::infrastructure::timer::{OneShotTimer, TimerSlot, TimerTicket};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Configuration for command execution
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deadline for a started operation to complete
    pub operation_timeout: Duration,
    /// Gap between a completion and the next dispatch
    pub settle_delay: Duration,
    /// Submission attempts before escalating
    pub start_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(2000),
            settle_delay: Duration::from_millis(180),
            start_attempts: 3,
        }
    }
}

/// Failures the queue cannot absorb on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFault {
    StartFailed(CharacteristicAddress),
    TimedOut(CharacteristicAddress),
}

#[derive(Debug, PartialEq, Eq)]
pub enum QueueEffect {
    Schedule(TimerTicket),
    Escalate(QueueFault),
    /// The command failed and has no retries left.
    Exhausted(Command),
}

enum Stage {
    Idle,
    InFlight(Command),
    Settling,
}

pub struct CommandQueue {
    config: QueueConfig,
    pending: VecDeque<Command>,
    stage: Stage,
    timer: OneShotTimer,
    active: bool,
}

impl CommandQueue {
    /// Create an inactive queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            stage: Stage::Idle,
            timer: OneShotTimer::new(TimerSlot::CommandQueue),
            active: false,
        }
    }

    /// Number of commands waiting behind the in-flight one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The operation awaiting completion, if any.
    pub fn in_flight(&self) -> Option<&Command> {
        match &self.stage {
            Stage::InFlight(command) => Some(command),
            _ => None,
        }
    }

    /// Allow dispatch once the session is ready.
    pub fn activate<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> Vec<QueueEffect> {
        self.active = true;
        self.dispatch(transport)
    }

    /// Append a command and dispatch it if nothing is in flight.
    pub fn submit<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        command: Command,
    ) -> Vec<QueueEffect> {
        debug!(?command, "Command queued");
        self.pending.push_back(command);
        self.dispatch(transport)
    }

    /// Complete the in-flight operation for `address`.
    pub fn handle_completion(
        &mut self,
        address: &CharacteristicAddress,
        success: bool,
    ) -> Vec<QueueEffect> {
        let mut command = match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::InFlight(command) if command.address() == *address => command,
            other => {
                debug!(%address, "Completion without matching operation");
                self.stage = other;
                return Vec::new();
            }
        };

        self.stage = Stage::Settling;
        let mut effects = vec![QueueEffect::Schedule(
            self.timer.schedule(self.config.settle_delay),
        )];

        if success {
            command.complete_with_success();
        } else {
            command.complete_with_failure();
            if command.should_retry() {
                debug!(?command, "Re-queueing failed command");
                self.pending.push_back(command);
            } else {
                warn!(?command, "Command failed, giving up");
                effects.push(QueueEffect::Exhausted(command));
            }
        }
        effects
    }

    /// Operation timeout or end of the settle delay.
    pub fn handle_timer<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        ticket: &TimerTicket,
    ) -> Vec<QueueEffect> {
        if !self.timer.claim(ticket) {
            return Vec::new();
        }

        match std::mem::replace(&mut self.stage, Stage::Idle) {
            Stage::InFlight(mut command) => {
                error!(?command, "Operation timed out");
                command.complete_with_failure();
                vec![QueueEffect::Escalate(QueueFault::TimedOut(command.address()))]
            }
            Stage::Settling => self.dispatch(transport),
            Stage::Idle => Vec::new(),
        }
    }

    /// Stop dispatching and fail every pending and in-flight command.
    pub fn clear(&mut self) {
        self.active = false;
        self.timer.cancel();
        if let Stage::InFlight(mut command) = std::mem::replace(&mut self.stage, Stage::Idle) {
            command.complete_with_failure();
        }
        let dropped = self.pending.len();
        for mut command in self.pending.drain(..) {
            command.complete_with_failure();
        }
        if dropped > 0 {
            info!(dropped, "Command queue cleared");
        }
    }

    fn dispatch<T: GattTransport + ?Sized>(&mut self, transport: &mut T) -> Vec<QueueEffect> {
        if !self.active || !matches!(self.stage, Stage::Idle) {
            return Vec::new();
        }

        while let Some(mut command) = self.pending.pop_front() {
            let address = command.address();
            if !transport.has_characteristic(&address) {
                debug!(%address, "Characteristic unavailable, dropping command");
                continue;
            }

            let mut result = Err(TransportError::NotConnected);
            for attempt in 1..=self.config.start_attempts {
                result = start_operation(transport, &command);
                match &result {
                    Ok(()) => break,
                    Err(e) => warn!(%address, attempt, "Failed to start operation: {}", e),
                }
            }

            return match result {
                Ok(()) => {
                    self.stage = Stage::InFlight(command);
                    vec![QueueEffect::Schedule(
                        self.timer.schedule(self.config.operation_timeout),
                    )]
                }
                Err(_) => {
                    command.complete_with_failure();
                    vec![QueueEffect::Escalate(QueueFault::StartFailed(address))]
                }
            };
        }
        Vec::new()
    }
}

fn start_operation<T: GattTransport + ?Sized>(
    transport: &mut T,
    command: &Command,
) -> Result<(), TransportError> {
    let address = command.address();
    match command.payload() {
        Some(payload) => transport.write_characteristic(&address, payload, WriteMode::WithoutResponse),
        None => transport.read_characteristic(&address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{Call, MockTransport};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn address(n: u128) -> CharacteristicAddress {
        CharacteristicAddress::new(Uuid::from_u128(1), Uuid::from_u128(n))
    }

    fn transport() -> MockTransport {
        MockTransport {
            characteristics: vec![address(1), address(2), address(3)],
            ..Default::default()
        }
    }

    fn ticket(effects: &[QueueEffect]) -> TimerTicket {
        match effects {
            [QueueEffect::Schedule(ticket)] => *ticket,
            other => panic!("expected a single schedule, got {:?}", other),
        }
    }

    #[test]
    fn test_waits_until_active() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());

        assert!(queue.submit(&mut transport, Command::read(address(1))).is_empty());
        assert!(transport.calls.is_empty());

        let timeout = ticket(&queue.activate(&mut transport));
        assert_eq!(timeout.delay(), Duration::from_millis(2000));
        assert_eq!(transport.calls, vec![Call::Read(address(1))]);
    }

    #[test]
    fn test_one_in_flight_with_settle_delay() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);

        queue.submit(&mut transport, Command::write(address(1), vec![1]));
        queue.submit(&mut transport, Command::write(address(2), vec![2]));
        assert_eq!(transport.calls.len(), 1);
        assert_eq!(queue.len(), 1);

        let settle = ticket(&queue.handle_completion(&address(1), true));
        assert_eq!(settle.delay(), Duration::from_millis(180));
        assert_eq!(transport.calls.len(), 1);

        queue.handle_timer(&mut transport, &settle);
        assert_eq!(
            transport.calls[1],
            Call::Write(address(2), vec![2], WriteMode::WithoutResponse)
        );
    }

    #[test]
    fn test_unresolvable_command_dropped() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);
        queue.submit(&mut transport, Command::read(address(9)));
        assert!(transport.calls.is_empty());
        assert!(queue.is_empty());

        queue.submit(&mut transport, Command::read(address(3)));
        assert_eq!(transport.calls, vec![Call::Read(address(3))]);
    }

    #[test]
    fn test_failed_command_requeued_until_exhausted() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        let failures = Arc::new(AtomicU32::new(0));
        let counter = failures.clone();
        queue.activate(&mut transport);
        queue.submit(
            &mut transport,
            Command::read(address(1))
                .with_importance(2)
                .on_failure(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        );

        for _ in 0..2 {
            let settle = ticket(&queue.handle_completion(&address(1), false));
            queue.handle_timer(&mut transport, &settle);
        }
        match queue.handle_completion(&address(1), false).as_slice() {
            [QueueEffect::Schedule(_), QueueEffect::Exhausted(command)] => {
                assert_eq!(*command, Command::read(address(1)));
            }
            other => panic!("expected exhaustion, got {:?}", other),
        }

        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert_eq!(transport.count(&Call::Read(address(1))), 3);
        assert!(queue.in_flight().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_start_failure_escalates_after_attempts() {
        let mut transport = MockTransport {
            fail_operation: 3,
            ..transport()
        };
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);

        let effects = queue.submit(&mut transport, Command::read(address(1)));
        assert_eq!(
            effects,
            vec![QueueEffect::Escalate(QueueFault::StartFailed(address(1)))]
        );
        assert_eq!(transport.count(&Call::Read(address(1))), 3);
    }

    #[test]
    fn test_transient_start_failure_recovers() {
        let mut transport = MockTransport {
            fail_operation: 2,
            ..transport()
        };
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);

        ticket(&queue.submit(&mut transport, Command::read(address(1))));
        assert!(queue.in_flight().is_some());
    }

    #[test]
    fn test_operation_timeout_escalates() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);
        let timeout = ticket(&queue.submit(&mut transport, Command::read(address(1))));

        assert_eq!(
            queue.handle_timer(&mut transport, &timeout),
            vec![QueueEffect::Escalate(QueueFault::TimedOut(address(1)))]
        );
    }

    #[test]
    fn test_late_completion_after_timeout_ignored() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        queue.activate(&mut transport);
        let timeout = ticket(&queue.submit(&mut transport, Command::read(address(1))));
        queue.handle_timer(&mut transport, &timeout);

        assert!(queue
            .handle_completion(&address(1), true)
            .is_empty());
    }

    #[test]
    fn test_clear_fails_everything() {
        let mut transport = transport();
        let mut queue = CommandQueue::new(QueueConfig::default());
        let failures = Arc::new(AtomicU32::new(0));
        queue.activate(&mut transport);
        for n in 1..=3 {
            let counter = failures.clone();
            queue.submit(
                &mut transport,
                Command::read(address(n)).on_failure(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        queue.clear();
        assert_eq!(failures.load(Ordering::SeqCst), 3);
        assert!(queue.is_empty());
        assert!(queue.in_flight().is_none());

        queue.submit(&mut transport, Command::read(address(1)));
        assert_eq!(transport.calls.len(), 1);
    }
}
