//! BLE Discovery Module
//!
//! Scans for the companion peripheral, gated on the adapter being powered
//! and throttled so that scans are not restarted back to back.

use crate::domain::models::PeripheralId;
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportEvent};
use crate::infrastructure::timer::{OneShotTimer, TimerSlot, TimerTicket};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for discovery behavior
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Advertised names accepted as our peripheral
    pub allowed_names: Vec<String>,
    /// Retry delay after enabling the adapter or a refused scan
    pub adapter_retry_delay: Duration,
    /// Minimum spacing between two scan starts
    pub scan_cooldown: Duration,
    /// Delay applied to a start attempted inside the cooldown
    pub deferral_delay: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            allowed_names: vec![
                "Aerlink".to_string(),
                "BLE Utility".to_string(),
                "Blank".to_string(),
            ],
            adapter_retry_delay: Duration::from_millis(3000),
            scan_cooldown: Duration::from_millis(6000),
            deferral_delay: Duration::from_millis(1000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEffect {
    Schedule(TimerTicket),
    DeviceFound(PeripheralId),
}

pub struct DiscoveryController {
    config: DiscoveryConfig,
    timer: OneShotTimer,
    scanning: bool,
    closed: bool,
    last_scan_started: Option<Instant>,
}

impl DiscoveryController {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            timer: OneShotTimer::new(TimerSlot::Discovery),
            scanning: false,
            closed: false,
            last_scan_started: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Start scanning, or arrange for a later attempt.
    pub fn start<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        now: Instant,
    ) -> Vec<DiscoveryEffect> {
        if self.closed {
            debug!("Discovery closed, ignoring start");
            return Vec::new();
        }

        if !transport.is_adapter_enabled() {
            warn!("Bluetooth adapter is disabled, requesting enable");
            self.stop(transport);
            if let Err(e) = transport.enable_adapter() {
                warn!("Could not enable adapter: {}", e);
            }
            let ticket = self.timer.schedule(self.config.adapter_retry_delay);
            return vec![DiscoveryEffect::Schedule(ticket)];
        }

        if self.scanning {
            return Vec::new();
        }

        if let Some(last) = self.last_scan_started {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.config.scan_cooldown {
                debug!(?elapsed, "Scan requested during cooldown, deferring");
                let ticket = self.timer.schedule(self.config.deferral_delay);
                return vec![DiscoveryEffect::Schedule(ticket)];
            }
        }

        match transport.start_scan() {
            Ok(()) => {
                self.timer.cancel();
                self.scanning = true;
                self.last_scan_started = Some(now);
                info!("Scanning for peripherals");
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to start scan: {}", e);
                let ticket = self.timer.schedule(self.config.adapter_retry_delay);
                vec![DiscoveryEffect::Schedule(ticket)]
            }
        }
    }

    /// Stop scanning and drop any pending restart.
    pub fn stop<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.closed {
            return;
        }
        self.timer.cancel();
        if self.scanning {
            self.scanning = false;
            transport.stop_scan();
            info!("Scanning stopped");
        }
    }

    pub fn close<T: GattTransport + ?Sized>(&mut self, transport: &mut T) {
        if self.closed {
            return;
        }
        self.stop(transport);
        self.closed = true;
    }

    pub fn handle_event<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        event: &TransportEvent,
        now: Instant,
    ) -> Vec<DiscoveryEffect> {
        if self.closed {
            return Vec::new();
        }

        match event {
            TransportEvent::ScanResult { peripheral, name } => {
                if !self.scanning {
                    return Vec::new();
                }
                match name {
                    Some(name) if self.config.allowed_names.iter().any(|n| n == name) => {
                        info!(%peripheral, name = %name, "Found peripheral");
                        vec![DiscoveryEffect::DeviceFound(peripheral.clone())]
                    }
                    _ => Vec::new(),
                }
            }
            TransportEvent::ScanFailed { code } => {
                warn!(code, "Scan failed, restarting");
                self.stop(transport);
                self.scanning = false;
                self.start(transport, now)
            }
            _ => Vec::new(),
        }
    }

    pub fn handle_timer<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
        ticket: &TimerTicket,
        now: Instant,
    ) -> Vec<DiscoveryEffect> {
        if self.closed || !self.timer.claim(ticket) {
            return Vec::new();
        }
        self.start(transport, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{Call, MockTransport};

    fn scheduled(effects: &[DiscoveryEffect]) -> TimerTicket {
        match effects {
            [DiscoveryEffect::Schedule(ticket)] => *ticket,
            other => panic!("expected a single schedule, got {:?}", other),
        }
    }

    #[test]
    fn test_start_and_stop() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let now = Instant::now();

        assert!(discovery.start(&mut transport, now).is_empty());
        assert!(discovery.is_scanning());
        assert!(discovery.start(&mut transport, now).is_empty());
        assert_eq!(transport.count(&Call::StartScan), 1);

        discovery.stop(&mut transport);
        assert!(!discovery.is_scanning());
        assert_eq!(transport.count(&Call::StopScan), 1);
    }

    #[test]
    fn test_disabled_adapter_enables_and_retries() {
        let mut transport = MockTransport {
            adapter_enabled: false,
            ..Default::default()
        };
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let now = Instant::now();

        let ticket = scheduled(&discovery.start(&mut transport, now));
        assert_eq!(ticket.delay(), Duration::from_millis(3000));
        assert_eq!(transport.count(&Call::EnableAdapter), 1);
        assert_eq!(transport.count(&Call::StartScan), 0);

        let effects = discovery.handle_timer(&mut transport, &ticket, now + ticket.delay());
        assert!(effects.is_empty());
        assert!(discovery.is_scanning());
    }

    #[test]
    fn test_restart_inside_cooldown_is_deferred() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let t0 = Instant::now();

        discovery.start(&mut transport, t0);
        discovery.stop(&mut transport);

        let mut now = t0 + Duration::from_millis(2000);
        let mut ticket = scheduled(&discovery.start(&mut transport, now));
        assert_eq!(ticket.delay(), Duration::from_millis(1000));
        assert_eq!(transport.count(&Call::StartScan), 1);

        loop {
            now += ticket.delay();
            let effects = discovery.handle_timer(&mut transport, &ticket, now);
            if effects.is_empty() {
                break;
            }
            assert!(now < t0 + Duration::from_millis(6000));
            ticket = scheduled(&effects);
        }

        assert_eq!(now, t0 + Duration::from_millis(6000));
        assert_eq!(transport.count(&Call::StartScan), 2);
        assert!(discovery.is_scanning());
    }

    #[test]
    fn test_stale_deferral_ignored_after_stop() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let t0 = Instant::now();

        discovery.start(&mut transport, t0);
        discovery.stop(&mut transport);
        let ticket = scheduled(&discovery.start(&mut transport, t0 + Duration::from_millis(10)));
        discovery.stop(&mut transport);

        let effects =
            discovery.handle_timer(&mut transport, &ticket, t0 + Duration::from_millis(9000));
        assert!(effects.is_empty());
        assert_eq!(transport.count(&Call::StartScan), 1);
    }

    #[test]
    fn test_refused_scan_retries_later() {
        let mut transport = MockTransport {
            fail_scan: 1,
            ..Default::default()
        };
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let now = Instant::now();

        let ticket = scheduled(&discovery.start(&mut transport, now));
        assert_eq!(ticket.delay(), Duration::from_millis(3000));
        assert!(!discovery.is_scanning());

        discovery.handle_timer(&mut transport, &ticket, now + ticket.delay());
        assert!(discovery.is_scanning());
    }

    #[test]
    fn test_scan_result_filtering() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let now = Instant::now();
        discovery.start(&mut transport, now);

        let other = TransportEvent::ScanResult {
            peripheral: PeripheralId::new("11:22"),
            name: Some("Headphones".to_string()),
        };
        let unnamed = TransportEvent::ScanResult {
            peripheral: PeripheralId::new("11:23"),
            name: None,
        };
        let ours = TransportEvent::ScanResult {
            peripheral: PeripheralId::new("11:24"),
            name: Some("BLE Utility".to_string()),
        };

        assert!(discovery.handle_event(&mut transport, &other, now).is_empty());
        assert!(discovery.handle_event(&mut transport, &unnamed, now).is_empty());
        assert_eq!(
            discovery.handle_event(&mut transport, &ours, now),
            vec![DiscoveryEffect::DeviceFound(PeripheralId::new("11:24"))]
        );
    }

    #[test]
    fn test_scan_failure_restarts() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let t0 = Instant::now();
        discovery.start(&mut transport, t0);

        let later = t0 + Duration::from_millis(7000);
        discovery.handle_event(&mut transport, &TransportEvent::ScanFailed { code: 2 }, later);
        assert_eq!(transport.count(&Call::StopScan), 1);
        assert_eq!(transport.count(&Call::StartScan), 2);
        assert!(discovery.is_scanning());
    }

    #[test]
    fn test_closed_controller_is_inert() {
        let mut transport = MockTransport::default();
        let mut discovery = DiscoveryController::new(DiscoveryConfig::default());
        let now = Instant::now();
        discovery.start(&mut transport, now);
        discovery.close(&mut transport);
        discovery.stop(&mut transport);
        discovery.close(&mut transport);

        assert!(discovery.is_closed());
        assert_eq!(transport.count(&Call::StopScan), 1);
        assert!(discovery
            .start(&mut transport, now + Duration::from_secs(60))
            .is_empty());
        assert_eq!(transport.count(&Call::StartScan), 1);
    }
}
