//! Pairing
//!
//! Drives one bonding attempt with a single peripheral and reports its
//! terminal outcome.

use crate::domain::models::{BondState, PeripheralId};
use crate::infrastructure::bluetooth::transport::{GattTransport, TransportError};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BondOutcome {
    Bonded(PeripheralId),
    Failed(PeripheralId),
}

pub struct BondController {
    peripheral: PeripheralId,
    reported: bool,
    closed: bool,
}

impl BondController {
    pub fn new(peripheral: PeripheralId) -> Self {
        Self {
            peripheral,
            reported: false,
            closed: false,
        }
    }

    pub fn create_bond<T: GattTransport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), TransportError> {
        info!(peripheral = %self.peripheral, "Creating bond");
        transport.create_bond(&self.peripheral)
    }

    /// Feed a platform bond-state transition. Yields the outcome at most once.
    pub fn handle_bond_state(
        &mut self,
        peripheral: &PeripheralId,
        previous: BondState,
        current: BondState,
    ) -> Option<BondOutcome> {
        if self.closed || self.reported || *peripheral != self.peripheral {
            return None;
        }

        debug!(%peripheral, ?previous, ?current, "Bond state changed");
        let outcome = match (previous, current) {
            (BondState::Bonding, BondState::Bonded) => BondOutcome::Bonded(peripheral.clone()),
            (BondState::Bonding | BondState::Bonded, BondState::None) => {
                warn!(%peripheral, "Bonding failed");
                BondOutcome::Failed(peripheral.clone())
            }
            _ => return None,
        };
        self.reported = true;
        Some(outcome)
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
