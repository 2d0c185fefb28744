//! One-shot Timers
//!
//! Controllers never sleep themselves. Scheduling hands out a [`TimerTicket`]
//! which the runtime turns into a delayed
//! [`LinkEvent::Timer`](crate::infrastructure::bluetooth::service::LinkEvent::Timer).
//! Re-scheduling or cancelling bumps the generation so that a ticket
//! already in flight is rejected when it comes back.

use std::time::Duration;

/// Owner of a timer. Each slot has at most one pending expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerSlot {
    Discovery,
    Connection,
    CommandQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTicket {
    slot: TimerSlot,
    generation: u64,
    delay: Duration,
}

impl TimerTicket {
    pub fn slot(&self) -> TimerSlot {
        self.slot
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[derive(Debug)]
pub struct OneShotTimer {
    slot: TimerSlot,
    generation: u64,
    armed: bool,
}

impl OneShotTimer {
    pub fn new(slot: TimerSlot) -> Self {
        Self {
            slot,
            generation: 0,
            armed: false,
        }
    }

    /// Arm the timer, replacing any pending expiry.
    pub fn schedule(&mut self, delay: Duration) -> TimerTicket {
        self.generation = self.generation.wrapping_add(1);
        self.armed = true;
        TimerTicket {
            slot: self.slot,
            generation: self.generation,
            delay,
        }
    }

    pub fn cancel(&mut self) {
        if self.armed {
            self.generation = self.generation.wrapping_add(1);
            self.armed = false;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Accept an expired ticket. Returns `false` for stale or foreign tickets.
    pub fn claim(&mut self, ticket: &TimerTicket) -> bool {
        if !self.armed || ticket.slot != self.slot || ticket.generation != self.generation {
            return false;
        }
        self.armed = false;
        true
    }
}
