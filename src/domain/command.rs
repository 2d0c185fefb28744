//! GATT Command
//!
//! A single read or write against a characteristic, queued by service
//! managers and executed by the command queue.

use crate::domain::models::CharacteristicAddress;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Lowest importance: a single attempt.
pub const IMPORTANCE_MIN: u32 = 1;
/// Default importance.
pub const IMPORTANCE_NORMAL: u32 = 3;
/// Ceiling above which the retry counter stops advancing.
pub const IMPORTANCE_MAX: u32 = 500;

type Callback = Box<dyn FnMut() + Send>;

/// Read (no payload) or write (payload) operation with importance-weighted retry.
///
/// Equality and hashing only consider the address and payload.
pub struct Command {
    address: CharacteristicAddress,
    payload: Option<Vec<u8>>,
    importance: u32,
    retry_count: u32,
    on_success: Option<Callback>,
    on_failure: Option<Callback>,
}

impl Command {
    /// Read the characteristic at `address`.
    pub fn read(address: CharacteristicAddress) -> Self {
        Self {
            address,
            payload: None,
            importance: IMPORTANCE_NORMAL,
            retry_count: 0,
            on_success: None,
            on_failure: None,
        }
    }

    /// Write `payload` to the characteristic at `address`.
    pub fn write(address: CharacteristicAddress, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Some(payload.into()),
            ..Self::read(address)
        }
    }

    pub fn with_importance(mut self, importance: u32) -> Self {
        self.importance = importance.max(IMPORTANCE_MIN);
        self
    }

    pub fn on_success(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_failure(mut self, callback: impl FnMut() + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn address(&self) -> CharacteristicAddress {
        self.address
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn is_write(&self) -> bool {
        self.payload.is_some()
    }

    pub fn importance(&self) -> u32 {
        self.importance
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Consume one retry. Returns `false` once `importance` retries are spent.
    ///
    /// Commands above [`IMPORTANCE_MAX`] never advance the counter.
    pub fn should_retry(&mut self) -> bool {
        if self.retry_count >= self.importance {
            return false;
        }
        if self.importance <= IMPORTANCE_MAX {
            self.retry_count += 1;
        }
        true
    }

    pub(crate) fn complete_with_success(&mut self) {
        if let Some(callback) = self.on_success.as_mut() {
            callback();
        }
    }

    pub(crate) fn complete_with_failure(&mut self) {
        if let Some(callback) = self.on_failure.as_mut() {
            callback();
        }
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.payload == other.payload
    }
}

impl Eq for Command {}

impl Hash for Command {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.payload.hash(state);
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("address", &self.address)
            .field("payload", &self.payload)
            .field("importance", &self.importance)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}
