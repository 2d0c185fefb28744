//! Bluetooth Module
//!
//! Provides the BLE link to the companion peripheral and the ANCS decoding
//! that runs on top of it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      LinkService                         │
//! │  (single task - transport events, timers, commands)      │
//! └──────────┬──────────────────┬──────────────────┬────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//! ┌────────────────┐  ┌───────────────────┐  ┌──────────────┐
//! │   Discovery    │  │ ConnectionMachine │  │ GattTransport│
//! │                │  │                   │  │              │
//! │ - adapter gate │  │ - BondController  │  │ - platform   │
//! │ - cooldown     │  │ - MTU / discovery │  │   binding    │
//! │ - name filter  │  │ - subscriptions   │  │ - mock       │
//! └────────────────┘  │ - CommandQueue    │  └──────────────┘
//!                     │ - PluginRegistry  │
//!                     └─────────┬─────────┘
//!                               ▼
//!                     ┌───────────────────┐
//!                     │  ServiceManagers  │
//!                     │ - ancs decoding   │
//!                     │ - packet blobs    │
//!                     └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transport`] - Transport seam, callback events and GATT status codes
//! - [`scanner`] - Peripheral discovery
//! - [`bond`] - Pairing handshake
//! - [`command_queue`] - Serialized characteristic reads and writes
//! - [`connection`] - Connection lifecycle and failure escalation
//! - [`plugin`] - Service contracts, managers and their registry
//! - [`protocol`] - Well-known service and characteristic UUIDs
//! - [`ancs`] - ANCS event parsing and attribute stream decoding
//! - [`packet`] - Multi-packet blob reassembly
//! - [`service`] - Main service coordinator

pub mod ancs;
pub mod bond;
pub mod command_queue;
pub mod connection;
pub mod packet;
pub mod plugin;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod transport;

#[cfg(feature = "platform")]
pub mod btleplug_transport;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use service::LinkService;
