//! Aerlink
//!
//! BLE link layer bridging a wearable client to an iOS peripheral: discovery,
//! bonding, GATT session setup, a serialized command pipeline and the
//! decoders for notification attribute streams and multi-packet blobs.

pub mod domain;
pub mod infrastructure;
pub mod services;
