//! Zigbee2MQTT bridge core.
//!
//! Turns the device list and `exposes` schema published by a zigbee2mqtt
//! bridge into typed, writable device properties, and keeps them in sync
//! with the bridge's MQTT state messages.

pub mod adapter;
pub mod api;
pub mod capability;
pub mod config;
pub mod device;
pub mod error;
pub mod expose;
pub mod registry;
pub mod router;
pub mod transform;
pub mod transport;

pub use error::{BridgeError, Result};
