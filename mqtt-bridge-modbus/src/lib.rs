//! Simulated Modbus TCP field device driven by MQTT.
//!
//! The simulator stands in for an openWB Dimm- und Control-Kit. Messages
//! on configured MQTT topics switch discrete inputs on or off, and any
//! Modbus TCP client can read them back.
//!
//! # Services
//!
//! ```text
//! MQTT broker ──> MqttBridge ──> RegisterBank <── ModbusServer <── Modbus client
//!                     ^               (DI/CO/HR/IR)
//!                     │
//!   web form ── ConfigStore (device JSON document)
//! ```
//!
//! - [`registers`] - The four 1000-slot register spaces behind one lock
//! - [`server`] - Modbus TCP server answering from the register bank
//! - [`bridge`] - Broker session lifecycle and topic to discrete input mapping
//! - [`session`] - Broker connection seam and the rumqttc implementation
//! - [`store`] - The persisted device configuration document
//! - [`identity`] - Line identification greeting
//! - [`web`] - Configuration form
//! - [`runner`] - Binds and runs everything

pub mod bridge;
pub mod config;
pub mod identity;
pub mod registers;
pub mod runner;
pub mod server;
pub mod session;
pub mod store;
pub mod web;

pub use bridge::{BridgeState, MqttBridge, ReconnectHandle};
pub use registers::{RegisterBank, RegisterSpace};
pub use runner::Simulator;
pub use store::{ConfigProvider, ConfigStore, DeviceConfig};
