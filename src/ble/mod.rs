//! BLE communication module.
//!
//! This module holds the adapter seam, the btleplug adapter behind it, and
//! the scanning and connection state machines that drive it.

pub mod adapter;
pub mod connection;
pub mod platform;
pub mod registry;
pub mod scanner;
pub mod uuids;

pub use adapter::{AdapterEvent, BleAdapter};
pub use connection::{ConnectionController, ConnectionState};
pub use platform::BtleplugAdapter;
pub use registry::DeviceRegistry;
pub use scanner::DiscoveryScanner;
pub use uuids::*;
