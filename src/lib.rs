// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ultrasound-probe-ble
//!
//! A cross-platform Rust library for controlling hand-held ultrasound probes
//! over Bluetooth Low Energy.
//!
//! Only devices advertising a probe-family name (`CUS-…`) are discovered.
//! One probe can be connected at a time.
//!
//! ## Features
//!
//! - **Probe Discovery**: Timed scans, with the registry replaced by each scan
//! - **Exclusive Connection**: One link at a time, re-entrant connects rejected
//! - **Power Control**: Power the probe on or off through the immediate alert service
//! - **Wi-Fi Configuration**: Read and follow the probe's network, request changes
//! - **Event Stream**: Readiness, connection and Wi-Fi updates on one channel
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ultrasound_probe_ble::{DeviceManager, ProbeEvent, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = DeviceManager::new().await?;
//!     let mut events = manager.subscribe();
//!
//!     manager.start_scan().await?;
//!
//!     while let Ok(event) = events.recv().await {
//!         match event {
//!             ProbeEvent::DevicesUpdated { names } => {
//!                 if let Some(name) = names.first() {
//!                     manager.connect(name).await?;
//!                 }
//!             }
//!             ProbeEvent::PowerReady { ready: true } => {
//!                 manager.set_power(true).await?;
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! [`ProbeController`] is a single-threaded state machine. It issues
//! requests through the [`BleAdapter`] trait and consumes their completions
//! as [`AdapterEvent`]s. [`DeviceManager`] runs it on a tokio task over the
//! btleplug-backed [`BtleplugAdapter`].
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for config, status and events

// Public modules
pub mod ble;
pub mod config;
pub mod controller;
pub mod device_manager;
pub mod error;
pub mod events;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::ProbeConfig;
pub use controller::{ProbeController, ProbeStatus};
pub use device_manager::{CallbackHandle, DeviceManager};
pub use error::{Error, FailureReason, Result};
pub use events::{EventDispatcher, EventReceiver, ProbeEvent, WriteOutcome};

// Re-export commonly used types from submodules
pub use ble::adapter::{
    AdapterEvent, BleAdapter, CharacteristicHandle, DiscoveredDevice, GattOperation, LinkId,
    RequestId, ResolvedCharacteristic, ScanId, ValueSource, WriteKind,
};
pub use ble::connection::{ConnectionState, ReadinessFlags};
pub use ble::platform::BtleplugAdapter;
pub use ble::registry::{DeviceRegistry, RegisteredProbe};
pub use session::ServiceKind;
