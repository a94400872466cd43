//! BLE Service and Characteristic UUIDs.
//!
//! Contains all UUID constants used for probe communication.

use uuid::Uuid;

// Immediate Alert Service (Standard BLE), used by the probe for power control
/// Standard BLE Immediate Alert Service UUID.
pub const POWER_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1802_0000_1000_8000_00805f9b34fb);
/// Standard Alert Level characteristic UUID (Write Without Response).
pub const ALERT_LEVEL_UUID: Uuid = Uuid::from_u128(0x0000_2a06_0000_1000_8000_00805f9b34fb);

// Standard descriptors
/// Client Characteristic Configuration descriptor UUID.
pub const CLIENT_CHARACTERISTIC_CONFIG_UUID: Uuid =
    Uuid::from_u128(0x0000_2902_0000_1000_8000_00805f9b34fb);

// Wi-Fi Configuration Service (Probe Custom)
/// Wi-Fi configuration service UUID.
pub const WIFI_SERVICE_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed780);
/// Published Wi-Fi info characteristic UUID (Read, Notify).
pub const WIFI_PUBLISHED_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed781);
/// Wi-Fi change request characteristic UUID (Write).
pub const WIFI_REQUEST_UUID: Uuid = Uuid::from_u128(0xf9eb3fae_947a_4e5b_ab7c_c799e91ed782);
