//! GATT service sessions.
//!
//! A session tracks one service's discovery lifecycle on one link and owns
//! the characteristic handles resolved for it. Sessions live inside the
//! connection handle and are dropped together with it.

pub mod power;
pub mod wifi;

pub use power::{PowerSession, POWER_OFF, POWER_ON};
pub use wifi::WifiSession;

use uuid::Uuid;

use crate::ble::adapter::{CharacteristicHandle, LinkId, ResolvedCharacteristic};
use crate::ble::uuids::{POWER_SERVICE_UUID, WIFI_SERVICE_UUID};

/// The services the controller negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ServiceKind {
    /// Power control through the immediate alert service.
    Power,
    /// Wi-Fi configuration.
    Wifi,
}

impl ServiceKind {
    /// Map a discovered service UUID to a kind.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        if *uuid == POWER_SERVICE_UUID {
            Some(Self::Power)
        } else if *uuid == WIFI_SERVICE_UUID {
            Some(Self::Wifi)
        } else {
            None
        }
    }

    /// The service UUID.
    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Power => POWER_SERVICE_UUID,
            Self::Wifi => WIFI_SERVICE_UUID,
        }
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Power => write!(f, "Power"),
            Self::Wifi => write!(f, "Wifi"),
        }
    }
}

/// Discovery state of a service session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// The service was seen during service discovery.
    #[default]
    Found,
    /// Detail resolution has been requested.
    Resolving,
    /// Every required characteristic is resolved.
    Ready,
    /// Resolution finished without a required characteristic.
    Incomplete,
}

impl SessionState {
    /// Check if operations are allowed.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Find a characteristic in a resolution result and bind it to the link.
pub(crate) fn bind_characteristic<'a>(
    link: LinkId,
    kind: ServiceKind,
    characteristics: &'a [ResolvedCharacteristic],
    uuid: &Uuid,
) -> Option<(CharacteristicHandle, &'a ResolvedCharacteristic)> {
    characteristics
        .iter()
        .find(|c| c.uuid == *uuid)
        .map(|c| (CharacteristicHandle::new(link, kind.uuid(), c.uuid), c))
}
