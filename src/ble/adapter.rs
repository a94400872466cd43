//! The seam between the probe state machine and a BLE stack.
//!
//! Requests go out through [`BleAdapter`] and return immediately. Every
//! completion comes back later as an [`AdapterEvent`] which the owner of the
//! state machine feeds into [`ProbeController::handle_adapter_event`].
//!
//! Link-scoped requests and completions carry a [`LinkId`]. A new id is
//! issued for every accepted connection attempt, so a completion naming an
//! older link can be recognised and dropped.
//!
//! [`ProbeController::handle_adapter_event`]: crate::ProbeController::handle_adapter_event

use bytes::Bytes;
use std::time::Duration;
use uuid::Uuid;

macro_rules! sequence_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        pub struct $name(u64);

        impl $name {
            /// Create an id from its raw value.
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Get the raw value.
            pub const fn get(self) -> u64 {
                self.0
            }

            /// The id following this one.
            pub(crate) fn next(self) -> Self {
                Self(self.0.wrapping_add(1))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

sequence_id!(
    /// Identifies one connection attempt and everything scoped to it.
    LinkId,
    "link"
);
sequence_id!(
    /// Identifies one discovery scan.
    ScanId,
    "scan"
);
sequence_id!(
    /// Identifies one characteristic write.
    RequestId,
    "request"
);

/// A device reported by a discovery scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Stable device address or platform identifier.
    pub identifier: String,
    /// Advertised local name.
    pub name: String,
}

impl DiscoveredDevice {
    /// Create a new discovered device.
    pub fn new(identifier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: name.into(),
        }
    }
}

/// A resolved characteristic, valid only for the link it was resolved on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicHandle {
    /// Link the characteristic belongs to.
    pub link: LinkId,
    /// Owning service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl CharacteristicHandle {
    /// Create a new characteristic handle.
    pub fn new(link: LinkId, service: Uuid, uuid: Uuid) -> Self {
        Self {
            link,
            service,
            uuid,
        }
    }
}

/// A characteristic as reported by detail resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCharacteristic {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUIDs of the descriptors attached to it.
    pub descriptors: Vec<Uuid>,
}

impl ResolvedCharacteristic {
    /// Create a resolved characteristic.
    pub fn new(uuid: Uuid, descriptors: Vec<Uuid>) -> Self {
        Self { uuid, descriptors }
    }

    /// Check whether a descriptor is attached.
    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

/// Whether a write expects an acknowledgment from the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Acknowledged write.
    WithResponse,
    /// Fire-and-forget write.
    WithoutResponse,
}

/// How a characteristic value arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    /// Completion of an explicit read.
    Read,
    /// Notification from a subscription.
    Notification,
}

/// A GATT operation, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattOperation {
    /// Opening the link.
    Connect,
    /// Primary service discovery.
    DiscoverServices,
    /// Characteristic and descriptor resolution for one service.
    ResolveDetails,
    /// Characteristic read.
    Read,
    /// Characteristic write.
    Write,
    /// Notification subscription.
    Subscribe,
}

impl std::fmt::Display for GattOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connect => write!(f, "connect"),
            Self::DiscoverServices => write!(f, "service discovery"),
            Self::ResolveDetails => write!(f, "detail resolution"),
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Subscribe => write!(f, "subscribe"),
        }
    }
}

/// Completion reported by a [`BleAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// A device was seen during a scan.
    DeviceFound {
        /// The scan that saw it.
        scan: ScanId,
        /// The device.
        device: DiscoveredDevice,
    },
    /// The scan ran to its timeout.
    ScanFinished {
        /// The scan that finished.
        scan: ScanId,
    },
    /// The scan could not run.
    ScanFailed {
        /// The scan that failed.
        scan: ScanId,
        /// Description reported by the adapter.
        reason: String,
    },
    /// The link is up.
    Connected {
        /// The link.
        link: LinkId,
    },
    /// A primary service was found.
    ServiceFound {
        /// The link.
        link: LinkId,
        /// Service UUID.
        service: Uuid,
    },
    /// Service discovery is complete.
    DiscoveryFinished {
        /// The link.
        link: LinkId,
    },
    /// A service's characteristics and descriptors are resolved.
    DetailsResolved {
        /// The link.
        link: LinkId,
        /// Service UUID.
        service: Uuid,
        /// Everything the service exposes.
        characteristics: Vec<ResolvedCharacteristic>,
    },
    /// A characteristic value arrived.
    ValueReceived {
        /// The characteristic.
        characteristic: CharacteristicHandle,
        /// Raw value.
        value: Bytes,
        /// Read completion or notification.
        source: ValueSource,
    },
    /// Notifications are enabled on a characteristic.
    Subscribed {
        /// The characteristic.
        characteristic: CharacteristicHandle,
    },
    /// A write finished.
    WriteCompleted {
        /// The link.
        link: LinkId,
        /// The request being completed.
        request: RequestId,
        /// `Err` holds the adapter's description.
        result: std::result::Result<(), String>,
    },
    /// A link-scoped operation failed.
    OperationFailed {
        /// The link.
        link: LinkId,
        /// The failed operation.
        operation: GattOperation,
        /// Description reported by the adapter.
        reason: String,
    },
    /// The link is down, requested or not.
    Disconnected {
        /// The link.
        link: LinkId,
    },
}

impl AdapterEvent {
    /// The link this event is scoped to, if any.
    pub fn link(&self) -> Option<LinkId> {
        match self {
            Self::DeviceFound { .. } | Self::ScanFinished { .. } | Self::ScanFailed { .. } => None,
            Self::Connected { link }
            | Self::ServiceFound { link, .. }
            | Self::DiscoveryFinished { link }
            | Self::DetailsResolved { link, .. }
            | Self::WriteCompleted { link, .. }
            | Self::OperationFailed { link, .. }
            | Self::Disconnected { link } => Some(*link),
            Self::ValueReceived { characteristic, .. } | Self::Subscribed { characteristic } => {
                Some(characteristic.link)
            }
        }
    }
}

/// Request side of a BLE stack.
///
/// Every method returns immediately; the outcome is delivered later as an
/// [`AdapterEvent`]. Implementations must not hand a completion back to the
/// caller from inside the request call itself.
#[cfg_attr(test, mockall::automock)]
pub trait BleAdapter: Send {
    /// Start a scan that finishes on its own after `timeout`.
    fn start_scan(&self, scan: ScanId, timeout: Duration);

    /// Stop a running scan. No completion is reported for it afterwards.
    fn stop_scan(&self, scan: ScanId);

    /// Open a link to `device`.
    fn connect(&self, link: LinkId, device: &DiscoveredDevice);

    /// Discover primary services on the link.
    fn discover_services(&self, link: LinkId);

    /// Resolve characteristics and descriptors of one discovered service.
    fn resolve_details(&self, link: LinkId, service: Uuid);

    /// Read a characteristic value.
    fn read(&self, characteristic: CharacteristicHandle);

    /// Write a characteristic value.
    fn write(
        &self,
        characteristic: CharacteristicHandle,
        value: Bytes,
        kind: WriteKind,
        request: RequestId,
    );

    /// Enable notifications on a characteristic.
    fn subscribe(&self, characteristic: CharacteristicHandle);

    /// Close the link.
    fn disconnect(&self, link: LinkId);
}
