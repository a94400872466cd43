//! Power service session.

use bytes::Bytes;
use tracing::{debug, warn};

use crate::ble::adapter::{
    BleAdapter, CharacteristicHandle, LinkId, RequestId, ResolvedCharacteristic, WriteKind,
};
use crate::ble::uuids::ALERT_LEVEL_UUID;
use crate::error::{Error, Result};
use crate::session::{bind_characteristic, ServiceKind, SessionState};

/// Alert level written to power the probe on.
pub const POWER_ON: u8 = 0x02;
/// Alert level written to power the probe off.
pub const POWER_OFF: u8 = 0x01;

/// Session for the power (immediate alert) service.
#[derive(Debug)]
pub struct PowerSession {
    link: LinkId,
    state: SessionState,
    alert_level: Option<CharacteristicHandle>,
}

impl PowerSession {
    /// Create a session for a service found on `link`.
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            state: SessionState::Found,
            alert_level: None,
        }
    }

    /// Current discovery state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session accepts writes.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Request detail resolution. Only the first call has an effect.
    pub fn begin_resolution(&mut self, adapter: &dyn BleAdapter) {
        if self.state != SessionState::Found {
            return;
        }

        debug!("Resolving power service details on {}", self.link);
        self.state = SessionState::Resolving;
        adapter.resolve_details(self.link, ServiceKind::Power.uuid());
    }

    /// Apply a resolution result. Returns `true` if the session became ready.
    pub fn on_details_resolved(&mut self, characteristics: &[ResolvedCharacteristic]) -> bool {
        if self.state != SessionState::Resolving {
            return false;
        }

        match bind_characteristic(
            self.link,
            ServiceKind::Power,
            characteristics,
            &ALERT_LEVEL_UUID,
        ) {
            Some((handle, _)) => {
                self.alert_level = Some(handle);
                self.state = SessionState::Ready;
                true
            }
            None => {
                warn!("Power service on {} has no alert level characteristic", self.link);
                self.state = SessionState::Incomplete;
                false
            }
        }
    }

    /// Write the power level. Fire-and-forget; the adapter still reports
    /// completion under `request`.
    pub fn write_power(&self, on: bool, request: RequestId, adapter: &dyn BleAdapter) -> Result<()> {
        let characteristic = match (self.state, self.alert_level) {
            (SessionState::Ready, Some(handle)) => handle,
            _ => {
                return Err(Error::NotReady {
                    service: ServiceKind::Power,
                })
            }
        };

        debug!("Powering probe {} ({})", if on { "on" } else { "off" }, request);
        adapter.write(
            characteristic,
            power_payload(on),
            WriteKind::WithoutResponse,
            request,
        );

        Ok(())
    }
}

/// The one-byte alert level payload.
pub fn power_payload(on: bool) -> Bytes {
    Bytes::copy_from_slice(&[if on { POWER_ON } else { POWER_OFF }])
}
