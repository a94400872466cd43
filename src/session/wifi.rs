//! Wi-Fi configuration service session.
//!
//! Once ready, the session subscribes to the published-info characteristic
//! and reads it once. Notifications and the read completion go through the
//! same decoder, so callers cannot tell them apart.

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::ble::adapter::{
    BleAdapter, CharacteristicHandle, LinkId, RequestId, ResolvedCharacteristic, WriteKind,
};
use crate::ble::uuids::{CLIENT_CHARACTERISTIC_CONFIG_UUID, WIFI_PUBLISHED_UUID, WIFI_REQUEST_UUID};
use crate::error::{Error, Result};
use crate::session::{bind_characteristic, ServiceKind, SessionState};

/// Session for the Wi-Fi configuration service.
#[derive(Debug)]
pub struct WifiSession {
    link: LinkId,
    state: SessionState,
    published: Option<CharacteristicHandle>,
    request: Option<CharacteristicHandle>,
    /// Whether published-info carries a CCCD to enable notifications with.
    notifiable: bool,
}

impl WifiSession {
    /// Create a session for a service found on `link`.
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            state: SessionState::Found,
            published: None,
            request: None,
            notifiable: false,
        }
    }

    /// Current discovery state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the session accepts requests.
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    /// Request detail resolution. Only the first call has an effect.
    pub fn begin_resolution(&mut self, adapter: &dyn BleAdapter) {
        if self.state != SessionState::Found {
            return;
        }

        debug!("Resolving wifi service details on {}", self.link);
        self.state = SessionState::Resolving;
        adapter.resolve_details(self.link, ServiceKind::Wifi.uuid());
    }

    /// Apply a resolution result. Returns `true` if the session became ready.
    pub fn on_details_resolved(&mut self, characteristics: &[ResolvedCharacteristic]) -> bool {
        if self.state != SessionState::Resolving {
            return false;
        }

        let published = bind_characteristic(
            self.link,
            ServiceKind::Wifi,
            characteristics,
            &WIFI_PUBLISHED_UUID,
        );
        let request =
            bind_characteristic(self.link, ServiceKind::Wifi, characteristics, &WIFI_REQUEST_UUID);

        match (published, request) {
            (Some((published, resolved)), Some((request, _))) => {
                self.notifiable = resolved.has_descriptor(&CLIENT_CHARACTERISTIC_CONFIG_UUID);
                self.published = Some(published);
                self.request = Some(request);
                self.state = SessionState::Ready;
                true
            }
            (published, request) => {
                warn!(
                    "Wifi service on {} is missing characteristics (published: {}, request: {})",
                    self.link,
                    published.is_some(),
                    request.is_some()
                );
                self.state = SessionState::Incomplete;
                false
            }
        }
    }

    /// Subscribe to published info, then read its current value.
    ///
    /// Either completion may arrive first.
    pub fn start_updates(&self, adapter: &dyn BleAdapter) {
        let Some(published) = self.published.filter(|_| self.is_ready()) else {
            return;
        };

        if self.notifiable {
            adapter.subscribe(published);
        } else {
            warn!("Published wifi info on {} cannot notify", self.link);
        }
        adapter.read(published);
    }

    /// Write a Wi-Fi change request.
    ///
    /// An empty request is rejected before readiness is considered.
    pub fn request_change(
        &self,
        info: &str,
        request: RequestId,
        adapter: &dyn BleAdapter,
    ) -> Result<()> {
        validate_request(info)?;

        let characteristic = match (self.state, self.request) {
            (SessionState::Ready, Some(handle)) => handle,
            _ => {
                return Err(Error::NotReady {
                    service: ServiceKind::Wifi,
                })
            }
        };

        debug!("Requesting wifi change ({}, {} bytes)", request, info.len());
        adapter.write(
            characteristic,
            Bytes::copy_from_slice(info.as_bytes()),
            WriteKind::WithResponse,
            request,
        );

        Ok(())
    }

    /// Decode a received value, or `None` if it carries no wifi info.
    pub fn decode(&self, characteristic: &CharacteristicHandle, value: &[u8]) -> Option<String> {
        if self.published.as_ref() != Some(characteristic) {
            trace!("Ignoring value from {}", characteristic.uuid);
            return None;
        }

        // Empty means the probe has nothing to publish yet
        if value.is_empty() {
            return None;
        }

        Some(String::from_utf8_lossy(value).into_owned())
    }
}

/// Reject requests that carry no content.
pub(crate) fn validate_request(info: &str) -> Result<()> {
    if info.is_empty() {
        return Err(Error::InvalidArgument {
            name: "info".to_string(),
            reason: "wifi request must not be empty".to_string(),
        });
    }
    Ok(())
}
