//! BLE connection management.
//!
//! [`ConnectionController`] owns the single link to a probe and drives it
//! through connection, service discovery and per-service detail resolution.
//! Every state change happens inside a caller operation or an adapter
//! completion, on one processing context.

use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{
    AdapterEvent, BleAdapter, DiscoveredDevice, GattOperation, LinkId, RequestId,
    ResolvedCharacteristic,
};
use crate::ble::registry::DeviceRegistry;
use crate::error::{Error, FailureReason, Result};
use crate::events::{EventDispatcher, ProbeEvent, WriteOutcome};
use crate::session::{wifi, PowerSession, ServiceKind, WifiSession};

/// Connection state for the probe link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No connection has been attempted.
    #[default]
    Idle,
    /// Currently attempting to connect.
    Connecting,
    /// Connected to the probe.
    Connected,
    /// The link was closed on request.
    Disconnected,
    /// The link failed or was lost.
    Failed,
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if the link has ended.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }

    /// Check if a new connection attempt may start.
    pub fn accepts_connect(&self) -> bool {
        matches!(self, Self::Idle) || self.is_terminal()
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Readiness of the two services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReadinessFlags {
    /// Power service ready.
    pub power: bool,
    /// Wi-Fi service ready.
    pub wifi: bool,
}

/// The one physical link and everything scoped to it.
#[derive(Debug)]
struct ConnectionHandle {
    link: LinkId,
    probe_name: String,
    device: DiscoveredDevice,
    state: ConnectionState,
    disconnect_requested: bool,
    power: Option<PowerSession>,
    wifi: Option<WifiSession>,
    pending_writes: BTreeMap<RequestId, ServiceKind>,
}

impl ConnectionHandle {
    fn new(link: LinkId, probe_name: String, device: DiscoveredDevice) -> Self {
        Self {
            link,
            probe_name,
            device,
            state: ConnectionState::Connecting,
            disconnect_requested: false,
            power: None,
            wifi: None,
            pending_writes: BTreeMap::new(),
        }
    }

    fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }

    fn readiness(&self) -> ReadinessFlags {
        ReadinessFlags {
            power: self.power.as_ref().map(|s| s.is_ready()).unwrap_or(false),
            wifi: self.wifi.as_ref().map(|s| s.is_ready()).unwrap_or(false),
        }
    }
}

/// Work postponed to the next processing turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    ResolveDetails(LinkId),
}

/// Owns the probe connection and its service sessions.
#[derive(Debug)]
pub struct ConnectionController {
    /// Current or most recent link.
    handle: Option<ConnectionHandle>,
    /// Last wifi info published on the current link.
    wifi_info: Option<String>,
    /// Id for the next connection attempt.
    next_link: LinkId,
    /// Id for the next write.
    next_request: RequestId,
    /// Postponed work, drained by `run_deferred`.
    deferred: VecDeque<Deferred>,
}

impl Default for ConnectionController {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionController {
    /// Create a controller with no link.
    pub fn new() -> Self {
        Self {
            handle: None,
            wifi_info: None,
            next_link: LinkId::new(1),
            next_request: RequestId::new(1),
            deferred: VecDeque::new(),
        }
    }

    /// Get the current connection state.
    pub fn state(&self) -> ConnectionState {
        self.handle
            .as_ref()
            .map(|h| h.state)
            .unwrap_or(ConnectionState::Idle)
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Id of the current link, if one is live.
    pub fn link(&self) -> Option<LinkId> {
        self.handle.as_ref().filter(|h| h.is_live()).map(|h| h.link)
    }

    /// Name of the probe on the current link, if one is live.
    pub fn probe_name(&self) -> Option<&str> {
        self.handle
            .as_ref()
            .filter(|h| h.is_live())
            .map(|h| h.probe_name.as_str())
    }

    /// Device on the current link, if one is live.
    pub fn device(&self) -> Option<&DiscoveredDevice> {
        self.handle
            .as_ref()
            .filter(|h| h.is_live())
            .map(|h| &h.device)
    }

    /// Readiness of the services on the current link.
    pub fn readiness(&self) -> ReadinessFlags {
        self.handle
            .as_ref()
            .filter(|h| h.is_live())
            .map(|h| h.readiness())
            .unwrap_or_default()
    }

    /// Last wifi info published on the current link.
    pub fn wifi_info(&self) -> Option<&str> {
        self.wifi_info.as_deref()
    }

    /// Number of writes awaiting completion.
    pub fn pending_writes(&self) -> usize {
        self.handle
            .as_ref()
            .map(|h| h.pending_writes.len())
            .unwrap_or(0)
    }

    /// Start connecting to the probe registered under `name`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the name is not registered, `AlreadyConnecting` if the
    /// current link has not ended. Neither changes any state.
    pub fn connect(
        &mut self,
        name: &str,
        registry: &DeviceRegistry,
        adapter: &dyn BleAdapter,
        events: &EventDispatcher,
    ) -> Result<LinkId> {
        let device = registry
            .find_by_name(name)
            .filter(|_| !name.is_empty())
            .map(|p| p.device.clone())
            .ok_or_else(|| Error::NotFound {
                name: name.to_string(),
            })?;

        if !self.state().accepts_connect() {
            debug!("Connect to {} rejected, link is {}", name, self.state());
            return Err(Error::AlreadyConnecting);
        }

        let link = self.next_link;
        self.next_link = link.next();

        info!("Connecting to probe {} ({}) on {}", name, device.identifier, link);

        self.handle = Some(ConnectionHandle::new(link, name.to_string(), device.clone()));
        self.wifi_info = None;
        self.deferred.clear();

        Self::emit_readiness(events, ReadinessFlags::default());
        Self::emit_status(events, ConnectionState::Connecting, None);

        adapter.connect(link, &device);

        Ok(link)
    }

    /// Request the link to close.
    ///
    /// # Errors
    ///
    /// `NotConnected` unless the link is `Connected`.
    pub fn disconnect(&mut self, adapter: &dyn BleAdapter) -> Result<()> {
        let handle = self
            .handle
            .as_mut()
            .filter(|h| h.state.is_connected())
            .ok_or(Error::NotConnected)?;

        if handle.disconnect_requested {
            debug!("Disconnect of {} already requested", handle.link);
            return Ok(());
        }

        info!("Disconnecting from probe {}", handle.probe_name);
        handle.disconnect_requested = true;
        adapter.disconnect(handle.link);

        Ok(())
    }

    /// Power the probe on or off.
    ///
    /// # Errors
    ///
    /// `NotReady` until the power service is ready. No write is issued then.
    pub fn set_power(&mut self, on: bool, adapter: &dyn BleAdapter) -> Result<RequestId> {
        let request = self.next_request;
        let handle = self
            .handle
            .as_mut()
            .filter(|h| h.state.is_connected())
            .ok_or(Error::NotReady {
                service: ServiceKind::Power,
            })?;
        let session = handle.power.as_ref().ok_or(Error::NotReady {
            service: ServiceKind::Power,
        })?;

        session.write_power(on, request, adapter)?;

        handle.pending_writes.insert(request, ServiceKind::Power);
        self.next_request = request.next();

        Ok(request)
    }

    /// Ask the probe to join a different Wi-Fi network.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for an empty request, whatever the readiness, then
    /// `NotReady` until the wifi service is ready.
    pub fn request_wifi_change(&mut self, info: &str, adapter: &dyn BleAdapter) -> Result<RequestId> {
        wifi::validate_request(info)?;

        let request = self.next_request;
        let handle = self
            .handle
            .as_mut()
            .filter(|h| h.state.is_connected())
            .ok_or(Error::NotReady {
                service: ServiceKind::Wifi,
            })?;
        let session = handle.wifi.as_ref().ok_or(Error::NotReady {
            service: ServiceKind::Wifi,
        })?;

        session.request_change(info, request, adapter)?;

        handle.pending_writes.insert(request, ServiceKind::Wifi);
        self.next_request = request.next();

        Ok(request)
    }

    /// Apply a link-scoped adapter completion.
    ///
    /// Completions for a link that has ended, or for an older link, are
    /// dropped.
    pub fn handle_event(
        &mut self,
        event: AdapterEvent,
        adapter: &dyn BleAdapter,
        events: &EventDispatcher,
    ) {
        let Some(link) = event.link() else {
            return;
        };

        let Some(handle) = self.handle.as_mut().filter(|h| h.link == link && h.is_live()) else {
            trace!("Discarding completion for ended {}: {:?}", link, event);
            return;
        };

        match event {
            AdapterEvent::Connected { .. } => {
                if handle.state != ConnectionState::Connecting {
                    trace!("Duplicate connected report for {}", link);
                    return;
                }

                info!("Connected to probe {}", handle.probe_name);
                handle.state = ConnectionState::Connected;
                Self::emit_status(events, ConnectionState::Connected, None);
                Self::emit_readiness(events, ReadinessFlags::default());

                debug!("Discovering services on {}", link);
                adapter.discover_services(link);
            }
            AdapterEvent::ServiceFound { service, .. } => match ServiceKind::from_uuid(&service) {
                Some(ServiceKind::Power) if handle.power.is_none() => {
                    debug!("Power service found on {}", link);
                    handle.power = Some(PowerSession::new(link));
                }
                Some(ServiceKind::Wifi) if handle.wifi.is_none() => {
                    debug!("Wifi service found on {}", link);
                    handle.wifi = Some(WifiSession::new(link));
                }
                Some(kind) => debug!("Ignoring repeated {} service on {}", kind, link),
                None => trace!("Ignoring service {} on {}", service, link),
            },
            AdapterEvent::DiscoveryFinished { .. } => {
                debug!("Service discovery finished on {}", link);
                self.deferred.push_back(Deferred::ResolveDetails(link));
            }
            AdapterEvent::DetailsResolved {
                service,
                characteristics,
                ..
            } => self.on_details_resolved(link, service, &characteristics, adapter, events),
            AdapterEvent::ValueReceived {
                characteristic,
                value,
                source,
            } => {
                let decoded = handle
                    .wifi
                    .as_ref()
                    .and_then(|w| w.decode(&characteristic, &value));

                if let Some(info) = decoded {
                    debug!("Wifi info received ({:?}): {}", source, info);
                    self.wifi_info = Some(info.clone());
                    events.send(ProbeEvent::WifiInfoChanged { info });
                }
            }
            AdapterEvent::Subscribed { characteristic } => {
                debug!("Notifications enabled on {}", characteristic.uuid);
            }
            AdapterEvent::WriteCompleted {
                request, result, ..
            } => {
                if handle.pending_writes.remove(&request).is_none() {
                    trace!("Completion for unknown {}", request);
                    return;
                }

                match result {
                    Ok(()) => {
                        trace!("{} written", request);
                        events.send(ProbeEvent::WriteCompleted {
                            request,
                            outcome: WriteOutcome::Written,
                        });
                    }
                    Err(reason) => {
                        let failure = FailureReason::adapter(GattOperation::Write.to_string(), reason);
                        events.send(ProbeEvent::WriteCompleted {
                            request,
                            outcome: WriteOutcome::Failed(failure.clone()),
                        });
                        self.fail(failure, adapter, events);
                    }
                }
            }
            AdapterEvent::OperationFailed {
                operation, reason, ..
            } => {
                self.fail(
                    FailureReason::adapter(operation.to_string(), reason),
                    adapter,
                    events,
                );
            }
            AdapterEvent::Disconnected { .. } => {
                let state = handle.state;
                let requested = handle.disconnect_requested;

                match state {
                    ConnectionState::Connecting => self.fail(
                        FailureReason::adapter(
                            GattOperation::Connect.to_string(),
                            "link closed before connecting",
                        ),
                        adapter,
                        events,
                    ),
                    ConnectionState::Connected if requested => {
                        info!("Disconnected from probe {}", handle.probe_name);
                        self.teardown(ConnectionState::Disconnected, None, events);
                    }
                    _ => self.fail(FailureReason::LinkLost, adapter, events),
                }
            }
            AdapterEvent::DeviceFound { .. }
            | AdapterEvent::ScanFinished { .. }
            | AdapterEvent::ScanFailed { .. } => {}
        }
    }

    /// Run work postponed by earlier events.
    ///
    /// Call after every `handle_event`, once the event handler has returned.
    pub fn run_deferred(&mut self, adapter: &dyn BleAdapter) {
        while let Some(task) = self.deferred.pop_front() {
            match task {
                Deferred::ResolveDetails(link) => {
                    let Some(handle) = self.handle.as_mut().filter(|h| h.link == link && h.is_live())
                    else {
                        continue;
                    };

                    if let Some(power) = handle.power.as_mut() {
                        power.begin_resolution(adapter);
                    }
                    if let Some(wifi) = handle.wifi.as_mut() {
                        wifi.begin_resolution(adapter);
                    }
                }
            }
        }
    }

    fn on_details_resolved(
        &mut self,
        link: LinkId,
        service: uuid::Uuid,
        characteristics: &[ResolvedCharacteristic],
        adapter: &dyn BleAdapter,
        events: &EventDispatcher,
    ) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        match ServiceKind::from_uuid(&service) {
            Some(ServiceKind::Power) => {
                let ready = handle
                    .power
                    .as_mut()
                    .map(|s| s.on_details_resolved(characteristics))
                    .unwrap_or(false);
                if ready {
                    info!("Power service ready on {}", link);
                    events.send(ProbeEvent::PowerReady { ready: true });
                }
            }
            Some(ServiceKind::Wifi) => {
                let Some(session) = handle.wifi.as_mut() else {
                    return;
                };
                if session.on_details_resolved(characteristics) {
                    info!("Wifi service ready on {}", link);
                    events.send(ProbeEvent::WifiReady { ready: true });
                    session.start_updates(adapter);
                }
            }
            None => trace!("Details for unmanaged service {} on {}", service, link),
        }
    }

    /// End the link as `Failed`, releasing it if it was up.
    fn fail(&mut self, reason: FailureReason, adapter: &dyn BleAdapter, events: &EventDispatcher) {
        let Some(handle) = self.handle.as_ref().filter(|h| h.is_live()) else {
            return;
        };

        warn!("Connection to probe {} failed: {}", handle.probe_name, reason);

        if handle.state.is_connected() && reason != FailureReason::LinkLost {
            adapter.disconnect(handle.link);
        }

        self.teardown(ConnectionState::Failed, Some(reason), events);
    }

    /// Move the link to a terminal state and drop everything scoped to it.
    fn teardown(
        &mut self,
        state: ConnectionState,
        reason: Option<FailureReason>,
        events: &EventDispatcher,
    ) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };

        let link = handle.link;
        handle.state = state;
        handle.disconnect_requested = false;
        handle.power = None;
        handle.wifi = None;
        let pending = std::mem::take(&mut handle.pending_writes);

        self.wifi_info = None;
        self.deferred
            .retain(|task| !matches!(task, Deferred::ResolveDetails(l) if *l == link));

        Self::emit_status(events, state, reason.clone());
        Self::emit_readiness(events, ReadinessFlags::default());

        let write_failure = reason.unwrap_or(FailureReason::Disconnected);
        for request in pending.into_keys() {
            debug!("Failing {} after link ended", request);
            events.send(ProbeEvent::WriteCompleted {
                request,
                outcome: WriteOutcome::Failed(write_failure.clone()),
            });
        }
    }

    fn emit_status(events: &EventDispatcher, state: ConnectionState, reason: Option<FailureReason>) {
        debug!("Connection state changed: {}", state);
        events.send(ProbeEvent::ConnectionStatusChanged { state, reason });
    }

    fn emit_readiness(events: &EventDispatcher, flags: ReadinessFlags) {
        events.send(ProbeEvent::PowerReady { ready: flags.power });
        events.send(ProbeEvent::WifiReady { ready: flags.wifi });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{CharacteristicHandle, MockBleAdapter, ValueSource};
    use crate::ble::registry::RegisteredProbe;
    use crate::ble::uuids::*;
    use crate::events::EventReceiver;
    use crate::testing::{AdapterCall, RecordingAdapter};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    struct Harness {
        controller: ConnectionController,
        registry: DeviceRegistry,
        adapter: RecordingAdapter,
        events: EventDispatcher,
        rx: EventReceiver,
    }

    impl Harness {
        fn new() -> Self {
            let mut registry = DeviceRegistry::new();
            registry.replace(vec![RegisteredProbe {
                name: "P100".to_string(),
                device: DiscoveredDevice::new("AA:BB", "CUS-P100"),
            }]);
            let events = EventDispatcher::new(128);
            let rx = events.subscribe();

            Self {
                controller: ConnectionController::new(),
                registry,
                adapter: RecordingAdapter::new(),
                events,
                rx,
            }
        }

        fn connect(&mut self) -> Result<LinkId> {
            self.controller
                .connect("P100", &self.registry, &self.adapter, &self.events)
        }

        fn feed(&mut self, event: AdapterEvent) {
            self.controller
                .handle_event(event, &self.adapter, &self.events);
            self.controller.run_deferred(&self.adapter);
        }

        fn drain(&mut self) -> Vec<ProbeEvent> {
            std::iter::from_fn(|| self.rx.try_recv().ok()).collect()
        }

        fn resolve(&mut self, link: LinkId, service: uuid::Uuid) {
            let characteristics = if service == POWER_SERVICE_UUID {
                vec![ResolvedCharacteristic::new(ALERT_LEVEL_UUID, vec![])]
            } else {
                vec![
                    ResolvedCharacteristic::new(
                        WIFI_PUBLISHED_UUID,
                        vec![CLIENT_CHARACTERISTIC_CONFIG_UUID],
                    ),
                    ResolvedCharacteristic::new(WIFI_REQUEST_UUID, vec![]),
                ]
            };
            self.feed(AdapterEvent::DetailsResolved {
                link,
                service,
                characteristics,
            });
        }

        /// Connect and drive both services to readiness.
        fn ready(&mut self) -> LinkId {
            let link = self.connect().unwrap();
            self.feed(AdapterEvent::Connected { link });
            self.feed(AdapterEvent::ServiceFound {
                link,
                service: POWER_SERVICE_UUID,
            });
            self.feed(AdapterEvent::ServiceFound {
                link,
                service: WIFI_SERVICE_UUID,
            });
            self.feed(AdapterEvent::DiscoveryFinished { link });
            self.resolve(link, POWER_SERVICE_UUID);
            self.resolve(link, WIFI_SERVICE_UUID);
            link
        }
    }

    fn status(state: ConnectionState, reason: Option<FailureReason>) -> ProbeEvent {
        ProbeEvent::ConnectionStatusChanged { state, reason }
    }

    fn published(link: LinkId) -> CharacteristicHandle {
        CharacteristicHandle::new(link, WIFI_SERVICE_UUID, WIFI_PUBLISHED_UUID)
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Idle.accepts_connect());
        assert!(ConnectionState::Failed.accepts_connect());
        assert!(ConnectionState::Disconnected.accepts_connect());
        assert!(!ConnectionState::Connecting.accepts_connect());
        assert!(!ConnectionState::Connected.accepts_connect());

        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert_eq!(format!("{}", ConnectionState::Failed), "Failed");
    }

    #[test]
    fn test_connect_unknown_name() {
        let mut h = Harness::new();

        let err = h
            .controller
            .connect("X9", &h.registry, &h.adapter, &h.events)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = h
            .controller
            .connect("", &h.registry, &h.adapter, &h.events)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        assert!(h.adapter.calls().is_empty());
        assert!(h.drain().is_empty());
        assert_eq!(h.controller.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_readiness_cleared_on_accept() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();

        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert_eq!(h.controller.readiness(), ReadinessFlags::default());
        assert_eq!(
            h.drain(),
            vec![
                ProbeEvent::PowerReady { ready: false },
                ProbeEvent::WifiReady { ready: false },
                status(ConnectionState::Connecting, None),
            ]
        );
        assert_eq!(
            h.adapter.calls(),
            vec![AdapterCall::Connect(link, "AA:BB".to_string())]
        );
    }

    #[test]
    fn test_second_connect_rejected() {
        let mut h = Harness::new();
        let first = h.connect().unwrap();
        h.drain();
        h.adapter.take();

        let err = h.connect().unwrap_err();
        assert!(matches!(err, Error::AlreadyConnecting));
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert_eq!(h.controller.link(), Some(first));
        assert!(h.adapter.calls().is_empty());
        assert!(h.drain().is_empty());

        // The first attempt still completes
        h.feed(AdapterEvent::Connected { link: first });
        assert_eq!(h.controller.state(), ConnectionState::Connected);
        assert!(matches!(h.connect(), Err(Error::AlreadyConnecting)));
    }

    #[test]
    fn test_scenario_full_negotiation() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();
        h.drain();

        h.feed(AdapterEvent::Connected { link });
        assert_eq!(
            h.drain(),
            vec![
                status(ConnectionState::Connected, None),
                ProbeEvent::PowerReady { ready: false },
                ProbeEvent::WifiReady { ready: false },
            ]
        );

        h.feed(AdapterEvent::ServiceFound {
            link,
            service: POWER_SERVICE_UUID,
        });
        h.feed(AdapterEvent::ServiceFound {
            link,
            service: WIFI_SERVICE_UUID,
        });
        h.feed(AdapterEvent::ServiceFound {
            link,
            service: uuid::Uuid::from_u128(0x180a),
        });
        assert!(h.drain().is_empty());

        h.feed(AdapterEvent::DiscoveryFinished { link });
        assert_eq!(
            h.adapter.take(),
            vec![
                AdapterCall::Connect(link, "AA:BB".to_string()),
                AdapterCall::DiscoverServices(link),
                AdapterCall::ResolveDetails(link, POWER_SERVICE_UUID),
                AdapterCall::ResolveDetails(link, WIFI_SERVICE_UUID),
            ]
        );
        assert_eq!(h.controller.readiness(), ReadinessFlags::default());

        h.resolve(link, POWER_SERVICE_UUID);
        assert_eq!(h.drain(), vec![ProbeEvent::PowerReady { ready: true }]);

        h.resolve(link, WIFI_SERVICE_UUID);
        assert_eq!(h.drain(), vec![ProbeEvent::WifiReady { ready: true }]);
        assert_eq!(
            h.controller.readiness(),
            ReadinessFlags {
                power: true,
                wifi: true
            }
        );

        let reads: Vec<_> = h
            .adapter
            .calls()
            .into_iter()
            .filter(|c| matches!(c, AdapterCall::Read(_)))
            .collect();
        assert_eq!(reads, vec![AdapterCall::Read(published(link))]);
        assert_eq!(
            h.adapter.calls(),
            vec![
                AdapterCall::Subscribe(published(link)),
                AdapterCall::Read(published(link)),
            ]
        );
    }

    #[test]
    fn test_resolution_waits_for_next_turn() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();
        h.feed(AdapterEvent::Connected { link });
        h.feed(AdapterEvent::ServiceFound {
            link,
            service: POWER_SERVICE_UUID,
        });
        h.adapter.take();

        h.controller
            .handle_event(AdapterEvent::DiscoveryFinished { link }, &h.adapter, &h.events);
        assert!(h.adapter.calls().is_empty());

        h.controller.run_deferred(&h.adapter);
        assert_eq!(
            h.adapter.calls(),
            vec![AdapterCall::ResolveDetails(link, POWER_SERVICE_UUID)]
        );
    }

    #[test]
    fn test_repeated_service_found_ignored() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();
        h.feed(AdapterEvent::Connected { link });
        h.drain();
        h.adapter.take();

        for _ in 0..2 {
            h.feed(AdapterEvent::ServiceFound {
                link,
                service: POWER_SERVICE_UUID,
            });
        }
        h.feed(AdapterEvent::DiscoveryFinished { link });
        assert_eq!(
            h.adapter.take(),
            vec![AdapterCall::ResolveDetails(link, POWER_SERVICE_UUID)]
        );

        h.resolve(link, POWER_SERVICE_UUID);
        assert_eq!(h.drain(), vec![ProbeEvent::PowerReady { ready: true }]);

        // A late duplicate does not replace the resolved session
        h.feed(AdapterEvent::ServiceFound {
            link,
            service: POWER_SERVICE_UUID,
        });
        assert!(h.drain().is_empty());
        assert!(h.controller.readiness().power);
        assert!(h.adapter.take().is_empty());
        assert!(h.controller.set_power(true, &h.adapter).is_ok());
    }

    #[test]
    fn test_wifi_info_updates() {
        let mut h = Harness::new();
        let link = h.ready();
        h.drain();

        h.feed(AdapterEvent::ValueReceived {
            characteristic: published(link),
            value: Bytes::from_static(b"SSID=Home"),
            source: ValueSource::Notification,
        });
        assert_eq!(
            h.drain(),
            vec![ProbeEvent::WifiInfoChanged {
                info: "SSID=Home".to_string()
            }]
        );
        assert_eq!(h.controller.wifi_info(), Some("SSID=Home"));

        h.feed(AdapterEvent::ValueReceived {
            characteristic: published(link),
            value: Bytes::new(),
            source: ValueSource::Notification,
        });
        assert!(h.drain().is_empty());

        // A read completion is handled exactly like a notification
        h.feed(AdapterEvent::ValueReceived {
            characteristic: published(link),
            value: Bytes::from_static(b"SSID=Lab"),
            source: ValueSource::Read,
        });
        assert_eq!(
            h.drain(),
            vec![ProbeEvent::WifiInfoChanged {
                info: "SSID=Lab".to_string()
            }]
        );
    }

    #[test]
    fn test_operations_before_ready() {
        let mut adapter = MockBleAdapter::new();
        adapter.expect_write().never();
        adapter.expect_connect().return_const(());
        adapter.expect_discover_services().return_const(());

        let mut registry = DeviceRegistry::new();
        registry.replace(vec![RegisteredProbe {
            name: "P100".to_string(),
            device: DiscoveredDevice::new("AA:BB", "CUS-P100"),
        }]);
        let events = EventDispatcher::default();
        let mut controller = ConnectionController::new();

        assert!(matches!(
            controller.set_power(true, &adapter),
            Err(Error::NotReady {
                service: ServiceKind::Power
            })
        ));
        assert!(matches!(
            controller.request_wifi_change("", &adapter),
            Err(Error::InvalidArgument { .. })
        ));

        let link = controller
            .connect("P100", &registry, &adapter, &events)
            .unwrap();
        controller.handle_event(AdapterEvent::Connected { link }, &adapter, &events);
        controller.handle_event(
            AdapterEvent::ServiceFound {
                link,
                service: WIFI_SERVICE_UUID,
            },
            &adapter,
            &events,
        );

        assert!(matches!(
            controller.set_power(false, &adapter),
            Err(Error::NotReady {
                service: ServiceKind::Power
            })
        ));
        assert!(matches!(
            controller.request_wifi_change("SSID=Home", &adapter),
            Err(Error::NotReady {
                service: ServiceKind::Wifi
            })
        ));
        assert_eq!(controller.pending_writes(), 0);
    }

    #[test]
    fn test_empty_wifi_request_when_ready() {
        let mut h = Harness::new();
        h.ready();
        h.adapter.take();

        let err = h
            .controller
            .request_wifi_change("", &h.adapter)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert!(h.adapter.writes().is_empty());
    }

    #[test]
    fn test_writes_complete() {
        let mut h = Harness::new();
        let link = h.ready();
        h.drain();

        let power = tokio_test::assert_ok!(h.controller.set_power(true, &h.adapter));
        let wifi = tokio_test::assert_ok!(h.controller.request_wifi_change("SSID=Lab", &h.adapter));
        assert_ne!(power, wifi);
        assert_eq!(h.controller.pending_writes(), 2);

        let writes = h.adapter.writes();
        assert_eq!(&writes[0].1[..], &[crate::session::POWER_ON]);
        assert_eq!(writes[0].2, crate::ble::adapter::WriteKind::WithoutResponse);
        assert_eq!(&writes[1].1[..], b"SSID=Lab");

        h.feed(AdapterEvent::WriteCompleted {
            link,
            request: power,
            result: Ok(()),
        });
        assert_eq!(
            h.drain(),
            vec![ProbeEvent::WriteCompleted {
                request: power,
                outcome: WriteOutcome::Written
            }]
        );
        assert_eq!(h.controller.pending_writes(), 1);
    }

    #[test]
    fn test_scenario_link_lost() {
        let mut h = Harness::new();
        let link = h.ready();
        let request = h.controller.request_wifi_change("SSID=Lab", &h.adapter).unwrap();
        h.drain();
        h.adapter.take();

        h.feed(AdapterEvent::Disconnected { link });

        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert_eq!(h.controller.readiness(), ReadinessFlags::default());
        assert_eq!(
            h.drain(),
            vec![
                status(ConnectionState::Failed, Some(FailureReason::LinkLost)),
                ProbeEvent::PowerReady { ready: false },
                ProbeEvent::WifiReady { ready: false },
                ProbeEvent::WriteCompleted {
                    request,
                    outcome: WriteOutcome::Failed(FailureReason::LinkLost)
                },
            ]
        );
        // A lost link is not released again
        assert!(h.adapter.calls().is_empty());

        // The write's late completion must not turn into a success
        h.feed(AdapterEvent::WriteCompleted {
            link,
            request,
            result: Ok(()),
        });
        h.feed(AdapterEvent::ValueReceived {
            characteristic: published(link),
            value: Bytes::from_static(b"SSID=Home"),
            source: ValueSource::Notification,
        });
        assert!(h.drain().is_empty());

        assert!(matches!(
            h.controller.set_power(true, &h.adapter),
            Err(Error::NotReady { .. })
        ));
    }

    #[test]
    fn test_reconnect_after_failure_uses_new_link() {
        let mut h = Harness::new();
        let first = h.ready();
        h.feed(AdapterEvent::Disconnected { link: first });

        let second = h.connect().unwrap();
        assert_ne!(first, second);
        h.drain();

        // Completions for the first link cannot touch the second
        h.feed(AdapterEvent::Connected { link: first });
        h.feed(AdapterEvent::ServiceFound {
            link: first,
            service: POWER_SERVICE_UUID,
        });
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
        assert!(h.drain().is_empty());
    }

    #[test]
    fn test_explicit_disconnect() {
        let mut h = Harness::new();
        let link = h.ready();
        h.drain();
        h.adapter.take();

        tokio_test::assert_ok!(h.controller.disconnect(&h.adapter));
        tokio_test::assert_ok!(h.controller.disconnect(&h.adapter));
        assert_eq!(h.adapter.take(), vec![AdapterCall::Disconnect(link)]);
        assert_eq!(h.controller.state(), ConnectionState::Connected);

        h.feed(AdapterEvent::Disconnected { link });
        assert_eq!(h.controller.state(), ConnectionState::Disconnected);
        assert_eq!(
            h.drain(),
            vec![
                status(ConnectionState::Disconnected, None),
                ProbeEvent::PowerReady { ready: false },
                ProbeEvent::WifiReady { ready: false },
            ]
        );

        assert!(matches!(
            h.controller.disconnect(&h.adapter),
            Err(Error::NotConnected)
        ));
    }

    #[test]
    fn test_disconnect_while_connecting_rejected() {
        let mut h = Harness::new();
        h.connect().unwrap();
        h.adapter.take();

        assert!(matches!(
            h.controller.disconnect(&h.adapter),
            Err(Error::NotConnected)
        ));
        assert!(h.adapter.calls().is_empty());
        assert_eq!(h.controller.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_failure() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();
        h.drain();
        h.adapter.take();

        h.feed(AdapterEvent::OperationFailed {
            link,
            operation: GattOperation::Connect,
            reason: "timed out".to_string(),
        });

        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert_eq!(
            h.drain()[0],
            status(
                ConnectionState::Failed,
                Some(FailureReason::adapter("connect", "timed out"))
            )
        );
        // Nothing to release, the link never came up
        assert!(h.adapter.calls().is_empty());
        assert!(h.connect().is_ok());
    }

    #[test]
    fn test_discovery_failure_releases_link() {
        let mut h = Harness::new();
        let link = h.connect().unwrap();
        h.feed(AdapterEvent::Connected { link });
        h.adapter.take();

        h.feed(AdapterEvent::OperationFailed {
            link,
            operation: GattOperation::DiscoverServices,
            reason: "gatt error 133".to_string(),
        });

        assert_eq!(h.controller.state(), ConnectionState::Failed);
        assert_eq!(h.adapter.calls(), vec![AdapterCall::Disconnect(link)]);

        // The release completion arrives for an ended link and is dropped
        h.drain();
        h.feed(AdapterEvent::Disconnected { link });
        assert!(h.drain().is_empty());
        assert_eq!(h.controller.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_failed_write_fails_link() {
        let mut h = Harness::new();
        let link = h.ready();
        let request = h.controller.set_power(false, &h.adapter).unwrap();
        h.drain();

        h.feed(AdapterEvent::WriteCompleted {
            link,
            request,
            result: Err("not permitted".to_string()),
        });

        let failure = FailureReason::adapter("write", "not permitted");
        let events = h.drain();
        assert_eq!(
            events[0],
            ProbeEvent::WriteCompleted {
                request,
                outcome: WriteOutcome::Failed(failure.clone())
            }
        );
        assert_eq!(events[1], status(ConnectionState::Failed, Some(failure)));
        assert_eq!(h.controller.state(), ConnectionState::Failed);
    }
}
