//! Single-context dispatcher for the probe state machine.
//!
//! [`ProbeController`] owns the adapter, the scanner and the connection
//! controller. Caller operations and adapter completions are applied one at
//! a time, so nothing in here needs locking.

use tracing::{debug, info};

use crate::ble::adapter::{AdapterEvent, BleAdapter, LinkId, RequestId, ScanId};
use crate::ble::connection::{ConnectionController, ConnectionState, ReadinessFlags};
use crate::ble::registry::DeviceRegistry;
use crate::ble::scanner::DiscoveryScanner;
use crate::config::ProbeConfig;
use crate::error::Result;
use crate::events::{EventDispatcher, EventReceiver};

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeStatus {
    /// Connection state.
    pub state: ConnectionState,
    /// Name of the probe on the live link.
    pub probe: Option<String>,
    /// Service readiness.
    pub readiness: ReadinessFlags,
    /// Last published wifi info.
    pub wifi_info: Option<String>,
    /// Probes from the last completed scan.
    pub probe_names: Vec<String>,
    /// Whether a scan is running.
    pub scanning: bool,
}

/// Drives discovery and the probe connection through a [`BleAdapter`].
pub struct ProbeController<A> {
    adapter: A,
    config: ProbeConfig,
    scanner: DiscoveryScanner,
    connection: ConnectionController,
    events: EventDispatcher,
}

impl<A: BleAdapter> ProbeController<A> {
    /// Create a controller over `adapter`.
    pub fn new(adapter: A, config: ProbeConfig) -> Self {
        Self {
            adapter,
            scanner: DiscoveryScanner::new(config.clone()),
            connection: ConnectionController::new(),
            events: EventDispatcher::new(config.event_capacity),
            config,
        }
    }

    /// Subscribe to probe events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// A handle to the event dispatcher.
    pub fn dispatcher(&self) -> EventDispatcher {
        self.events.clone()
    }

    /// Start a discovery scan.
    ///
    /// A connected probe is disconnected first and a running scan is
    /// stopped.
    pub fn start_scan(&mut self) -> ScanId {
        if self.connection.is_connected() {
            info!("Disconnecting probe before scanning");
            if let Err(e) = self.connection.disconnect(&self.adapter) {
                debug!("Disconnect before scan skipped: {}", e);
            }
        }

        self.scanner.start_scan(&self.adapter)
    }

    /// Stop the running scan. Returns `false` if none was running.
    pub fn stop_scan(&mut self) -> bool {
        self.scanner.stop_scan(&self.adapter)
    }

    /// Connect to the probe registered under `name`.
    pub fn connect(&mut self, name: &str) -> Result<LinkId> {
        self.connection
            .connect(name, self.scanner.registry(), &self.adapter, &self.events)
    }

    /// Disconnect the connected probe.
    pub fn disconnect(&mut self) -> Result<()> {
        self.connection.disconnect(&self.adapter)
    }

    /// Power the probe on or off.
    pub fn set_power(&mut self, on: bool) -> Result<RequestId> {
        self.connection.set_power(on, &self.adapter)
    }

    /// Ask the probe to join a different Wi-Fi network.
    pub fn request_wifi_change(&mut self, info: &str) -> Result<RequestId> {
        self.connection.request_wifi_change(info, &self.adapter)
    }

    /// Apply one adapter completion, then run any work it deferred.
    pub fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::DeviceFound { scan, device } => {
                self.scanner.handle_device_found(scan, device)
            }
            AdapterEvent::ScanFinished { scan } => self.scanner.handle_finished(scan, &self.events),
            AdapterEvent::ScanFailed { scan, reason } => {
                self.scanner.handle_failed(scan, &reason, &self.events)
            }
            event => self
                .connection
                .handle_event(event, &self.adapter, &self.events),
        }

        self.connection.run_deferred(&self.adapter);
    }

    /// Stop scanning and release the probe.
    pub fn shutdown(&mut self) {
        info!("Shutting down probe controller");

        self.stop_scan();
        if self.connection.is_connected() {
            if let Err(e) = self.connection.disconnect(&self.adapter) {
                debug!("Disconnect on shutdown skipped: {}", e);
            }
        }
    }

    /// Probes from the last completed scan.
    pub fn registry(&self) -> &DeviceRegistry {
        self.scanner.registry()
    }

    /// Names of the probes from the last completed scan.
    pub fn probe_names(&self) -> Vec<String> {
        self.scanner.registry().names()
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.scanner.is_scanning()
    }

    /// Get the connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Name of the probe on the live link.
    pub fn connected_probe(&self) -> Option<&str> {
        self.connection.probe_name()
    }

    /// Service readiness.
    pub fn readiness(&self) -> ReadinessFlags {
        self.connection.readiness()
    }

    /// Last wifi info published on the current link.
    pub fn wifi_info(&self) -> Option<&str> {
        self.connection.wifi_info()
    }

    /// Snapshot of the controller state.
    pub fn status(&self) -> ProbeStatus {
        ProbeStatus {
            state: self.connection_state(),
            probe: self.connected_probe().map(str::to_string),
            readiness: self.readiness(),
            wifi_info: self.wifi_info().map(str::to_string),
            probe_names: self.probe_names(),
            scanning: self.is_scanning(),
        }
    }

    /// Get the adapter.
    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Get the configuration.
    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }
}

impl<A> std::fmt::Debug for ProbeController<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeController")
            .field("scanner", &self.scanner)
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
