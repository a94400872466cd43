//! Discovery scanning.
//!
//! Drives timed scans through a [`BleAdapter`] and replaces the
//! [`DeviceRegistry`] with the probes each completed scan reported.

use tracing::{debug, info, trace, warn};

use crate::ble::adapter::{BleAdapter, DiscoveredDevice, ScanId};
use crate::ble::registry::{DeviceRegistry, RegisteredProbe};
use crate::config::ProbeConfig;
use crate::events::{EventDispatcher, ProbeEvent};

/// Scanner state for discovering probes.
#[derive(Debug)]
pub struct DiscoveryScanner {
    /// Naming rules and scan duration.
    config: ProbeConfig,
    /// Probes from the last completed scan.
    registry: DeviceRegistry,
    /// The scan currently running, if any.
    active: Option<ScanId>,
    /// Id for the next scan.
    next_scan: ScanId,
    /// Devices reported so far by the active scan.
    seen: Vec<DiscoveredDevice>,
}

impl DiscoveryScanner {
    /// Create a new scanner with an empty registry.
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
            active: None,
            next_scan: ScanId::new(1),
            seen: Vec::new(),
        }
    }

    /// Start a new scan, stopping any scan already running.
    pub fn start_scan(&mut self, adapter: &dyn BleAdapter) -> ScanId {
        self.stop_scan(adapter);

        let scan = self.next_scan;
        self.next_scan = scan.next();
        self.active = Some(scan);

        info!(
            "Starting BLE scan {} for {:?}",
            scan, self.config.scan_timeout
        );
        adapter.start_scan(scan, self.config.scan_timeout);

        scan
    }

    /// Stop the running scan. Returns `false` if none was running.
    ///
    /// The registry keeps the results of the last completed scan.
    pub fn stop_scan(&mut self, adapter: &dyn BleAdapter) -> bool {
        match self.active.take() {
            Some(scan) => {
                debug!("Stopping BLE scan {}", scan);
                self.seen.clear();
                adapter.stop_scan(scan);
                true
            }
            None => false,
        }
    }

    /// Check if a scan is running.
    pub fn is_scanning(&self) -> bool {
        self.active.is_some()
    }

    /// Probes from the last completed scan.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Record a device reported by a scan.
    pub fn handle_device_found(&mut self, scan: ScanId, device: DiscoveredDevice) {
        if !self.is_active(scan) {
            trace!("Ignoring device {} from stale {}", device.identifier, scan);
            return;
        }

        trace!("Device discovered: {} ({})", device.identifier, device.name);

        match self
            .seen
            .iter_mut()
            .find(|d| d.identifier == device.identifier)
        {
            Some(existing) => existing.name = device.name,
            None => self.seen.push(device),
        }
    }

    /// Publish the results of a completed scan.
    pub fn handle_finished(&mut self, scan: ScanId, events: &EventDispatcher) {
        if !self.is_active(scan) {
            trace!("Ignoring completion of stale {}", scan);
            return;
        }

        self.active = None;
        let seen = std::mem::take(&mut self.seen);
        self.registry.replace(self.filter_probes(seen));

        let names = self.registry.names();
        info!("Scan {} finished, {} probe(s) found", scan, names.len());

        events.send(ProbeEvent::DevicesUpdated { names });
    }

    /// Handle a scan the adapter could not run.
    ///
    /// The registry is cleared and an empty list published.
    pub fn handle_failed(&mut self, scan: ScanId, reason: &str, events: &EventDispatcher) {
        if !self.is_active(scan) {
            trace!("Ignoring failure of stale {}", scan);
            return;
        }

        warn!("Scan {} failed: {}", scan, reason);

        self.active = None;
        self.seen.clear();
        self.registry.clear();

        events.send(ProbeEvent::DevicesUpdated { names: Vec::new() });
    }

    fn is_active(&self, scan: ScanId) -> bool {
        self.active == Some(scan)
    }

    /// Keep probe-family devices and give them their user-facing names.
    fn filter_probes(&self, devices: Vec<DiscoveredDevice>) -> Vec<RegisteredProbe> {
        devices
            .into_iter()
            .filter_map(|device| {
                let name = self.config.probe_name(&device.name);
                if name.is_none() {
                    debug!("Ignoring non-probe device: {:?}", device.name);
                }
                name.map(|name| RegisteredProbe { name, device })
            })
            .collect()
    }
}
