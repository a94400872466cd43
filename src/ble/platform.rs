//! [`BleAdapter`] backed by btleplug.
//!
//! Each request spawns a task on the current tokio runtime and reports its
//! completion on an unbounded channel of [`AdapterEvent`]s. Scans run one
//! after another, and so do connects and releases, so the stack never sees
//! a start racing the stop before it.

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use btleplug::platform::PeripheralId;
use futures::stream::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{
    AdapterEvent, BleAdapter, CharacteristicHandle, DiscoveredDevice, GattOperation, LinkId,
    RequestId, ResolvedCharacteristic, ScanId, ValueSource, WriteKind,
};
use crate::error::{Error, Result};

/// Sender half for adapter completions.
pub type AdapterEventSender = mpsc::UnboundedSender<AdapterEvent>;

/// A connected peripheral and the tasks listening on it.
struct LinkEntry {
    peripheral: Peripheral,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for LinkEntry {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Runs queued tasks one at a time, in the order they were pushed.
#[derive(Default)]
struct TaskQueue {
    tail: Option<JoinHandle<()>>,
}

impl TaskQueue {
    /// Spawn `task` to start once everything pushed before it has ended.
    fn push<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let previous = self.tail.take();
        self.tail = Some(tokio::spawn(async move {
            if let Some(previous) = previous {
                // A cancelled or panicked predecessor still counts as ended
                let _ = previous.await;
            }
            task.await;
        }));
    }
}

/// Scan tasks and the switch that cancels the latest one.
#[derive(Default)]
struct ScanQueue {
    tasks: TaskQueue,
    /// Dropping the sender cancels the scan.
    current: Option<(ScanId, oneshot::Sender<()>)>,
}

impl ScanQueue {
    /// Cancel the current scan and queue `scan` behind it.
    ///
    /// The new scan only starts after the cancelled one has stopped the
    /// stack's scan.
    fn replace<F, Fut>(&mut self, scan: ScanId, run: F)
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (cancel, cancelled) = oneshot::channel();
        if let Some((previous, _)) = self.current.replace((scan, cancel)) {
            debug!("Cancelling superseded {}", previous);
        }
        self.tasks.push(run(cancelled));
    }

    /// Cancel `scan` if it is the current one.
    fn cancel(&mut self, scan: ScanId) -> bool {
        if self.current.as_ref().map(|(current, _)| *current) != Some(scan) {
            return false;
        }
        self.current = None;
        true
    }
}

/// BLE adapter running on the system Bluetooth stack.
pub struct BtleplugAdapter {
    /// The Bluetooth adapter.
    adapter: Adapter,
    /// Where completions are sent.
    events: AdapterEventSender,
    /// Peripherals reported by scans, by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Links that have been opened.
    links: Arc<RwLock<HashMap<LinkId, LinkEntry>>>,
    /// Scans, one at a time.
    scans: Mutex<ScanQueue>,
    /// Connects and releases, one at a time.
    link_ops: Mutex<TaskQueue>,
}

impl BtleplugAdapter {
    /// Open the first Bluetooth adapter on the system.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new(events: AdapterEventSender) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let mut adapters = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter();
        let adapter = adapters.next().ok_or(Error::BluetoothUnavailable)?;
        if adapters.len() > 0 {
            debug!("Ignoring {} further Bluetooth adapters", adapters.len());
        }

        let description = adapter
            .adapter_info()
            .await
            .unwrap_or_else(|e| format!("unknown ({})", e));
        info!("Using Bluetooth adapter {}", description);

        Ok(Self::with_adapter(adapter, events))
    }

    /// Create an adapter around a specific btleplug adapter.
    pub fn with_adapter(adapter: Adapter, events: AdapterEventSender) -> Self {
        Self {
            adapter,
            events,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
            scans: Mutex::new(ScanQueue::default()),
            link_ops: Mutex::new(TaskQueue::default()),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn peripheral(&self, link: LinkId) -> Option<Peripheral> {
        self.links.read().get(&link).map(|e| e.peripheral.clone())
    }

    /// Look up the peripheral and characteristic behind a handle, or report
    /// the operation as failed.
    fn resolve(
        &self,
        handle: &CharacteristicHandle,
        operation: GattOperation,
    ) -> Option<(Peripheral, Characteristic)> {
        let found = self.peripheral(handle.link).and_then(|p| {
            find_characteristic(&p, handle.service, handle.uuid).map(|c| (p, c))
        });

        if found.is_none() {
            emit(
                &self.events,
                AdapterEvent::OperationFailed {
                    link: handle.link,
                    operation,
                    reason: format!("characteristic {} not found", handle.uuid),
                },
            );
        }

        found
    }

    /// Scan for `timeout` and report the devices seen in that window.
    ///
    /// Returns `false` without reporting anything if `cancelled` fires.
    async fn run_scan(
        adapter: Adapter,
        scan: ScanId,
        timeout: Duration,
        mut cancelled: oneshot::Receiver<()>,
        peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
        events: &AdapterEventSender,
    ) -> Result<bool> {
        if !matches!(
            cancelled.try_recv(),
            Err(oneshot::error::TryRecvError::Empty)
        ) {
            return Ok(false);
        }

        // Subscribe first so reports from the start of the scan are kept
        let central_events = adapter.events().await.map_err(Error::Bluetooth)?;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;
        debug!("{} running for {:?}", scan, timeout);

        let ids = central_events.filter_map(|event| futures::future::ready(reported_id(event)));
        futures::pin_mut!(ids);
        let seen = collect_window(ids, timeout, &mut cancelled).await;

        let stopped = adapter.stop_scan().await;
        let Some(seen) = seen else {
            if let Err(e) = stopped {
                debug!("Failed to stop cancelled {}: {}", scan, e);
            }
            return Ok(false);
        };
        stopped.map_err(Error::Bluetooth)?;

        for id in seen {
            let peripheral = match adapter.peripheral(&id).await {
                Ok(peripheral) => peripheral,
                Err(e) => {
                    debug!("Device {} no longer known: {}", id, e);
                    continue;
                }
            };
            let name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                _ => None,
            };
            let Some(name) = name else {
                continue;
            };

            let identifier = id.to_string();
            trace!("Device discovered: {} ({})", identifier, name);

            peripherals.write().insert(identifier.clone(), peripheral);
            emit(
                events,
                AdapterEvent::DeviceFound {
                    scan,
                    device: DiscoveredDevice::new(identifier, name),
                },
            );
        }

        Ok(true)
    }

    /// Forward notifications from a peripheral until the stream ends.
    async fn listen_notifications(peripheral: Peripheral, link: LinkId, events: AdapterEventSender) {
        let mut notifications = match peripheral.notifications().await {
            Ok(n) => n,
            Err(e) => {
                error!("Failed to get notifications stream: {}", e);
                return;
            }
        };

        while let Some(notification) = notifications.next().await {
            trace!(
                "Notification received from {}: {} bytes",
                notification.uuid,
                notification.value.len()
            );

            let Some(service) = peripheral
                .characteristics()
                .iter()
                .find(|c| c.uuid == notification.uuid)
                .map(|c| c.service_uuid)
            else {
                continue;
            };

            emit(
                &events,
                AdapterEvent::ValueReceived {
                    characteristic: CharacteristicHandle::new(link, service, notification.uuid),
                    value: Bytes::from(notification.value),
                    source: ValueSource::Notification,
                },
            );
        }

        debug!("Notification listener for {} stopped", link);
    }

    /// Report the link as down when the stack says the peripheral dropped.
    async fn watch_disconnect(
        adapter: Adapter,
        peripheral: Peripheral,
        link: LinkId,
        events: AdapterEventSender,
    ) {
        let mut central_events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
                error!("Failed to get adapter events: {}", e);
                return;
            }
        };

        let id = peripheral.id();
        while let Some(event) = central_events.next().await {
            if let CentralEvent::DeviceDisconnected(dropped) = event {
                if dropped == id {
                    debug!("Peripheral on {} disconnected", link);
                    emit(&events, AdapterEvent::Disconnected { link });
                    return;
                }
            }
        }
    }
}

impl BleAdapter for BtleplugAdapter {
    fn start_scan(&self, scan: ScanId, timeout: Duration) {
        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let events = self.events.clone();

        self.scans.lock().replace(scan, move |cancelled| async move {
            match Self::run_scan(adapter, scan, timeout, cancelled, peripherals, &events).await {
                Ok(true) => emit(&events, AdapterEvent::ScanFinished { scan }),
                Ok(false) => debug!("{} cancelled", scan),
                Err(e) => emit(
                    &events,
                    AdapterEvent::ScanFailed {
                        scan,
                        reason: e.to_string(),
                    },
                ),
            }
        });
    }

    fn stop_scan(&self, scan: ScanId) {
        // The scan task stops the stack's scan itself once cancelled
        if self.scans.lock().cancel(scan) {
            debug!("Stopping {}", scan);
        }
    }

    fn connect(&self, link: LinkId, device: &DiscoveredDevice) {
        let Some(peripheral) = self.peripherals.read().get(&device.identifier).cloned() else {
            emit(
                &self.events,
                AdapterEvent::OperationFailed {
                    link,
                    operation: GattOperation::Connect,
                    reason: format!("unknown device {}", device.identifier),
                },
            );
            return;
        };

        // One link at a time; earlier entries only hold stale listeners
        {
            let mut links = self.links.write();
            links.clear();
            links.insert(
                link,
                LinkEntry {
                    peripheral: peripheral.clone(),
                    tasks: Vec::new(),
                },
            );
        }

        let adapter = self.adapter.clone();
        let links = self.links.clone();
        let events = self.events.clone();

        // Queued behind any release still in flight on the same peripheral
        self.link_ops.lock().push(async move {
            if let Err(e) = peripheral.connect().await {
                emit(
                    &events,
                    AdapterEvent::OperationFailed {
                        link,
                        operation: GattOperation::Connect,
                        reason: e.to_string(),
                    },
                );
                return;
            }

            let listeners = vec![
                tokio::spawn(Self::listen_notifications(
                    peripheral.clone(),
                    link,
                    events.clone(),
                )),
                tokio::spawn(Self::watch_disconnect(
                    adapter,
                    peripheral,
                    link,
                    events.clone(),
                )),
            ];

            match links.write().get_mut(&link) {
                Some(entry) => entry.tasks.extend(listeners),
                None => {
                    // Released while connecting
                    for task in listeners {
                        task.abort();
                    }
                    return;
                }
            }

            emit(&events, AdapterEvent::Connected { link });
        });
    }

    fn discover_services(&self, link: LinkId) {
        let Some(peripheral) = self.peripheral(link) else {
            warn!("Service discovery requested for unknown {}", link);
            return;
        };
        let events = self.events.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                emit(
                    &events,
                    AdapterEvent::OperationFailed {
                        link,
                        operation: GattOperation::DiscoverServices,
                        reason: e.to_string(),
                    },
                );
                return;
            }

            for service in peripheral.services() {
                debug!("Found service {} on {}", service.uuid, link);
                emit(
                    &events,
                    AdapterEvent::ServiceFound {
                        link,
                        service: service.uuid,
                    },
                );
            }

            emit(&events, AdapterEvent::DiscoveryFinished { link });
        });
    }

    fn resolve_details(&self, link: LinkId, service: Uuid) {
        // btleplug resolves characteristics and descriptors during service
        // discovery, so this only reports what is already known.
        let found = self
            .peripheral(link)
            .and_then(|p| p.services().into_iter().find(|s| s.uuid == service));

        let event = match found {
            Some(service) => AdapterEvent::DetailsResolved {
                link,
                service: service.uuid,
                characteristics: service
                    .characteristics
                    .into_iter()
                    .map(|c| {
                        ResolvedCharacteristic::new(
                            c.uuid,
                            c.descriptors.into_iter().map(|d| d.uuid).collect(),
                        )
                    })
                    .collect(),
            },
            None => AdapterEvent::OperationFailed {
                link,
                operation: GattOperation::ResolveDetails,
                reason: format!("service {} not found", service),
            },
        };

        emit(&self.events, event);
    }

    fn read(&self, characteristic: CharacteristicHandle) {
        let Some((peripheral, resolved)) = self.resolve(&characteristic, GattOperation::Read)
        else {
            return;
        };
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match peripheral.read(&resolved).await {
                Ok(data) => {
                    trace!("Read {} bytes from characteristic {}", data.len(), resolved.uuid);
                    AdapterEvent::ValueReceived {
                        characteristic,
                        value: Bytes::from(data),
                        source: ValueSource::Read,
                    }
                }
                Err(e) => AdapterEvent::OperationFailed {
                    link: characteristic.link,
                    operation: GattOperation::Read,
                    reason: e.to_string(),
                },
            };
            emit(&events, event);
        });
    }

    fn write(
        &self,
        characteristic: CharacteristicHandle,
        value: Bytes,
        kind: WriteKind,
        request: RequestId,
    ) {
        let link = characteristic.link;
        let Some((peripheral, resolved)) = self.peripheral(link).and_then(|p| {
            find_characteristic(&p, characteristic.service, characteristic.uuid).map(|c| (p, c))
        }) else {
            emit(
                &self.events,
                AdapterEvent::WriteCompleted {
                    link,
                    request,
                    result: Err(format!("characteristic {} not found", characteristic.uuid)),
                },
            );
            return;
        };
        let events = self.events.clone();

        tokio::spawn(async move {
            let result = peripheral
                .write(&resolved, &value, write_type(kind))
                .await
                .map_err(|e| e.to_string());

            if result.is_ok() {
                trace!("Wrote {} bytes to characteristic {}", value.len(), resolved.uuid);
            }

            emit(
                &events,
                AdapterEvent::WriteCompleted {
                    link,
                    request,
                    result,
                },
            );
        });
    }

    fn subscribe(&self, characteristic: CharacteristicHandle) {
        let Some((peripheral, resolved)) = self.resolve(&characteristic, GattOperation::Subscribe)
        else {
            return;
        };
        let events = self.events.clone();

        tokio::spawn(async move {
            let event = match peripheral.subscribe(&resolved).await {
                Ok(()) => AdapterEvent::Subscribed { characteristic },
                Err(e) => AdapterEvent::OperationFailed {
                    link: characteristic.link,
                    operation: GattOperation::Subscribe,
                    reason: e.to_string(),
                },
            };
            emit(&events, event);
        });
    }

    fn disconnect(&self, link: LinkId) {
        let entry = self.links.write().remove(&link);
        let events = self.events.clone();

        self.link_ops.lock().push(async move {
            if let Some(entry) = entry {
                if let Err(e) = entry.peripheral.disconnect().await {
                    debug!("Failed to disconnect {}: {}", link, e);
                }
            }
            emit(&events, AdapterEvent::Disconnected { link });
        });
    }
}

/// The peripheral a central event reports as seen by the scan.
fn reported_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        _ => None,
    }
}

/// Collect the ids reported during `window`, each once, in first-seen order.
///
/// Returns `None` if `cancelled` fires before the window closes.
async fn collect_window<S, I>(
    mut ids: S,
    window: Duration,
    cancelled: &mut oneshot::Receiver<()>,
) -> Option<Vec<I>>
where
    S: Stream<Item = I> + Unpin,
    I: PartialEq,
{
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    let mut seen = Vec::new();
    let mut open = true;

    loop {
        tokio::select! {
            _ = &mut deadline => return Some(seen),
            _ = &mut *cancelled => return None,
            id = ids.next(), if open => match id {
                Some(id) if !seen.contains(&id) => seen.push(id),
                Some(_) => {}
                None => open = false,
            },
        }
    }
}

/// Find a characteristic by service and UUID.
fn find_characteristic(peripheral: &Peripheral, service: Uuid, uuid: Uuid) -> Option<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid && c.service_uuid == service)
}

fn write_type(kind: WriteKind) -> WriteType {
    match kind {
        WriteKind::WithResponse => WriteType::WithResponse,
        WriteKind::WithoutResponse => WriteType::WithoutResponse,
    }
}

/// Send a completion, ignoring a closed channel.
fn emit(events: &AdapterEventSender, event: AdapterEvent) {
    if events.send(event).is_err() {
        trace!("Adapter event receiver dropped");
    }
}
