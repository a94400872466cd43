//! Device manager for discovering and controlling ultrasound probes.
//!
//! Runs a [`ProbeController`] on its own tokio task. Caller requests arrive
//! as commands and adapter completions arrive on the adapter's event
//! channel; the task applies both one at a time.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::adapter::{AdapterEvent, BleAdapter, LinkId, RequestId, ScanId};
use crate::ble::platform::BtleplugAdapter;
use crate::config::ProbeConfig;
use crate::controller::{ProbeController, ProbeStatus};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, ProbeEvent};

/// Handle for a callback registered with [`DeviceManager::on_event`].
///
/// The callback runs on its own task until the handle is dropped or
/// unregistered, or the manager's event channel closes.
#[derive(Debug)]
pub struct CallbackHandle {
    id: u64,
    task: JoinHandle<()>,
}

impl CallbackHandle {
    /// Stop delivering events to the callback.
    pub fn unregister(self) {}

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if the callback still receives events.
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Feed events to `callback` until the channel closes.
///
/// A callback that falls behind skips the events it missed.
async fn forward_events<F>(id: u64, mut rx: EventReceiver, callback: F)
where
    F: Fn(ProbeEvent),
{
    loop {
        match rx.recv().await {
            Ok(event) => callback(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!("Callback {} fell behind, skipped {} events", id, skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }

    debug!("Callback {} stopped", id);
}

/// Requests forwarded to the controller task.
enum Command {
    StartScan(oneshot::Sender<ScanId>),
    StopScan(oneshot::Sender<bool>),
    Connect {
        name: String,
        reply: oneshot::Sender<Result<LinkId>>,
    },
    Disconnect(oneshot::Sender<Result<()>>),
    SetPower {
        on: bool,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    RequestWifiChange {
        info: String,
        reply: oneshot::Sender<Result<RequestId>>,
    },
    Status(oneshot::Sender<ProbeStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Central manager for discovering and controlling a probe.
pub struct DeviceManager {
    /// Command channel into the controller task.
    commands: mpsc::UnboundedSender<Command>,
    /// Probe event channel.
    events: EventDispatcher,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Controller task handle.
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a device manager on the system Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(ProbeConfig::default()).await
    }

    /// Create a device manager with a custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: ProbeConfig) -> Result<Self> {
        let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
        let adapter = BtleplugAdapter::new(adapter_tx).await?;

        Ok(Self::spawn(adapter, adapter_rx, config))
    }

    /// Run a controller over `adapter` on a new task.
    ///
    /// `adapter_events` must receive every completion `adapter` reports.
    pub fn spawn<A>(
        adapter: A,
        adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        config: ProbeConfig,
    ) -> Self
    where
        A: BleAdapter + 'static,
    {
        let controller = ProbeController::new(adapter, config);
        let events = controller.dispatcher();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(Self::run(controller, adapter_events, command_rx));

        Self {
            commands,
            events,
            callback_counter: AtomicU64::new(0),
            driver: Mutex::new(Some(driver)),
        }
    }

    /// Controller task: completions first, then caller commands.
    async fn run<A: BleAdapter>(
        mut controller: ProbeController<A>,
        mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = adapter_events.recv() => {
                    controller.handle_adapter_event(event);
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        controller.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => Self::apply(&mut controller, command),
                    None => {
                        controller.shutdown();
                        break;
                    }
                },
            }
        }

        debug!("Device manager task ended");
    }

    fn apply<A: BleAdapter>(controller: &mut ProbeController<A>, command: Command) {
        // A dropped reply receiver means the caller stopped waiting
        match command {
            Command::StartScan(reply) => {
                let _ = reply.send(controller.start_scan());
            }
            Command::StopScan(reply) => {
                let _ = reply.send(controller.stop_scan());
            }
            Command::Connect { name, reply } => {
                let _ = reply.send(controller.connect(&name));
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(controller.disconnect());
            }
            Command::SetPower { on, reply } => {
                let _ = reply.send(controller.set_power(on));
            }
            Command::RequestWifiChange { info, reply } => {
                let _ = reply.send(controller.request_wifi_change(&info));
            }
            Command::Status(reply) => {
                let _ = reply.send(controller.status());
            }
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();

        self.commands
            .send(command(reply))
            .map_err(|_| Error::Internal("device manager task stopped".to_string()))?;

        response
            .await
            .map_err(|_| Error::Internal("device manager task stopped".to_string()))
    }

    /// Start a discovery scan.
    ///
    /// Results arrive as [`ProbeEvent::DevicesUpdated`] when the scan ends.
    pub async fn start_scan(&self) -> Result<ScanId> {
        self.request(Command::StartScan).await
    }

    /// Stop the running scan. Returns `false` if none was running.
    pub async fn stop_scan(&self) -> Result<bool> {
        self.request(Command::StopScan).await
    }

    /// Connect to the probe registered under `name`.
    pub async fn connect(&self, name: &str) -> Result<LinkId> {
        let name = name.to_string();
        self.request(|reply| Command::Connect { name, reply })
            .await?
    }

    /// Disconnect the connected probe.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await?
    }

    /// Power the probe on or off.
    pub async fn set_power(&self, on: bool) -> Result<RequestId> {
        self.request(|reply| Command::SetPower { on, reply }).await?
    }

    /// Ask the probe to join a different Wi-Fi network.
    pub async fn request_wifi_change(&self, info: &str) -> Result<RequestId> {
        let info = info.to_string();
        self.request(|reply| Command::RequestWifiChange { info, reply })
            .await?
    }

    /// Snapshot of the controller state.
    pub async fn status(&self) -> Result<ProbeStatus> {
        self.request(Command::Status).await
    }

    /// Subscribe to probe events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Register a callback for every probe event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ProbeEvent) + Send + Sync + 'static,
    {
        let id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let task = tokio::spawn(forward_events(id, self.events.subscribe(), callback));

        CallbackHandle { id, task }
    }

    /// Clean shutdown of scanning and the probe connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        // The task may already be gone
        let _ = self.request(Command::Shutdown).await;

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }

        Ok(())
    }
}
