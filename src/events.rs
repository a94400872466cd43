//! Outward notifications consumed by the user interface.
//!
//! Every notification is a [`ProbeEvent`] on a single broadcast channel.

use tokio::sync::broadcast;

use crate::ble::adapter::RequestId;
use crate::ble::connection::ConnectionState;
use crate::error::{FailureReason, Result};

/// Result of a write, reported after the adapter completes it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WriteOutcome {
    /// The adapter accepted the write.
    Written,
    /// The write failed, or the link went down first.
    Failed(FailureReason),
}

impl WriteOutcome {
    /// Convert into a `Result`, mapping the failure reason to an [`Error`].
    ///
    /// [`Error`]: crate::Error
    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Written => Ok(()),
            Self::Failed(reason) => Err(reason.into()),
        }
    }
}

/// Notifications emitted by the probe controller.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum ProbeEvent {
    /// A scan finished; names of the probes now in the registry, in scan order.
    DevicesUpdated {
        /// Probe names.
        names: Vec<String>,
    },
    /// Power service readiness changed.
    PowerReady {
        /// New readiness.
        ready: bool,
    },
    /// Wi-Fi service readiness changed.
    WifiReady {
        /// New readiness.
        ready: bool,
    },
    /// The probe published Wi-Fi information.
    WifiInfoChanged {
        /// Decoded text.
        info: String,
    },
    /// The connection changed state.
    ConnectionStatusChanged {
        /// New state.
        state: ConnectionState,
        /// Set when `state` is `Failed`.
        reason: Option<FailureReason>,
    },
    /// A write issued by the controller completed.
    WriteCompleted {
        /// Id returned when the write was issued.
        request: RequestId,
        /// What happened.
        outcome: WriteOutcome,
    },
}

/// Sender for probe events.
pub type EventSender = broadcast::Sender<ProbeEvent>;

/// Receiver for probe events.
pub type EventReceiver = broadcast::Receiver<ProbeEvent>;

/// Broadcasts events to every subscriber.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: ProbeEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_without_receivers() {
        let dispatcher = EventDispatcher::default();
        dispatcher.send(ProbeEvent::PowerReady { ready: true });
    }

    #[test]
    fn test_dispatch_to_subscriber() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.subscribe();

        dispatcher.send(ProbeEvent::WifiInfoChanged {
            info: "SSID=Home".to_string(),
        });

        assert_eq!(
            rx.try_recv().ok(),
            Some(ProbeEvent::WifiInfoChanged {
                info: "SSID=Home".to_string()
            })
        );
    }

    #[test]
    fn test_write_outcome_into_result() {
        assert!(WriteOutcome::Written.into_result().is_ok());

        let err = WriteOutcome::Failed(FailureReason::LinkLost)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, crate::Error::LinkLost));

        let err = WriteOutcome::Failed(FailureReason::Disconnected)
            .into_result()
            .unwrap_err();
        assert!(matches!(err, crate::Error::NotConnected));
    }
}
