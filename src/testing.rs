//! Test doubles shared by the unit tests.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::adapter::{
    BleAdapter, CharacteristicHandle, DiscoveredDevice, LinkId, RequestId, ScanId, WriteKind,
};

/// A request recorded by [`RecordingAdapter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AdapterCall {
    StartScan(ScanId),
    StopScan(ScanId),
    Connect(LinkId, String),
    DiscoverServices(LinkId),
    ResolveDetails(LinkId, Uuid),
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Bytes, WriteKind, RequestId),
    Subscribe(CharacteristicHandle),
    Disconnect(LinkId),
}

/// Adapter that records every request and never completes anything.
///
/// Tests play the adapter's part by feeding `AdapterEvent`s by hand.
#[derive(Debug, Clone, Default)]
pub(crate) struct RecordingAdapter {
    calls: Arc<Mutex<Vec<AdapterCall>>>,
}

impl RecordingAdapter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// All requests so far.
    pub(crate) fn calls(&self) -> Vec<AdapterCall> {
        self.calls.lock().clone()
    }

    /// Drain the recorded requests.
    pub(crate) fn take(&self) -> Vec<AdapterCall> {
        std::mem::take(&mut *self.calls.lock())
    }

    /// Writes recorded so far.
    pub(crate) fn writes(&self) -> Vec<(CharacteristicHandle, Bytes, WriteKind, RequestId)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AdapterCall::Write(ch, value, kind, request) => {
                    Some((*ch, value.clone(), *kind, *request))
                }
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AdapterCall) {
        self.calls.lock().push(call);
    }
}

impl BleAdapter for RecordingAdapter {
    fn start_scan(&self, scan: ScanId, _timeout: Duration) {
        self.record(AdapterCall::StartScan(scan));
    }

    fn stop_scan(&self, scan: ScanId) {
        self.record(AdapterCall::StopScan(scan));
    }

    fn connect(&self, link: LinkId, device: &DiscoveredDevice) {
        self.record(AdapterCall::Connect(link, device.identifier.clone()));
    }

    fn discover_services(&self, link: LinkId) {
        self.record(AdapterCall::DiscoverServices(link));
    }

    fn resolve_details(&self, link: LinkId, service: Uuid) {
        self.record(AdapterCall::ResolveDetails(link, service));
    }

    fn read(&self, characteristic: CharacteristicHandle) {
        self.record(AdapterCall::Read(characteristic));
    }

    fn write(
        &self,
        characteristic: CharacteristicHandle,
        value: Bytes,
        kind: WriteKind,
        request: RequestId,
    ) {
        self.record(AdapterCall::Write(characteristic, value, kind, request));
    }

    fn subscribe(&self, characteristic: CharacteristicHandle) {
        self.record(AdapterCall::Subscribe(characteristic));
    }

    fn disconnect(&self, link: LinkId) {
        self.record(AdapterCall::Disconnect(link));
    }
}
