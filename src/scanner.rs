//! Time-bounded device discovery.
//!
//! A scan session is a background task reading advertisements plus a
//! [`Deadline`] bounding its duration. The task filters non-connectable
//! devices, deduplicates by identifier and resolves missing names before
//! reporting to the owner task.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ble::{Advertisement, BleAdapter, ScanUpdate, ScanUpdates};
use crate::engine::{send_or_cancelled, Message};
use crate::models::PeripheralHandle;
use crate::timer::Deadline;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ScanReport {
    Discovered(PeripheralHandle),
    /// The radio has nothing more to report.
    Completed,
    TimedOut,
    Failed(String),
}

/// Devices found by one scan session, in discovery order. Ends when the
/// session stops.
pub struct DeviceScan {
    rx: mpsc::UnboundedReceiver<PeripheralHandle>,
}

impl DeviceScan {
    pub async fn next_device(&mut self) -> Option<PeripheralHandle> {
        self.rx.recv().await
    }
}

impl Stream for DeviceScan {
    type Item = PeripheralHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(crate) struct ScanSession {
    pub(crate) generation: u64,
    devices: mpsc::UnboundedSender<PeripheralHandle>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    _deadline: Deadline,
}

impl ScanSession {
    pub(crate) fn new(
        generation: u64,
        cancel: CancellationToken,
        task: JoinHandle<()>,
        deadline: Deadline,
    ) -> (Self, DeviceScan) {
        let (devices, rx) = mpsc::unbounded_channel();
        let session = Self {
            generation,
            devices,
            cancel,
            task,
            _deadline: deadline,
        };
        (session, DeviceScan { rx })
    }

    pub(crate) fn forward(&self, device: PeripheralHandle) {
        // The caller may have dropped its DeviceScan; the device list still updates.
        let _ = self.devices.send(device);
    }

    /// Cancels the timer and waits for the discovery task to wind down, so no
    /// name-lookup connection outlives the session.
    pub(crate) async fn cancel(self) {
        let ScanSession {
            cancel,
            task,
            _deadline,
            ..
        } = self;
        drop(_deadline);
        cancel.cancel();
        if let Err(e) = task.await {
            if e.is_panic() {
                warn!("scan task panicked");
            }
        }
    }
}

pub(crate) fn handle_from(ad: Advertisement) -> PeripheralHandle {
    PeripheralHandle {
        name: ad.name.filter(|name| !name.trim().is_empty()),
        id: ad.id,
        rssi: ad.rssi,
        connectable: ad.connectable,
    }
}

async fn resolve_name(
    adapter: &dyn BleAdapter,
    device_id: &str,
    limit: Duration,
) -> Option<String> {
    match tokio::time::timeout(limit, adapter.read_device_name(device_id)).await {
        Ok(Ok(Some(name))) => {
            debug!(device = %device_id, name = %name, "resolved device name");
            Some(name)
        }
        Ok(Ok(None)) => {
            debug!(device = %device_id, "device exposes no name");
            None
        }
        Ok(Err(e)) => {
            warn!(device = %device_id, error = %e, "name lookup failed");
            None
        }
        Err(_) => {
            warn!(device = %device_id, "name lookup timed out");
            release_lookup(adapter, device_id).await;
            None
        }
    }
}

async fn release_lookup(adapter: &dyn BleAdapter, device_id: &str) {
    if let Err(e) = adapter.disconnect(device_id).await {
        warn!(device = %device_id, error = %e, "failed to release name lookup connection");
    }
}

/// Runs one hardware scan. `connected` is the peripheral of the live session,
/// if any; it is never opened for a name lookup.
pub(crate) fn spawn_hardware_scan(
    adapter: Arc<dyn BleAdapter>,
    mut updates: ScanUpdates,
    generation: u64,
    connected: Option<PeripheralHandle>,
    name_timeout: Duration,
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen = HashSet::new();
        loop {
            let update = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                update = updates.next() => update,
            };
            let report = match update {
                None => ScanReport::Failed("advertisement stream closed".to_string()),
                Some(ScanUpdate::Error(reason)) => ScanReport::Failed(reason),
                Some(ScanUpdate::Advertisement(ad)) => {
                    if !ad.connectable {
                        debug!(device = %ad.id, "ignoring non-connectable advertisement");
                        continue;
                    }
                    if !seen.insert(ad.id.clone()) {
                        continue;
                    }
                    let mut handle = handle_from(ad);
                    if handle.name.is_none() {
                        match connected.as_ref().filter(|c| c.id == handle.id) {
                            Some(session) => handle.name = session.name.clone(),
                            None => {
                                let lookup =
                                    resolve_name(adapter.as_ref(), &handle.id, name_timeout);
                                handle.name = tokio::select! {
                                    biased;
                                    _ = token.cancelled() => {
                                        release_lookup(adapter.as_ref(), &handle.id).await;
                                        return;
                                    }
                                    name = lookup => name,
                                };
                            }
                        }
                    }
                    ScanReport::Discovered(handle)
                }
            };
            let failed = matches!(report, ScanReport::Failed(_));
            let delivered =
                send_or_cancelled(&tx, &token, Message::Scan { generation, report }).await;
            if failed || !delivered {
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::{MockBleAdapter, MockCall};

    fn ad(id: &str, name: Option<&str>, connectable: bool) -> Advertisement {
        Advertisement {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
            connectable,
        }
    }

    async fn collect_reports(adapter: Arc<MockBleAdapter>) -> Vec<ScanReport> {
        let (tx, mut rx) = mpsc::channel(16);
        let updates = adapter.start_scan().await.unwrap();
        let token = CancellationToken::new();
        let task = spawn_hardware_scan(
            adapter.clone(),
            updates,
            1,
            None,
            Duration::from_secs(5),
            tx,
            token.clone(),
        );
        let mut reports = Vec::new();
        while let Some(Message::Scan { report, .. }) = rx.recv().await {
            let done = matches!(report, ScanReport::Failed(_));
            reports.push(report);
            if done {
                break;
            }
        }
        token.cancel();
        task.await.unwrap();
        reports
    }

    #[tokio::test]
    async fn test_dedup_and_connectable_filter() {
        let adapter = Arc::new(
            MockBleAdapter::new()
                .with_advertisement(ad("a", Some("Alpha"), true))
                .with_advertisement(ad("b", Some("Beacon"), false))
                .with_advertisement(ad("a", Some("Alpha"), true))
                .with_advertisement(ad("c", Some("Gamma"), true))
                .with_scan_error("radio reset"),
        );
        let reports = collect_reports(adapter).await;
        let ids: Vec<_> = reports
            .iter()
            .filter_map(|r| match r {
                ScanReport::Discovered(h) => Some(h.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(
            reports.last(),
            Some(&ScanReport::Failed("radio reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_nameless_device_resolved_through_secondary_connection() {
        let adapter = Arc::new(
            MockBleAdapter::new()
                .with_advertisement(ad("n", None, true))
                .with_advertisement(ad("m", Some(""), true))
                .with_device_name("n", "Colour Sensor")
                .with_scan_error("end"),
        );
        let reports = collect_reports(adapter.clone()).await;
        assert_eq!(
            reports[0],
            ScanReport::Discovered(PeripheralHandle {
                id: "n".to_string(),
                name: Some("Colour Sensor".to_string()),
                rssi: Some(-60),
                connectable: true,
            })
        );
        // Resolution failed: the nameless handle is still reported.
        assert!(matches!(&reports[1], ScanReport::Discovered(h) if h.id == "m" && h.name.is_none()));
        let calls = adapter.calls();
        assert!(calls.contains(&MockCall::ReadDeviceName("n".to_string())));
        assert!(calls.contains(&MockCall::ReadDeviceName("m".to_string())));
    }

    #[tokio::test]
    async fn test_named_device_skips_lookup() {
        let adapter = Arc::new(
            MockBleAdapter::new()
                .with_advertisement(ad("a", Some("Alpha"), true))
                .with_scan_error("end"),
        );
        collect_reports(adapter.clone()).await;
        assert!(!adapter
            .calls()
            .iter()
            .any(|c| matches!(c, MockCall::ReadDeviceName(_))));
    }

    #[tokio::test]
    async fn test_closed_stream_is_a_failure() {
        let adapter = Arc::new(MockBleAdapter::new());
        let (tx, mut rx) = mpsc::channel(4);
        let task = spawn_hardware_scan(
            adapter,
            futures::stream::empty().boxed(),
            3,
            None,
            Duration::from_secs(5),
            tx,
            CancellationToken::new(),
        );
        match rx.recv().await {
            Some(Message::Scan { generation, report }) => {
                assert_eq!(generation, 3);
                assert!(matches!(report, ScanReport::Failed(_)));
            }
            _ => panic!("expected a scan report"),
        }
        task.await.unwrap();
    }
}
