use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::{Advertisement, BleAdapter, Notifications, ScanUpdate, ScanUpdates};
use crate::error::SensorLinkError;
use crate::models::AdapterState;

/// Calls observed by [`MockBleAdapter`], in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MockCall {
    StartScan,
    StopScan,
    Connect(String),
    DiscoverServices(String),
    Disconnect(String),
    ReadDeviceName(String),
    Subscribe(String),
}

#[derive(Debug, Default)]
struct MockState {
    adapter_state: Option<AdapterState>,
    script: Vec<ScanUpdate>,
    names: HashMap<String, String>,
    fail_state_query: bool,
    fail_start_scan: Option<String>,
    fail_connect: Option<String>,
    fail_discovery: Option<String>,
    fail_subscribe: Option<String>,
    hold_connect: bool,
    hold_name_lookup: bool,
    scan_tx: Option<mpsc::UnboundedSender<ScanUpdate>>,
    notification_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    calls: Vec<MockCall>,
}

/// Scriptable in-memory radio used to exercise the hardware code path.
#[derive(Debug, Default)]
pub struct MockBleAdapter {
    state: Mutex<MockState>,
}

impl MockBleAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sample_data() -> Self {
        Self::new()
            .with_advertisement(Advertisement {
                id: "mock-device-1".to_string(),
                name: Some("ColorSense C1".to_string()),
                rssi: Some(-61),
                connectable: true,
            })
            .with_advertisement(Advertisement {
                id: "beacon-1".to_string(),
                name: Some("Beacon".to_string()),
                rssi: Some(-80),
                connectable: false,
            })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_adapter_state(self, state: AdapterState) -> Self {
        self.lock().adapter_state = Some(state);
        self
    }

    pub fn with_advertisement(self, advertisement: Advertisement) -> Self {
        self.lock()
            .script
            .push(ScanUpdate::Advertisement(advertisement));
        self
    }

    pub fn with_scan_error(self, reason: &str) -> Self {
        self.lock().script.push(ScanUpdate::Error(reason.to_string()));
        self
    }

    pub fn with_device_name(self, device_id: &str, name: &str) -> Self {
        self.lock()
            .names
            .insert(device_id.to_string(), name.to_string());
        self
    }

    pub fn failing_state_query(self) -> Self {
        self.lock().fail_state_query = true;
        self
    }

    pub fn failing_start_scan(self, reason: &str) -> Self {
        self.lock().fail_start_scan = Some(reason.to_string());
        self
    }

    pub fn failing_connect(self, reason: &str) -> Self {
        self.lock().fail_connect = Some(reason.to_string());
        self
    }

    pub fn failing_discovery(self, reason: &str) -> Self {
        self.lock().fail_discovery = Some(reason.to_string());
        self
    }

    pub fn failing_subscribe(self, reason: &str) -> Self {
        self.lock().fail_subscribe = Some(reason.to_string());
        self
    }

    /// Makes `connect` never complete, as a radio stack waiting on its own timeout would.
    pub fn holding_connect(self) -> Self {
        self.lock().hold_connect = true;
        self
    }

    /// Makes `read_device_name` never complete.
    pub fn holding_name_lookup(self) -> Self {
        self.lock().hold_name_lookup = true;
        self
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        self.lock().adapter_state = Some(state);
    }

    /// Feeds an update into the running scan. Returns false when no scan is running.
    pub fn push_scan_update(&self, update: ScanUpdate) -> bool {
        match &self.lock().scan_tx {
            Some(tx) => tx.send(update).is_ok(),
            None => false,
        }
    }

    /// Delivers a notification on the active subscription.
    pub fn push_notification(&self, payload: Vec<u8>) -> bool {
        match &self.lock().notification_tx {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    /// Ends the notification stream as a dropped link would.
    pub fn drop_link(&self) {
        self.lock().notification_tx = None;
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }

    fn record(&self, call: MockCall) {
        self.lock().calls.push(call);
    }
}

fn channel_stream<T: Send + 'static>(
    rx: mpsc::UnboundedReceiver<T>,
) -> futures::stream::BoxStream<'static, T> {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

#[async_trait]
impl BleAdapter for MockBleAdapter {
    async fn adapter_state(&self) -> Result<AdapterState, SensorLinkError> {
        let state = self.lock();
        if state.fail_state_query {
            return Err(SensorLinkError::Radio {
                reason: "state query failed".to_string(),
            });
        }
        Ok(state.adapter_state.unwrap_or(AdapterState::PoweredOn))
    }

    async fn start_scan(&self) -> Result<ScanUpdates, SensorLinkError> {
        self.record(MockCall::StartScan);
        let mut state = self.lock();
        if let Some(reason) = &state.fail_start_scan {
            return Err(SensorLinkError::Radio {
                reason: reason.clone(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for update in &state.script {
            let _ = tx.send(update.clone());
        }
        state.scan_tx = Some(tx);
        Ok(channel_stream(rx))
    }

    async fn stop_scan(&self) -> Result<(), SensorLinkError> {
        self.record(MockCall::StopScan);
        self.lock().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), SensorLinkError> {
        self.record(MockCall::Connect(device_id.to_string()));
        let (hold, failure) = {
            let state = self.lock();
            (state.hold_connect, state.fail_connect.clone())
        };
        if hold {
            futures::future::pending::<()>().await;
        }
        match failure {
            Some(reason) => Err(SensorLinkError::Radio { reason }),
            None => Ok(()),
        }
    }

    async fn discover_services(&self, device_id: &str) -> Result<(), SensorLinkError> {
        self.record(MockCall::DiscoverServices(device_id.to_string()));
        match &self.lock().fail_discovery {
            Some(reason) => Err(SensorLinkError::Radio {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorLinkError> {
        self.record(MockCall::Disconnect(device_id.to_string()));
        self.lock().notification_tx = None;
        Ok(())
    }

    /// Opens and releases its own link, so a lookup against a connected
    /// device drops that device's notifications like a real stack would.
    async fn read_device_name(&self, device_id: &str) -> Result<Option<String>, SensorLinkError> {
        self.record(MockCall::ReadDeviceName(device_id.to_string()));
        let hold = self.lock().hold_name_lookup;
        if hold {
            futures::future::pending::<()>().await;
        }
        let name = self.lock().names.get(device_id).cloned();
        self.disconnect(device_id).await?;
        Ok(name)
    }

    async fn subscribe(
        &self,
        device_id: &str,
        _service: Uuid,
        _characteristic: Uuid,
    ) -> Result<Notifications, SensorLinkError> {
        self.record(MockCall::Subscribe(device_id.to_string()));
        let mut state = self.lock();
        if let Some(reason) = &state.fail_subscribe {
            return Err(SensorLinkError::Radio {
                reason: reason.clone(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.notification_tx = Some(tx);
        Ok(channel_stream(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_replays_script() {
        let adapter = MockBleAdapter::with_sample_data();
        let updates: Vec<ScanUpdate> = adapter.start_scan().await.unwrap().take(2).collect().await;
        assert_eq!(updates.len(), 2);
        assert!(matches!(&updates[0], ScanUpdate::Advertisement(ad) if ad.id == "mock-device-1"));
        assert!(adapter.push_scan_update(ScanUpdate::Error("late".to_string())));
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let adapter = MockBleAdapter::new().failing_connect("out of range");
        assert!(adapter.connect("dev").await.is_err());
        assert_eq!(adapter.calls(), vec![MockCall::Connect("dev".to_string())]);
    }

    #[tokio::test]
    async fn test_disconnect_closes_notifications() {
        let adapter = MockBleAdapter::new();
        let mut notifications = adapter
            .subscribe("dev", Uuid::nil(), Uuid::nil())
            .await
            .unwrap();
        assert!(adapter.push_notification(vec![0x01]));
        assert_eq!(notifications.next().await, Some(vec![0x01]));
        adapter.disconnect("dev").await.unwrap();
        assert_eq!(notifications.next().await, None);
    }
}
