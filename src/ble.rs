use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::error::SensorLinkError;
use crate::models::AdapterState;

/// One advertisement as reported by the radio stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    pub id: String,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub connectable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScanUpdate {
    Advertisement(Advertisement),
    /// The radio reported an error; the scan cannot continue.
    Error(String),
}

pub type ScanUpdates = BoxStream<'static, ScanUpdate>;
pub type Notifications = BoxStream<'static, Vec<u8>>;

/// Seam between the core and a radio stack.
///
/// Peripherals are addressed by the opaque identifier the stack reported in
/// [`Advertisement::id`].
#[async_trait]
pub trait BleAdapter: Send + Sync {
    async fn adapter_state(&self) -> Result<AdapterState, SensorLinkError>;

    async fn start_scan(&self) -> Result<ScanUpdates, SensorLinkError>;
    async fn stop_scan(&self) -> Result<(), SensorLinkError>;

    async fn connect(&self, device_id: &str) -> Result<(), SensorLinkError>;
    async fn discover_services(&self, device_id: &str) -> Result<(), SensorLinkError>;
    async fn disconnect(&self, device_id: &str) -> Result<(), SensorLinkError>;

    /// Opens a short-lived connection, reads the GAP device name and
    /// disconnects again on every path.
    async fn read_device_name(&self, device_id: &str) -> Result<Option<String>, SensorLinkError>;

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Notifications, SensorLinkError>;
}
