//! [`BleAdapter`] backed by the platform stack through `btleplug`.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::{Advertisement, BleAdapter, Notifications, ScanUpdate, ScanUpdates};
use crate::config::DEVICE_NAME_CHARACTERISTIC_UUID;
use crate::error::SensorLinkError;
use crate::models::AdapterState;

pub struct BtleplugAdapter {
    // Held so the platform session outlives the adapter handle.
    _manager: Manager,
    central: Adapter,
}

impl BtleplugAdapter {
    /// Binds to the first adapter the platform reports.
    pub async fn new() -> Result<Self, SensorLinkError> {
        let manager = Manager::new()
            .await
            .map_err(|e| SensorLinkError::Unsupported {
                reason: e.to_string(),
            })?;
        let central = manager
            .adapters()
            .await
            .map_err(|e| SensorLinkError::Unsupported {
                reason: e.to_string(),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| SensorLinkError::Unsupported {
                reason: "no bluetooth adapter found".to_string(),
            })?;
        info!("bound to system bluetooth adapter");
        Ok(Self {
            _manager: manager,
            central,
        })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, SensorLinkError> {
        self.central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device_id)
            .ok_or_else(|| SensorLinkError::Radio {
                reason: format!("unknown peripheral {device_id}"),
            })
    }
}

async fn advertisement_for(central: &Adapter, event: CentralEvent) -> Option<ScanUpdate> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
        _ => return None,
    };
    let peripheral = match central.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(device = %id, error = %e, "skipping advertisement, peripheral lookup failed");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(e) => {
            warn!(device = %id, error = %e, "skipping advertisement, properties unavailable");
            return None;
        }
    };
    // btleplug only surfaces peripherals it can open a connection to.
    Some(ScanUpdate::Advertisement(Advertisement {
        id: id.to_string(),
        name: properties.local_name,
        rssi: properties.rssi,
        connectable: true,
    }))
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Option<Characteristic> {
    peripheral.characteristics().into_iter().find(|c| c.uuid == uuid)
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn adapter_state(&self) -> Result<AdapterState, SensorLinkError> {
        let state = match self.central.adapter_state().await? {
            CentralState::PoweredOn => AdapterState::PoweredOn,
            CentralState::PoweredOff => AdapterState::PoweredOff,
            _ => AdapterState::Unknown,
        };
        Ok(state)
    }

    async fn start_scan(&self) -> Result<ScanUpdates, SensorLinkError> {
        let events = self.central.events().await?;
        self.central.start_scan(ScanFilter::default()).await?;
        let central = self.central.clone();
        let updates = events
            .filter_map(move |event| {
                let central = central.clone();
                async move { advertisement_for(&central, event).await }
            })
            .boxed();
        Ok(updates)
    }

    async fn stop_scan(&self) -> Result<(), SensorLinkError> {
        self.central.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<(), SensorLinkError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn discover_services(&self, device_id: &str) -> Result<(), SensorLinkError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.discover_services().await?;
        debug!(
            device = device_id,
            characteristics = peripheral.characteristics().len(),
            "services discovered"
        );
        Ok(())
    }

    async fn disconnect(&self, device_id: &str) -> Result<(), SensorLinkError> {
        let peripheral = self.peripheral(device_id).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn read_device_name(&self, device_id: &str) -> Result<Option<String>, SensorLinkError> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.connect().await?;
        let name = async {
            peripheral.discover_services().await?;
            let Some(characteristic) =
                find_characteristic(&peripheral, DEVICE_NAME_CHARACTERISTIC_UUID)
            else {
                return Ok(None);
            };
            let raw = peripheral.read(&characteristic).await?;
            let name = String::from_utf8_lossy(&raw)
                .trim_end_matches('\0')
                .trim()
                .to_string();
            Ok::<_, SensorLinkError>((!name.is_empty()).then_some(name))
        }
        .await;
        if let Err(e) = peripheral.disconnect().await {
            warn!(device = device_id, error = %e, "failed to release name lookup connection");
        }
        name
    }

    async fn subscribe(
        &self,
        device_id: &str,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<Notifications, SensorLinkError> {
        let peripheral = self.peripheral(device_id).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or_else(|| SensorLinkError::Radio {
                reason: format!("characteristic {characteristic} not found on {device_id}"),
            })?;
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&target).await?;
        let values = notifications
            .filter_map(move |notification| async move {
                (notification.uuid == characteristic).then_some(notification.value)
            })
            .boxed();
        Ok(values)
    }
}
