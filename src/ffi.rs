//! Foreign-facing facade.
//!
//! Mobile hosts drive the core through [`SensorLink`], a blocking wrapper
//! around [`SensorLinkCore`] that owns its own tokio runtime and relays
//! events to a host listener.

use std::sync::{Arc, Once};

use tokio::runtime::{Builder, Runtime};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::adapter_state::RadioProvider;
use crate::config::CoreConfig;
use crate::engine::SensorLinkCore;
use crate::error::SensorLinkError;
use crate::events::SensorEvent;
use crate::models::{
    AdapterState, ConnectionSession, ConnectionState, PeripheralHandle, PermissionResult,
    ScanState, StreamSample,
};
use crate::permissions::PermissionPlatform;

/// Host callback receiving every [`SensorEvent`] in publication order.
pub trait SensorEventListener: Send + Sync {
    fn on_event(&self, event: SensorEvent);
}

static LOGGING: Once = Once::new();

/// Installs the process-wide tracing subscriber. Later calls are ignored.
pub fn init_logging(filter: String) {
    LOGGING.call_once(|| {
        let filter = EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    });
}

pub struct SensorLink {
    core: SensorLinkCore,
    runtime: Runtime,
}

impl SensorLink {
    pub fn new(
        listener: Box<dyn SensorEventListener>,
        platform: Box<dyn PermissionPlatform>,
    ) -> Result<Self, SensorLinkError> {
        Self::with_radio(
            CoreConfig::default(),
            RadioProvider::system(),
            Arc::from(listener),
            Arc::from(platform),
        )
    }

    pub(crate) fn with_radio(
        config: CoreConfig,
        radio: Arc<RadioProvider>,
        listener: Arc<dyn SensorEventListener>,
        platform: Arc<dyn PermissionPlatform>,
    ) -> Result<Self, SensorLinkError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("sensorlink")
            .enable_all()
            .build()
            .map_err(|e| SensorLinkError::Unsupported {
                reason: format!("failed to start runtime: {e}"),
            })?;
        let core = runtime.block_on(async { SensorLinkCore::start(config, radio, platform) });
        let mut events = core.subscribe();
        runtime.spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => listener.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "event listener fell behind");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        info!("sensor link created");
        Ok(Self { core, runtime })
    }

    pub fn ensure_permissions(&self) -> PermissionResult {
        self.runtime.block_on(self.core.ensure_permissions())
    }

    pub fn query_state(&self) -> AdapterState {
        self.runtime.block_on(self.core.query_state())
    }

    /// Starts a scan. Discovered devices arrive as `DeviceListUpdated` events.
    pub fn start_scan(&self) -> Result<(), SensorLinkError> {
        self.runtime.block_on(self.core.start_scan()).map(|_| ())
    }

    pub fn stop_scan(&self) {
        self.runtime.block_on(self.core.stop_scan())
    }

    pub fn connect(&self, handle: PeripheralHandle) -> Result<ConnectionSession, SensorLinkError> {
        self.runtime.block_on(self.core.connect(handle))
    }

    pub fn disconnect(&self, handle: PeripheralHandle) {
        self.runtime.block_on(self.core.disconnect(&handle))
    }

    pub fn begin_stream(&self, session: ConnectionSession) -> Result<(), SensorLinkError> {
        self.runtime.block_on(self.core.begin_stream(&session))
    }

    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.core.devices()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection_state()
    }

    pub fn connection_session(&self) -> Option<ConnectionSession> {
        self.core.connection_session()
    }

    pub fn last_sample(&self) -> Option<StreamSample> {
        self.core.last_sample()
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.core.adapter_state()
    }

    pub fn scan_state(&self) -> ScanState {
        self.core.scan_state()
    }
}

impl Drop for SensorLink {
    fn drop(&mut self) {
        self.runtime.block_on(self.core.shutdown());
    }
}
