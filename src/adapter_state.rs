//! Radio construction and adapter power state.
//!
//! The backend is built at most once per [`RadioProvider`]. A construction
//! failure is remembered and turns the provider into the simulated radio for
//! the rest of its lifetime.

use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::ble::BleAdapter;
use crate::ble_btleplug::BtleplugAdapter;
use crate::error::SensorLinkError;
use crate::models::AdapterState;

pub type AdapterFactory = Box<
    dyn Fn() -> BoxFuture<'static, Result<Arc<dyn BleAdapter>, SensorLinkError>> + Send + Sync,
>;

#[derive(Clone)]
pub enum RadioMode {
    Hardware(Arc<dyn BleAdapter>),
    Simulated,
}

impl RadioMode {
    pub fn is_simulated(&self) -> bool {
        matches!(self, RadioMode::Simulated)
    }
}

pub struct RadioProvider {
    factory: AdapterFactory,
    mode: OnceCell<RadioMode>,
}

static SYSTEM_RADIO: OnceLock<Arc<RadioProvider>> = OnceLock::new();

impl RadioProvider {
    pub fn new(factory: AdapterFactory) -> Self {
        Self {
            factory,
            mode: OnceCell::new(),
        }
    }

    /// Provider around an already constructed backend.
    pub fn with_adapter(adapter: Arc<dyn BleAdapter>) -> Self {
        Self::new(Box::new(move || {
            let adapter = Arc::clone(&adapter);
            async move { Ok::<_, SensorLinkError>(adapter) }.boxed()
        }))
    }

    /// Provider whose backend can never be constructed.
    pub fn unavailable(reason: &str) -> Self {
        let reason = reason.to_string();
        Self::new(Box::new(move || {
            let reason = reason.clone();
            async move { Err::<Arc<dyn BleAdapter>, _>(SensorLinkError::Unsupported { reason }) }
                .boxed()
        }))
    }

    /// Process-wide provider backed by the platform bluetooth stack.
    pub fn system() -> Arc<RadioProvider> {
        Arc::clone(SYSTEM_RADIO.get_or_init(|| {
            Arc::new(RadioProvider::new(Box::new(|| {
                async {
                    let adapter = BtleplugAdapter::new().await?;
                    Ok::<_, SensorLinkError>(Arc::new(adapter) as Arc<dyn BleAdapter>)
                }
                .boxed()
            })))
        }))
    }

    /// Resolves the radio, constructing the backend on first use only.
    pub async fn mode(&self) -> RadioMode {
        self.mode
            .get_or_init(|| async {
                match (self.factory)().await {
                    Ok(adapter) => {
                        info!("bluetooth stack available");
                        RadioMode::Hardware(adapter)
                    }
                    Err(e) => {
                        warn!(error = %e, "bluetooth stack unavailable, using simulated radio");
                        RadioMode::Simulated
                    }
                }
            })
            .await
            .clone()
    }

    /// Current adapter state. Never cached; failures read as `Unknown`.
    pub async fn query_state(&self) -> AdapterState {
        match self.mode().await {
            RadioMode::Simulated => AdapterState::SimulatedOn,
            RadioMode::Hardware(adapter) => match adapter.adapter_state().await {
                Ok(state) => state,
                Err(e) => {
                    warn!(error = %e, "adapter state query failed");
                    AdapterState::Unknown
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::MockBleAdapter;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_construction_failure_is_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let provider = RadioProvider::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<Arc<dyn BleAdapter>, _>(SensorLinkError::Unsupported {
                    reason: "no adapter".to_string(),
                })
            }
            .boxed()
        }));
        assert_eq!(provider.query_state().await, AdapterState::SimulatedOn);
        assert_eq!(provider.query_state().await, AdapterState::SimulatedOn);
        assert!(provider.mode().await.is_simulated());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_state_reflects_adapter_at_call_time() {
        let adapter = Arc::new(MockBleAdapter::new().with_adapter_state(AdapterState::PoweredOff));
        let provider = RadioProvider::with_adapter(adapter.clone());
        assert_eq!(provider.query_state().await, AdapterState::PoweredOff);
        adapter.set_adapter_state(AdapterState::PoweredOn);
        assert_eq!(provider.query_state().await, AdapterState::PoweredOn);
    }

    #[tokio::test]
    async fn test_query_failure_reads_unknown() {
        let adapter = Arc::new(MockBleAdapter::new().failing_state_query());
        let provider = RadioProvider::with_adapter(adapter);
        assert_eq!(provider.query_state().await, AdapterState::Unknown);
    }
}
