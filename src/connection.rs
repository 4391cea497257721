use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ble::BleAdapter;
use crate::engine::Message;
use crate::error::SensorLinkError;
use crate::models::{ConnectionSession, ConnectionState};
use crate::stream::StreamSubscription;

pub(crate) enum ConnectProgress {
    DiscoveringServices,
    Finished(Result<(), SensorLinkError>),
}

pub(crate) type ConnectReply = oneshot::Sender<Result<ConnectionSession, SensorLinkError>>;

/// Whether `from -> to` is a legal step of the session state machine:
/// `Disconnected -> Connecting -> ServiceDiscovery -> Ready`, with `Failed`
/// reachable from the two in-progress states. Only the simulated radio may
/// jump from `Disconnected` straight to `Ready`.
pub fn is_valid_transition(from: ConnectionState, to: ConnectionState, simulated: bool) -> bool {
    use ConnectionState::*;
    match (from, to) {
        (Disconnected, Connecting) => true,
        (Disconnected, Ready) => simulated,
        (Connecting, ServiceDiscovery) => true,
        (ServiceDiscovery, Ready) => true,
        (Connecting | ServiceDiscovery, Failed) => true,
        (Connecting | ServiceDiscovery | Ready, Disconnected) => true,
        _ => false,
    }
}

/// The session record plus the resources bound to it.
pub(crate) struct ActiveSession {
    pub(crate) session: ConnectionSession,
    pub(crate) attempt: Option<JoinHandle<()>>,
    pub(crate) reply: Option<ConnectReply>,
    pub(crate) stream: Option<StreamSubscription>,
}

impl ActiveSession {
    pub(crate) fn new(session: ConnectionSession) -> Self {
        Self {
            session,
            attempt: None,
            reply: None,
            stream: None,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.session.session_id
    }

    /// Applies `to` if the state machine allows it.
    pub(crate) fn advance(&mut self, to: ConnectionState) -> bool {
        if !is_valid_transition(self.session.state, to, false) {
            warn!(
                session = self.session.session_id,
                from = ?self.session.state,
                to = ?to,
                "ignoring out-of-order connection transition"
            );
            return false;
        }
        self.session.state = to;
        true
    }

    /// Stops the attempt task and the subscription bound to this session.
    pub(crate) fn release_tasks(&mut self) {
        self.stream = None;
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.release_tasks();
    }
}

/// Opens the link and discovers services, reporting each step to the owner.
/// Any partially opened link is released before a failure is reported.
pub(crate) fn spawn_attempt(
    adapter: Arc<dyn BleAdapter>,
    device_id: String,
    session_id: u64,
    tx: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = establish(adapter.as_ref(), &device_id, session_id, &tx).await;
        if let Err(e) = &result {
            debug!(device = %device_id, error = %e, "connection attempt failed, releasing link");
            if let Err(e) = adapter.disconnect(&device_id).await {
                warn!(device = %device_id, error = %e, "failed to release link");
            }
        }
        let progress = ConnectProgress::Finished(result);
        let _ = tx.send(Message::Connect { session_id, progress }).await;
    })
}

async fn establish(
    adapter: &dyn BleAdapter,
    device_id: &str,
    session_id: u64,
    tx: &mpsc::Sender<Message>,
) -> Result<(), SensorLinkError> {
    adapter.connect(device_id).await?;
    let progress = ConnectProgress::DiscoveringServices;
    let _ = tx.send(Message::Connect { session_id, progress }).await;
    adapter.discover_services(device_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::{MockBleAdapter, MockCall};
    use crate::models::{ConnectionState::*, PeripheralHandle};

    #[test]
    fn test_state_machine_order() {
        assert!(is_valid_transition(Disconnected, Connecting, false));
        assert!(is_valid_transition(Connecting, ServiceDiscovery, false));
        assert!(is_valid_transition(ServiceDiscovery, Ready, false));
        assert!(is_valid_transition(ServiceDiscovery, Failed, false));
        assert!(is_valid_transition(Connecting, Failed, false));
        assert!(!is_valid_transition(Connecting, Ready, false));
        assert!(!is_valid_transition(Disconnected, Ready, false));
        assert!(is_valid_transition(Disconnected, Ready, true));
        assert!(!is_valid_transition(Failed, Disconnected, false));
        assert!(!is_valid_transition(Ready, Failed, false));
    }

    #[test]
    fn test_advance_rejects_skips() {
        let mut active = ActiveSession::new(ConnectionSession {
            session_id: 1,
            peripheral: PeripheralHandle {
                id: "a".to_string(),
                name: None,
                rssi: None,
                connectable: true,
            },
            state: Connecting,
            connect_attempt_unix_ms: 0,
            last_exchange_unix_ms: None,
        });
        assert!(!active.advance(Ready));
        assert_eq!(active.session.state, Connecting);
        assert!(active.advance(ServiceDiscovery));
        assert!(active.advance(Ready));
    }

    async fn run_attempt(adapter: Arc<MockBleAdapter>) -> Vec<Message> {
        let (tx, mut rx) = mpsc::channel(8);
        spawn_attempt(adapter, "dev".to_string(), 9, tx)
            .await
            .unwrap();
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn test_attempt_reports_steps_in_order() {
        let adapter = Arc::new(MockBleAdapter::new());
        let messages = run_attempt(adapter).await;
        assert_eq!(messages.len(), 2);
        assert!(matches!(
            messages[0],
            Message::Connect {
                session_id: 9,
                progress: ConnectProgress::DiscoveringServices
            }
        ));
        assert!(matches!(
            messages[1],
            Message::Connect {
                progress: ConnectProgress::Finished(Ok(())),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_discovery_failure_releases_link() {
        let adapter = Arc::new(MockBleAdapter::new().failing_discovery("gatt error"));
        let messages = run_attempt(adapter.clone()).await;
        assert!(matches!(
            messages.last(),
            Some(Message::Connect {
                progress: ConnectProgress::Finished(Err(_)),
                ..
            })
        ));
        assert_eq!(
            adapter.calls(),
            vec![
                MockCall::Connect("dev".to_string()),
                MockCall::DiscoverServices("dev".to_string()),
                MockCall::Disconnect("dev".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_failure_skips_discovery() {
        let adapter = Arc::new(MockBleAdapter::new().failing_connect("timeout"));
        let messages = run_attempt(adapter.clone()).await;
        assert_eq!(messages.len(), 1);
        assert!(!adapter
            .calls()
            .contains(&MockCall::DiscoverServices("dev".to_string())));
    }
}
