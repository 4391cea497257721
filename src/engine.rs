//! The owner task.
//!
//! All core state is mutated on a single task draining one bounded queue.
//! API calls and radio callbacks both arrive there as [`Message`]s. Callbacks
//! carry the scan generation or session id they belong to and are dropped
//! once that scan or session has been superseded.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter_state::{RadioMode, RadioProvider};
use crate::config::{CoreConfig, DATA_CHARACTERISTIC_UUID, DATA_SERVICE_UUID};
use crate::connection::{self, ActiveSession, ConnectProgress, ConnectReply};
use crate::error::SensorLinkError;
use crate::events::SensorEvent;
use crate::models::{
    AdapterState, ConnectionSession, ConnectionState, DenialReason, PeripheralHandle,
    PermissionResult, ScanState, StreamSample,
};
use crate::permissions::{PermissionNegotiator, PermissionPlatform};
use crate::scanner::{self, DeviceScan, ScanReport, ScanSession};
use crate::simulation;
use crate::stream::{self, StreamEnd, StreamSubscription};
use crate::timer::Deadline;

pub(crate) enum Command {
    QueryState {
        reply: oneshot::Sender<AdapterState>,
    },
    StartScan {
        reply: oneshot::Sender<Result<DeviceScan, SensorLinkError>>,
    },
    StopScan {
        reply: oneshot::Sender<()>,
    },
    Connect {
        handle: PeripheralHandle,
        reply: ConnectReply,
    },
    Disconnect {
        handle: PeripheralHandle,
        reply: oneshot::Sender<()>,
    },
    BeginStream {
        session: ConnectionSession,
        reply: oneshot::Sender<Result<(), SensorLinkError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) enum Message {
    Command(Command),
    Scan {
        generation: u64,
        report: ScanReport,
    },
    Connect {
        session_id: u64,
        progress: ConnectProgress,
    },
    Notification {
        session_id: u64,
        stream_id: u64,
        payload: Vec<u8>,
    },
    StreamClosed {
        session_id: u64,
        stream_id: u64,
        end: StreamEnd,
    },
}

/// Sends `message` unless `token` is cancelled first. Returns whether it was sent.
pub(crate) async fn send_or_cancelled(
    tx: &mpsc::Sender<Message>,
    token: &CancellationToken,
    message: Message,
) -> bool {
    tokio::select! {
        biased;
        _ = token.cancelled() => false,
        sent = tx.send(message) => sent.is_ok(),
    }
}

fn unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Point-in-time view of the core's state, read by the accessors.
#[derive(Clone, Debug, PartialEq)]
pub struct CoreSnapshot {
    pub devices: Vec<PeripheralHandle>,
    pub scan_state: ScanState,
    pub session: Option<ConnectionSession>,
    pub last_sample: Option<StreamSample>,
    pub adapter_state: AdapterState,
}

impl CoreSnapshot {
    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map_or(ConnectionState::Disconnected, |s| s.state)
    }
}

impl Default for CoreSnapshot {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
            scan_state: ScanState::Idle,
            session: None,
            last_sample: None,
            adapter_state: AdapterState::Unknown,
        }
    }
}

/// Handle to the connectivity core. Dropping it shuts the owner task down.
pub struct SensorLinkCore {
    commands: mpsc::Sender<Message>,
    events: broadcast::Sender<SensorEvent>,
    snapshot: watch::Receiver<CoreSnapshot>,
    permissions: PermissionNegotiator,
    stop: CancellationToken,
}

impl SensorLinkCore {
    /// Spawns the owner task on the current tokio runtime.
    pub fn start(
        config: CoreConfig,
        radio: Arc<RadioProvider>,
        platform: Arc<dyn PermissionPlatform>,
    ) -> Self {
        let (commands, inbox) = mpsc::channel(config.command_capacity);
        let (events, _) = broadcast::channel(config.event_capacity);
        let (snapshot_tx, snapshot) = watch::channel(CoreSnapshot::default());
        let permissions = PermissionNegotiator::new(platform, config.permission_api_threshold);
        let stop = CancellationToken::new();
        let owner = Owner {
            config,
            radio,
            tx: commands.clone(),
            events: events.clone(),
            snapshot: snapshot_tx,
            devices: Vec::new(),
            scan: None,
            session: None,
            last_sample: None,
            adapter_state: AdapterState::Unknown,
            next_id: 0,
        };
        tokio::spawn(owner.run(inbox, stop.clone()));
        Self {
            commands,
            events,
            snapshot,
            permissions,
            stop,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SensorEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SensorLinkError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Message::Command(command(reply)))
            .await
            .map_err(|_| SensorLinkError::CoreStopped)?;
        response.await.map_err(|_| SensorLinkError::CoreStopped)
    }

    /// Negotiates the platform grants. Denial is reported, never raised.
    pub async fn ensure_permissions(&self) -> PermissionResult {
        let result = self.permissions.ensure_permissions().await;
        if let Some(reason) = result.reason.filter(|_| !result.granted) {
            let _ = self.events.send(SensorEvent::PermissionDenied { reason });
        }
        result
    }

    pub async fn query_state(&self) -> AdapterState {
        self.request(|reply| Command::QueryState { reply })
            .await
            .unwrap_or(AdapterState::Unknown)
    }

    /// Starts a new scan session, superseding any running one.
    pub async fn start_scan(&self) -> Result<DeviceScan, SensorLinkError> {
        let permission = self.ensure_permissions().await;
        if !permission.granted {
            let reason = permission.reason.unwrap_or(DenialReason::Denied);
            return Err(SensorLinkError::PermissionDenied { reason });
        }
        self.request(|reply| Command::StartScan { reply }).await?
    }

    /// Stops the running scan. Safe from any state.
    pub async fn stop_scan(&self) {
        let _ = self.request(|reply| Command::StopScan { reply }).await;
    }

    /// Connects to `handle`, tearing down any existing session first.
    pub async fn connect(
        &self,
        handle: PeripheralHandle,
    ) -> Result<ConnectionSession, SensorLinkError> {
        self.request(|reply| Command::Connect { handle, reply })
            .await?
    }

    /// Disconnects `handle`. A no-op unless it is connecting or ready.
    pub async fn disconnect(&self, handle: &PeripheralHandle) {
        let handle = handle.clone();
        let _ = self
            .request(|reply| Command::Disconnect { handle, reply })
            .await;
    }

    /// Subscribes to the colour-code characteristic of a ready session.
    pub async fn begin_stream(&self, session: &ConnectionSession) -> Result<(), SensorLinkError> {
        let session = session.clone();
        self.request(|reply| Command::BeginStream { session, reply })
            .await?
    }

    /// Stops the scan, releases the session and waits for the owner task to exit.
    pub async fn shutdown(&self) {
        let _ = self
            .request(|reply| Command::Shutdown { reply })
            .await;
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn devices(&self) -> Vec<PeripheralHandle> {
        self.snapshot.borrow().devices.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot.borrow().connection_state()
    }

    pub fn connection_session(&self) -> Option<ConnectionSession> {
        self.snapshot.borrow().session.clone()
    }

    pub fn last_sample(&self) -> Option<StreamSample> {
        self.snapshot.borrow().last_sample
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.snapshot.borrow().adapter_state
    }

    pub fn scan_state(&self) -> ScanState {
        self.snapshot.borrow().scan_state
    }
}

impl Drop for SensorLinkCore {
    fn drop(&mut self) {
        // Not queued: the inbox may be full.
        self.stop.cancel();
    }
}

struct Owner {
    config: CoreConfig,
    radio: Arc<RadioProvider>,
    tx: mpsc::Sender<Message>,
    events: broadcast::Sender<SensorEvent>,
    snapshot: watch::Sender<CoreSnapshot>,
    devices: Vec<PeripheralHandle>,
    scan: Option<ScanSession>,
    session: Option<ActiveSession>,
    last_sample: Option<StreamSample>,
    adapter_state: AdapterState,
    next_id: u64,
}

impl Owner {
    async fn run(mut self, mut inbox: mpsc::Receiver<Message>, stop: CancellationToken) {
        info!("sensor link core started");
        let mut on_stopped = None;
        loop {
            let message = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                message = inbox.recv() => message,
            };
            let Some(message) = message else { break };
            match message {
                Message::Command(Command::Shutdown { reply }) => {
                    on_stopped = Some(reply);
                    break;
                }
                Message::Command(command) => self.handle_command(command).await,
                Message::Scan { generation, report } => {
                    self.on_scan_report(generation, report).await
                }
                Message::Connect {
                    session_id,
                    progress,
                } => self.on_connect_progress(session_id, progress),
                Message::Notification {
                    session_id,
                    stream_id,
                    payload,
                } => self.on_notification(session_id, stream_id, &payload),
                Message::StreamClosed {
                    session_id,
                    stream_id,
                    end,
                } => self.on_stream_closed(session_id, stream_id, end).await,
            }
            self.publish();
        }
        self.stop_scan().await;
        self.teardown_session().await;
        self.publish();
        info!("sensor link core stopped");
        if let Some(reply) = on_stopped {
            let _ = reply.send(());
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::QueryState { reply } => {
                let state = self.refresh_adapter_state().await;
                let _ = reply.send(state);
            }
            Command::StartScan { reply } => {
                let result = self.start_scan().await;
                self.publish();
                let _ = reply.send(result);
            }
            Command::StopScan { reply } => {
                self.stop_scan().await;
                let _ = reply.send(());
            }
            Command::Connect { handle, reply } => self.connect(handle, reply).await,
            Command::Disconnect { handle, reply } => {
                self.disconnect(&handle).await;
                let _ = reply.send(());
            }
            Command::BeginStream { session, reply } => {
                let result = self.begin_stream(&session).await;
                let _ = reply.send(result);
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn publish(&self) {
        let snapshot = CoreSnapshot {
            devices: self.devices.clone(),
            scan_state: if self.scan.is_some() {
                ScanState::Scanning
            } else {
                ScanState::Idle
            },
            session: self.session.as_ref().map(|active| active.session.clone()),
            last_sample: self.last_sample,
            adapter_state: self.adapter_state,
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    /// Publishes the current state, then the event, so readers never see an
    /// event ahead of the state it describes.
    fn emit(&self, event: SensorEvent) {
        self.publish();
        let _ = self.events.send(event);
    }

    fn emit_connection(&self, session: &ConnectionSession, failure: Option<String>) {
        info!(
            session = session.session_id,
            device = %session.peripheral.id,
            state = ?session.state,
            "connection state changed"
        );
        self.emit(SensorEvent::ConnectionStateChanged {
            device: session.peripheral.clone(),
            state: session.state,
            failure,
        });
    }

    async fn refresh_adapter_state(&mut self) -> AdapterState {
        let state = self.radio.query_state().await;
        if state != self.adapter_state {
            self.adapter_state = state;
            self.emit(SensorEvent::AdapterStateChanged { state });
        }
        state
    }

    async fn start_scan(&mut self) -> Result<DeviceScan, SensorLinkError> {
        let state = self.refresh_adapter_state().await;
        if !state.is_ready() {
            warn!(state = ?state, "radio not ready, scan refused");
            self.emit(SensorEvent::RadioNotReady { state });
            return Err(SensorLinkError::RadioNotReady { state });
        }
        self.stop_scan().await;

        let generation = self.next_id();
        self.devices.clear();
        self.emit(SensorEvent::DeviceListUpdated {
            devices: Vec::new(),
        });

        let token = CancellationToken::new();
        let task = match self.radio.mode().await {
            RadioMode::Simulated => simulation::spawn_scan(
                generation,
                simulation::mock_handle(&self.config),
                self.config.simulated_scan_delay,
                self.tx.clone(),
                token.clone(),
            ),
            RadioMode::Hardware(adapter) => {
                let updates = match adapter.start_scan().await {
                    Ok(updates) => updates,
                    Err(e) => {
                        let reason = e.to_string();
                        warn!(error = %reason, "scan could not start");
                        self.emit(SensorEvent::ScanFailed {
                            reason: reason.clone(),
                        });
                        return Err(SensorLinkError::ScanFailed { reason });
                    }
                };
                let connected = self
                    .session
                    .as_ref()
                    .filter(|active| active.session.state.is_live())
                    .map(|active| active.session.peripheral.clone());
                scanner::spawn_hardware_scan(
                    adapter,
                    updates,
                    generation,
                    connected,
                    self.config.name_resolution_timeout,
                    self.tx.clone(),
                    token.clone(),
                )
            }
        };
        let deadline = Deadline::arm(
            self.config.scan_duration,
            self.tx.clone(),
            Message::Scan {
                generation,
                report: ScanReport::TimedOut,
            },
        );
        let (session, devices) = ScanSession::new(generation, token, task, deadline);
        self.scan = Some(session);
        info!(generation, "scan started");
        self.emit(SensorEvent::ScanStateChanged {
            state: ScanState::Scanning,
        });
        Ok(devices)
    }

    async fn stop_scan(&mut self) {
        let Some(scan) = self.scan.take() else {
            return;
        };
        let generation = scan.generation;
        scan.cancel().await;
        if let RadioMode::Hardware(adapter) = self.radio.mode().await {
            if let Err(e) = adapter.stop_scan().await {
                warn!(error = %e, "radio refused to stop scanning");
            }
        }
        info!(generation, devices = self.devices.len(), "scan stopped");
        self.emit(SensorEvent::ScanStateChanged {
            state: ScanState::Idle,
        });
    }

    async fn on_scan_report(&mut self, generation: u64, report: ScanReport) {
        let Some(scan) = self.scan.as_ref().filter(|s| s.generation == generation) else {
            debug!(generation, "dropping report from superseded scan");
            return;
        };
        match report {
            ScanReport::Discovered(device) => {
                if !device.connectable || self.devices.iter().any(|d| d.id == device.id) {
                    return;
                }
                info!(device = %device.id, name = ?device.name, "device discovered");
                scan.forward(device.clone());
                self.devices.push(device);
                self.emit(SensorEvent::DeviceListUpdated {
                    devices: self.devices.clone(),
                });
            }
            ScanReport::Completed | ScanReport::TimedOut => self.stop_scan().await,
            ScanReport::Failed(reason) => {
                warn!(generation, error = %reason, "scan failed");
                self.stop_scan().await;
                self.emit(SensorEvent::ScanFailed { reason });
            }
        }
    }

    async fn connect(&mut self, handle: PeripheralHandle, reply: ConnectReply) {
        self.stop_scan().await;
        self.teardown_session().await;

        let session_id = self.next_id();
        let now = unix_ms();
        match self.radio.mode().await {
            RadioMode::Simulated => {
                let session = ConnectionSession {
                    session_id,
                    peripheral: handle,
                    state: ConnectionState::Ready,
                    connect_attempt_unix_ms: now,
                    last_exchange_unix_ms: Some(now),
                };
                self.session = Some(ActiveSession::new(session.clone()));
                self.emit_connection(&session, None);
                let _ = reply.send(Ok(session));
            }
            RadioMode::Hardware(adapter) => {
                let session = ConnectionSession {
                    session_id,
                    peripheral: handle.clone(),
                    state: ConnectionState::Connecting,
                    connect_attempt_unix_ms: now,
                    last_exchange_unix_ms: None,
                };
                let mut active = ActiveSession::new(session.clone());
                active.attempt = Some(connection::spawn_attempt(
                    adapter,
                    handle.id,
                    session_id,
                    self.tx.clone(),
                ));
                active.reply = Some(reply);
                self.session = Some(active);
                self.emit_connection(&session, None);
            }
        }
    }

    fn on_connect_progress(&mut self, session_id: u64, progress: ConnectProgress) {
        let Some(active) = self.session.as_mut().filter(|a| a.id() == session_id) else {
            debug!(session = session_id, "dropping progress of superseded attempt");
            return;
        };
        match progress {
            ConnectProgress::DiscoveringServices => {
                if active.advance(ConnectionState::ServiceDiscovery) {
                    let session = active.session.clone();
                    self.emit_connection(&session, None);
                }
            }
            ConnectProgress::Finished(Ok(())) => {
                active.attempt = None;
                if !active.advance(ConnectionState::Ready) {
                    return;
                }
                active.session.last_exchange_unix_ms = Some(unix_ms());
                let session = active.session.clone();
                let reply = active.reply.take();
                self.emit_connection(&session, None);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(session));
                }
            }
            ConnectProgress::Finished(Err(e)) => {
                active.attempt = None;
                if !active.advance(ConnectionState::Failed) {
                    return;
                }
                let session = active.session.clone();
                let reply = active.reply.take();
                let error = SensorLinkError::ConnectionFailed {
                    device: session.peripheral.label().to_string(),
                    reason: e.to_string(),
                };
                warn!(session = session_id, error = %error, "connection failed");
                self.emit_connection(&session, Some(error.to_string()));
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error));
                }
            }
        }
    }

    /// Releases the current session, if any. Live links are closed on the
    /// radio before the `Disconnected` transition is published.
    async fn teardown_session(&mut self) {
        let Some(mut active) = self.session.take() else {
            return;
        };
        active.release_tasks();
        if !active.session.state.is_live() {
            return;
        }
        if let RadioMode::Hardware(adapter) = self.radio.mode().await {
            if let Err(e) = adapter.disconnect(&active.session.peripheral.id).await {
                warn!(device = %active.session.peripheral.id, error = %e, "disconnect failed");
            }
        }
        active.session.state = ConnectionState::Disconnected;
        if let Some(reply) = active.reply.take() {
            let _ = reply.send(Err(SensorLinkError::ConnectionCancelled {
                device: active.session.peripheral.label().to_string(),
            }));
        }
        self.emit_connection(&active.session, None);
    }

    async fn disconnect(&mut self, handle: &PeripheralHandle) {
        let live = self
            .session
            .as_ref()
            .is_some_and(|a| a.session.peripheral.id == handle.id && a.session.state.is_live());
        if !live {
            debug!(device = %handle.id, "disconnect ignored, no live session");
            return;
        }
        self.teardown_session().await;
    }

    async fn begin_stream(&mut self, session: &ConnectionSession) -> Result<(), SensorLinkError> {
        let ready = self.session.as_ref().is_some_and(|a| {
            a.id() == session.session_id && a.session.state == ConnectionState::Ready
        });
        if !ready {
            return Err(SensorLinkError::SessionNotReady);
        }
        let stream_id = self.next_id();
        let session_id = session.session_id;
        let subscription = match self.radio.mode().await {
            RadioMode::Simulated => {
                let task = simulation::spawn_stream(
                    session_id,
                    stream_id,
                    self.config.simulated_stream_interval,
                    self.config.simulated_stream_bound,
                    self.tx.clone(),
                );
                let bound = Deadline::arm(
                    self.config.simulated_stream_bound,
                    self.tx.clone(),
                    Message::StreamClosed {
                        session_id,
                        stream_id,
                        end: StreamEnd::BoundReached,
                    },
                );
                StreamSubscription::new(stream_id, task, Some(bound))
            }
            RadioMode::Hardware(adapter) => {
                let notifications = adapter
                    .subscribe(
                        &session.peripheral.id,
                        DATA_SERVICE_UUID,
                        DATA_CHARACTERISTIC_UUID,
                    )
                    .await?;
                let task =
                    stream::spawn_forwarder(notifications, session_id, stream_id, self.tx.clone());
                StreamSubscription::new(stream_id, task, None)
            }
        };
        if let Some(active) = self.session.as_mut().filter(|a| a.id() == session_id) {
            active.stream = Some(subscription);
            info!(session = session_id, stream = stream_id, "stream started");
        }
        Ok(())
    }

    fn current_stream(&mut self, session_id: u64, stream_id: u64) -> Option<&mut ActiveSession> {
        self.session.as_mut().filter(|a| {
            a.id() == session_id
                && a.session.state == ConnectionState::Ready
                && a.stream.as_ref().is_some_and(|s| s.id == stream_id)
        })
    }

    fn on_notification(&mut self, session_id: u64, stream_id: u64, payload: &[u8]) {
        let Some(active) = self.current_stream(session_id, stream_id) else {
            debug!(session = session_id, "dropping notification for inactive stream");
            return;
        };
        match stream::decode_payload(payload) {
            Ok(sample) => {
                active.session.last_exchange_unix_ms = Some(unix_ms());
                self.last_sample = Some(sample);
                debug!(session = session_id, sample = ?sample, "sample decoded");
                self.emit(SensorEvent::StreamSampleUpdated { sample });
            }
            Err(e) => warn!(session = session_id, error = %e, "skipping undecodable notification"),
        }
    }

    async fn on_stream_closed(&mut self, session_id: u64, stream_id: u64, end: StreamEnd) {
        let Some(active) = self.current_stream(session_id, stream_id) else {
            return;
        };
        active.stream = None;
        let device = active.session.peripheral.clone();
        match end {
            StreamEnd::BoundReached => {
                info!(session = session_id, "simulated stream reached its bound");
                self.emit(SensorEvent::StreamEnded { device });
            }
            StreamEnd::LinkLost => {
                warn!(session = session_id, device = %device.id, "link lost");
                self.emit(SensorEvent::StreamEnded { device });
                self.teardown_session().await;
            }
        }
    }
}
