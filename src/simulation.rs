//! Simulated radio used when no bluetooth stack could be constructed.
//!
//! It posts the same owner messages as the hardware tasks, driven by timers
//! instead of radio events.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CoreConfig;
use crate::engine::{send_or_cancelled, Message};
use crate::models::{PeripheralHandle, StreamSample};
use crate::scanner::ScanReport;

pub(crate) fn mock_handle(config: &CoreConfig) -> PeripheralHandle {
    PeripheralHandle {
        id: config.mock_device_id.clone(),
        name: Some(config.mock_device_name.clone()),
        rssi: Some(-50),
        connectable: true,
    }
}

/// Reports `device` after `delay`, then completes the scan.
pub(crate) fn spawn_scan(
    generation: u64,
    device: PeripheralHandle,
    delay: Duration,
    tx: mpsc::Sender<Message>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        debug!(generation, device = %device.id, "simulated device discovered");
        for report in [ScanReport::Discovered(device), ScanReport::Completed] {
            if !send_or_cancelled(&tx, &token, Message::Scan { generation, report }).await {
                return;
            }
        }
    })
}

/// Number of samples a simulated stream emits before its bound.
pub(crate) fn sample_budget(interval: Duration, bound: Duration) -> usize {
    if interval.is_zero() {
        return 0;
    }
    (bound.as_nanos() / interval.as_nanos()) as usize
}

/// Cycles Red, Green, Blue, Idle every `interval`, starting immediately,
/// and stops on its own once `bound` worth of samples has been sent.
pub(crate) fn spawn_stream(
    session_id: u64,
    stream_id: u64,
    interval: Duration,
    bound: Duration,
    tx: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    let budget = sample_budget(interval, bound);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        for sample in StreamSample::CYCLE.iter().cycle().take(budget) {
            ticker.tick().await;
            let message = Message::Notification {
                session_id,
                stream_id,
                payload: vec![sample.code()],
            };
            if tx.send(message).await.is_err() {
                break;
            }
        }
    })
}
