use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::ble::Notifications;
use crate::engine::Message;
use crate::error::DecodeError;
use crate::models::StreamSample;
use crate::timer::Deadline;

/// Decodes one notification. Any single byte decodes; only malformed
/// payloads are rejected.
pub fn decode_payload(payload: &[u8]) -> Result<StreamSample, DecodeError> {
    match payload {
        [] => Err(DecodeError::EmptyPayload),
        [code] => Ok(StreamSample::from_code(*code)),
        _ => Err(DecodeError::OversizedPayload { len: payload.len() }),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamEnd {
    /// The radio closed the notification stream.
    LinkLost,
    /// The simulated stream reached its run-length bound.
    BoundReached,
}

/// A running subscription. Dropping it stops delivery.
pub(crate) struct StreamSubscription {
    pub(crate) id: u64,
    task: JoinHandle<()>,
    _bound: Option<Deadline>,
}

impl StreamSubscription {
    pub(crate) fn new(id: u64, task: JoinHandle<()>, bound: Option<Deadline>) -> Self {
        Self {
            id,
            task,
            _bound: bound,
        }
    }
}

impl Drop for StreamSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Forwards raw payloads to the owner and reports when the radio ends the stream.
pub(crate) fn spawn_forwarder(
    mut notifications: Notifications,
    session_id: u64,
    stream_id: u64,
    tx: mpsc::Sender<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(payload) = notifications.next().await {
            debug!(session = session_id, len = payload.len(), "notification");
            let message = Message::Notification {
                session_id,
                stream_id,
                payload,
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
        let end = StreamEnd::LinkLost;
        let _ = tx
            .send(Message::StreamClosed {
                session_id,
                stream_id,
                end,
            })
            .await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_codes() {
        assert_eq!(decode_payload(&[0x01]), Ok(StreamSample::Red));
        assert_eq!(decode_payload(&[0x02]), Ok(StreamSample::Green));
        assert_eq!(decode_payload(&[0x03]), Ok(StreamSample::Blue));
        assert_eq!(decode_payload(&[0x00]), Ok(StreamSample::Idle));
    }

    #[test]
    fn test_unknown_codes_decode_to_idle() {
        for code in [0x04, 0x10, 0x7f, 0xff] {
            assert_eq!(decode_payload(&[code]), Ok(StreamSample::Idle));
        }
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        assert_eq!(decode_payload(&[]), Err(DecodeError::EmptyPayload));
        assert_eq!(
            decode_payload(&[0x01, 0x02]),
            Err(DecodeError::OversizedPayload { len: 2 })
        );
    }

    #[tokio::test]
    async fn test_forwarder_reports_link_loss() {
        let (tx, mut rx) = mpsc::channel(8);
        let payloads = futures::stream::iter(vec![vec![0x01], vec![]]).boxed();
        spawn_forwarder(payloads, 1, 2, tx).await.unwrap();
        let mut forwarded = 0;
        let mut closed = None;
        while let Ok(message) = rx.try_recv() {
            match message {
                Message::Notification { stream_id: 2, .. } => forwarded += 1,
                Message::StreamClosed { end, .. } => closed = Some(end),
                _ => {}
            }
        }
        assert_eq!(forwarded, 2);
        assert_eq!(closed, Some(StreamEnd::LinkLost));
    }
}
