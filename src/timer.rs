use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::engine::Message;

/// One-shot timer that posts `message` to the owner queue when it expires.
/// Dropping it cancels the timer.
pub(crate) struct Deadline {
    task: JoinHandle<()>,
}

impl Deadline {
    pub(crate) fn arm(after: Duration, tx: mpsc::Sender<Message>, message: Message) -> Self {
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message).await;
        });
        Self { task }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.task.abort();
    }
}
