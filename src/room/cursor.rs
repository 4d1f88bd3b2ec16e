use crate::api::ApiClient;
use crate::chat::MessageId;
use crate::entity::RoomId;
use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

pub const READ_THROTTLE: Duration = Duration::from_millis(1200);

/// Where read cursors are reported.
#[async_trait]
pub trait ReadReporter: Send + Sync + 'static {
    async fn report(&self, room_id: RoomId, message_id: MessageId);
}

#[async_trait]
impl ReadReporter for ApiClient {
    async fn report(&self, room_id: RoomId, message_id: MessageId) {
        if let Err(err) = self.mark_read(room_id, message_id).await {
            warn!("Failed to report read cursor {} for room {}: {}", message_id, room_id, err);
        }
    }
}

/// Throttled read-cursor reporting for one room.
///
/// The first advance in a burst is reported immediately; later ones are
/// coalesced and the newest is reported when the window closes. Ids at or
/// below the highest one seen are ignored.
pub struct ReadCursor {
    tx: mpsc::UnboundedSender<MessageId>,
    highest: AtomicI64,
    task: JoinHandle<()>,
}

impl ReadCursor {
    pub fn spawn<R: ReadReporter>(room_id: RoomId, reporter: Arc<R>, window: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(room_id, reporter, rx, window));
        Self {
            tx,
            highest: AtomicI64::new(MessageId::MIN),
            task,
        }
    }

    pub fn advance(&self, message_id: MessageId) {
        let previous = self.highest.fetch_max(message_id, Ordering::AcqRel);
        if message_id <= previous {
            return;
        }
        let _ = self.tx.send(message_id);
    }

    /// Latest id handed to the throttle, reported or not.
    pub fn position(&self) -> Option<MessageId> {
        match self.highest.load(Ordering::Acquire) {
            MessageId::MIN => None,
            id => Some(id),
        }
    }

    /// Stops reporting; a pending trailing report is dropped.
    pub fn cancel(&self) {
        self.task.abort();
    }
}

impl Drop for ReadCursor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run<R: ReadReporter>(
    room_id: RoomId,
    reporter: Arc<R>,
    mut rx: mpsc::UnboundedReceiver<MessageId>,
    window: Duration,
) {
    while let Some(first) = rx.recv().await {
        reporter.report(room_id, first).await;

        let mut deadline = Instant::now() + window;
        let mut pending = None;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => match pending.take() {
                    Some(id) => {
                        debug!("Trailing read report {} for room {}", id, room_id);
                        reporter.report(room_id, id).await;
                        deadline = Instant::now() + window;
                    }
                    None => break,
                },
                next = rx.recv() => match next {
                    Some(id) => pending = Some(id),
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Recorder {
        pub calls: Mutex<Vec<MessageId>>,
    }

    #[async_trait]
    impl ReadReporter for Recorder {
        async fn report(&self, _room_id: RoomId, message_id: MessageId) {
            self.calls.lock().unwrap().push(message_id);
        }
    }

    fn calls(recorder: &Recorder) -> Vec<MessageId> {
        recorder.calls.lock().unwrap().clone()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_reports_leading_and_trailing_only() {
        let recorder = Arc::new(Recorder::default());
        let cursor = ReadCursor::spawn(1, recorder.clone(), READ_THROTTLE);

        for id in 1..=20 {
            cursor.advance(id);
        }
        tokio::time::sleep(Duration::from_secs(5)).await;

        let reported = calls(&recorder);
        assert!(reported.len() <= 2);
        assert_eq!(reported, vec![1, 20]);
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_messages_each_lead() {
        let recorder = Arc::new(Recorder::default());
        let cursor = ReadCursor::spawn(1, recorder.clone(), READ_THROTTLE);

        cursor.advance(1);
        tokio::time::sleep(Duration::from_secs(3)).await;
        cursor.advance(2);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(calls(&recorder), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_ids_are_ignored() {
        let recorder = Arc::new(Recorder::default());
        let cursor = ReadCursor::spawn(1, recorder.clone(), READ_THROTTLE);

        cursor.advance(5);
        cursor.advance(3);
        cursor.advance(5);
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(calls(&recorder), vec![5]);
        assert_eq!(cursor.position(), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_pending_trailing_report() {
        let recorder = Arc::new(Recorder::default());
        let cursor = ReadCursor::spawn(1, recorder.clone(), READ_THROTTLE);

        cursor.advance(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        cursor.advance(2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        cursor.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(calls(&recorder), vec![1]);
    }
}
