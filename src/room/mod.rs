//! A mounted chat room: message log, roster, round state and read cursor.

pub mod cursor;
pub mod lifecycle;

pub use cursor::{ReadCursor, ReadReporter, READ_THROTTLE};
pub use lifecycle::{SessionControls, SessionError, SessionLifecycle, SessionState, StartOutcome};

use crate::api::session::StartSessionRequest;
use crate::api::{ApiClient, ApiError};
use crate::bus::{Event, EventBus};
use crate::chat::{ChatMessage, MessageLog, OutgoingMessage};
use crate::entity::{Participant, PaymentStatus, RoomId, RoomRole};
use crate::realtime::{room_destination, room_topic, RealtimeError, RealtimeHandle, Subscription};
use crate::settlement::AttendanceSheet;
use crate::store::Store;
use futures::Stream;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Messages fetched per history page.
pub const PAGE_SIZE: u32 = 30;
const CACHE_LIMIT: i64 = 200;

pub struct ChatRoom {
    room_id: RoomId,
    api: ApiClient,
    realtime: RealtimeHandle,
    store: Option<Store>,
    event_bus: Arc<EventBus>,
    log: Arc<Mutex<MessageLog>>,
    participants: Arc<Mutex<Vec<Participant>>>,
    cursor: Arc<ReadCursor>,
    lifecycle: SessionLifecycle,
    pump: JoinHandle<()>,
}

impl ChatRoom {
    /// Mounts a room. The live subscription is taken before any history is
    /// loaded so nothing sent in between is missed; the log dedups the
    /// overlap.
    pub async fn open(
        room_id: RoomId,
        role: RoomRole,
        api: ApiClient,
        realtime: RealtimeHandle,
        store: Option<Store>,
        event_bus: Arc<EventBus>,
    ) -> anyhow::Result<Self> {
        let subscription = realtime.subscribe(&room_topic(room_id)).await?;

        let log = Arc::new(Mutex::new(MessageLog::new()));
        let cursor = Arc::new(ReadCursor::spawn(room_id, Arc::new(api.clone()), READ_THROTTLE));
        let pump = task::spawn(pump(
            room_id,
            subscription,
            log.clone(),
            cursor.clone(),
            store.clone(),
            event_bus.clone(),
        ));

        let room = Self {
            room_id,
            lifecycle: SessionLifecycle::new(room_id, role, api.clone()),
            api,
            realtime,
            store,
            event_bus,
            log,
            participants: Arc::new(Mutex::new(Vec::new())),
            cursor,
            pump,
        };

        room.load_cached().await;
        if let Err(err) = room.load_latest().await {
            warn!("Failed to load history for room {}: {}", room_id, err);
        }
        if let Some(latest) = room.lock_log().latest().map(|m| m.id) {
            room.cursor.advance(latest);
        }
        if let Err(err) = room.refresh_participants().await {
            warn!("Failed to load participants for room {}: {}", room_id, err);
        }
        room.refresh_session().await;

        info!("Opened room {} with {} messages", room_id, room.lock_log().len());
        Ok(room)
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn role(&self) -> RoomRole {
        self.lifecycle.role()
    }

    /// Snapshot of the log, newest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.lock_log().newest_first().cloned().collect()
    }

    /// Messages accepted into the log from now on.
    pub fn live_messages(&self) -> impl Stream<Item = ChatMessage> {
        let mut rx = self.event_bus.subscribe();
        let room_id = self.room_id;
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(Event::ChatMessage { room_id: from, message }) if from == room_id => yield message,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Live view of room {} skipped {} events", room_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Publishes a chat line. An `Err` means the input should be kept.
    pub async fn send(&self, text: &str) -> Result<(), RealtimeError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let payload = OutgoingMessage {
            room_id: self.room_id,
            content: text,
        };
        let body = serde_json::to_string(&payload)?;
        self.realtime.publish(&room_destination(self.room_id), body).await
    }

    /// Fetches the page before the oldest loaded message. Returns how many
    /// messages were new.
    pub async fn load_older(&self) -> Result<usize, ApiError> {
        let before = self.lock_log().oldest().map(|m| m.id);
        let page = self.api.messages(self.room_id, before, PAGE_SIZE).await?;
        Ok(self.merge_page(page).await)
    }

    pub fn participants(&self) -> Vec<Participant> {
        lock(&self.participants).clone()
    }

    pub async fn refresh_participants(&self) -> Result<(), ApiError> {
        let fresh = self.api.participants(self.room_id).await?;
        debug!("Room {} has {} participants", self.room_id, fresh.len());
        *lock(&self.participants) = fresh;
        Ok(())
    }

    pub fn session_state(&self) -> SessionState {
        self.lifecycle.state()
    }

    pub fn controls(&self) -> SessionControls {
        self.lifecycle.controls()
    }

    /// Re-derives the round state from the server; failures keep the last
    /// known state.
    pub async fn refresh_session(&self) -> SessionState {
        match self.lifecycle.refresh().await {
            Ok(state) => {
                self.event_bus.publish(Event::SessionChanged {
                    room_id: self.room_id,
                    active: state.is_active(),
                });
                state
            }
            Err(err) => {
                warn!("Failed to refresh session of room {}: {}", self.room_id, err);
                self.lifecycle.state()
            }
        }
    }

    pub async fn start_session(&self, request: &StartSessionRequest) -> Result<StartOutcome, SessionError> {
        let outcome = self.lifecycle.start(request).await?;
        if let StartOutcome::Started(_) = &outcome {
            for participant in lock(&self.participants).iter_mut() {
                participant.payment_status = PaymentStatus::Unpaid;
            }
            self.event_bus.publish(Event::SessionChanged {
                room_id: self.room_id,
                active: true,
            });
        }
        Ok(outcome)
    }

    pub async fn end_session(&self) -> Result<AttendanceSheet, SessionError> {
        self.lifecycle.end().await
    }

    /// Stops the read throttle and the inbound pump, which unsubscribes.
    /// The shared transport stays up.
    pub fn close(&self) {
        self.cursor.cancel();
        self.pump.abort();
        debug!("Closed room {}", self.room_id);
    }

    pub fn realtime(&self) -> &RealtimeHandle {
        &self.realtime
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    async fn load_cached(&self) {
        let Some(store) = &self.store else { return };
        match store.cached_history(self.room_id, CACHE_LIMIT).await {
            Ok(cached) => {
                let added = self.lock_log().merge_history(cached);
                debug!("Room {}: {} cached messages", self.room_id, added);
            }
            Err(err) => warn!("Failed to read message cache: {:#}", err),
        }
    }

    async fn load_latest(&self) -> Result<usize, ApiError> {
        let page = self.api.messages(self.room_id, None, PAGE_SIZE).await?;
        Ok(self.merge_page(page).await)
    }

    async fn merge_page(&self, page: Vec<ChatMessage>) -> usize {
        if let Some(store) = &self.store {
            for message in &page {
                if let Err(err) = store.save_message(self.room_id, message).await {
                    warn!("Failed to cache message {}: {:#}", message.id, err);
                }
            }
        }
        self.lock_log().merge_history(page)
    }

    fn lock_log(&self) -> MutexGuard<'_, MessageLog> {
        lock(&self.log)
    }
}

impl Drop for ChatRoom {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn pump(
    room_id: RoomId,
    mut subscription: Subscription,
    log: Arc<Mutex<MessageLog>>,
    cursor: Arc<ReadCursor>,
    store: Option<Store>,
    event_bus: Arc<EventBus>,
) {
    while let Some(inbound) = subscription.recv().await {
        let message: ChatMessage = match serde_json::from_str(&inbound.body) {
            Ok(message) => message,
            Err(err) => {
                warn!("Undecodable message on {}: {}", inbound.destination, err);
                continue;
            }
        };

        let id = message.id;
        let fresh = lock(&log).push_live(message.clone());
        cursor.advance(id);
        if !fresh {
            debug!("Duplicate message {} in room {}", id, room_id);
            continue;
        }

        if let Some(store) = &store {
            if let Err(err) = store.save_message(room_id, &message).await {
                warn!("Failed to cache message {}: {:#}", id, err);
            }
        }
        event_bus.publish(Event::ChatMessage { room_id, message });
    }
    debug!("Room {} subscription ended", room_id);
}
