use crate::chat::ChatMessage;
use crate::entity::RoomId;
use crate::notification::Notification;
use crate::realtime::ConnectionState;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A chat message was accepted into a room's log
    ChatMessage { room_id: RoomId, message: ChatMessage },

    /// A notification arrived on the per-user topic
    Notification(Notification),

    /// Transport state changed
    Connection(ConnectionState),

    /// A round started or the active round was re-derived from the server
    SessionChanged { room_id: RoomId, active: bool },

    /// Access token was reissued or cleared
    AuthChanged { logged_in: bool },
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(100);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // We ignore the error if there are no receivers
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
