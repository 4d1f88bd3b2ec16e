//! STOMP-over-WebSocket transport.
//!
//! A single supervisor task owns the socket. Callers talk to it through a
//! cloneable [`RealtimeHandle`]; inbound messages are routed to the
//! [`Subscription`] that asked for their destination. When the socket drops
//! the supervisor retries with [`Backoff`] and replays every live
//! subscription once it is back.

pub mod backoff;
pub mod frame;

pub use backoff::{Backoff, ConnectionState};
pub use frame::{Command, Frame, FrameError, HeartBeat};

use crate::auth::AuthSession;
use crate::bus::{Event, EventBus};
use crate::entity::{RoomId, UserId};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Inbound heart-beat intervals tolerated before the socket counts as dead.
const MISSED_BEATS: u32 = 2;

pub fn room_topic(room_id: RoomId) -> String {
    format!("/sub/chat/room/{room_id}")
}

pub fn room_destination(room_id: RoomId) -> String {
    format!("/pub/chat/message/{room_id}")
}

pub fn notification_topic(user_id: UserId) -> String {
    format!("/sub/notification/{user_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    #[error("realtime transport is not connected")]
    NotConnected,

    #[error("STOMP handshake failed: {0}")]
    Handshake(String),

    #[error("STOMP protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    pub url: Url,
    pub heart_beat: HeartBeat,
    pub backoff: Backoff,
    pub handshake_timeout: Duration,
}

impl RealtimeConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            heart_beat: HeartBeat::new(10_000, 10_000),
            backoff: Backoff::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// A MESSAGE frame delivered to a subscription.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub destination: String,
    pub message_id: Option<String>,
    pub body: String,
}

enum Request {
    Subscribe {
        id: String,
        destination: String,
        sink: mpsc::Sender<InboundMessage>,
    },
    Unsubscribe {
        id: String,
    },
    Publish {
        destination: String,
        body: String,
        reply: oneshot::Sender<Result<(), RealtimeError>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct RealtimeHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl RealtimeHandle {
    /// Spawns the supervisor and starts connecting. The access token is read
    /// from `auth` on every (re)connect.
    pub fn connect(config: RealtimeConfig, auth: AuthSession, bus: Arc<EventBus>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);

        let supervisor = Supervisor {
            config,
            auth,
            bus,
            requests: rx,
            state: state_tx,
            subscriptions: HashMap::new(),
        };
        tokio::spawn(supervisor.run());

        Self {
            requests: tx,
            state: state_rx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the transport reports `Connected`, or errors if it
    /// gives up first.
    pub async fn wait_connected(&self) -> Result<(), RealtimeError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(RealtimeError::NotConnected),
                _ => {}
            }
            state.changed().await.map_err(|_| RealtimeError::Closed)?;
        }
    }

    pub async fn subscribe(&self, destination: &str) -> Result<Subscription, RealtimeError> {
        let id = format!("sub-{}", Uuid::new_v4().simple());
        let (sink, rx) = mpsc::channel(256);
        self.requests
            .send(Request::Subscribe {
                id: id.clone(),
                destination: destination.to_string(),
                sink,
            })
            .await
            .map_err(|_| RealtimeError::Closed)?;

        Ok(Subscription {
            id,
            destination: destination.to_string(),
            rx,
            requests: self.requests.clone(),
        })
    }

    /// Sends without waiting for any broker acknowledgement. Fails fast when
    /// the socket is not up instead of dropping the message.
    pub async fn publish(&self, destination: &str, body: String) -> Result<(), RealtimeError> {
        if !self.state().is_connected() {
            return Err(RealtimeError::NotConnected);
        }
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(Request::Publish {
                destination: destination.to_string(),
                body,
                reply,
            })
            .await
            .map_err(|_| RealtimeError::NotConnected)?;
        rx.await.map_err(|_| RealtimeError::NotConnected)?
    }

    /// Safe to call any number of times.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .requests
            .send(Request::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }
}

/// Messages for one destination. Dropping it unsubscribes.
pub struct Subscription {
    id: String,
    destination: String,
    rx: mpsc::Receiver<InboundMessage>,
    requests: mpsc::Sender<Request>,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub async fn recv(&mut self) -> Option<InboundMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let request = Request::Unsubscribe {
            id: self.id.clone(),
        };
        match self.requests.try_send(request) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => warn!(
                "Request queue full; {} stays subscribed until its next message",
                self.destination
            ),
        }
    }
}

struct SubscriptionEntry {
    destination: String,
    sink: mpsc::Sender<InboundMessage>,
}

enum Exit {
    Shutdown,
    Reconnect,
}

struct Connection {
    sink: SplitSink<Socket, Message>,
    stream: SplitStream<Socket>,
    heartbeat: Option<Duration>,
    /// Silence longer than this means the server is gone.
    read_timeout: Option<Duration>,
}

struct Supervisor {
    config: RealtimeConfig,
    auth: AuthSession,
    bus: Arc<EventBus>,
    requests: mpsc::Receiver<Request>,
    state: watch::Sender<ConnectionState>,
    subscriptions: HashMap<String, SubscriptionEntry>,
}

impl Supervisor {
    async fn run(mut self) {
        let mut attempt = 0u32;
        loop {
            match self.open().await {
                Ok(conn) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    if let Exit::Shutdown = self.session(conn).await {
                        return;
                    }
                }
                Err(err) => warn!("Realtime connect failed: {}", err),
            }

            attempt += 1;
            match self.config.backoff.delay(attempt) {
                Some(delay) => {
                    self.set_state(ConnectionState::Degraded { attempt });
                    debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
                    if let Exit::Shutdown = self.idle(Some(Instant::now() + delay)).await {
                        return;
                    }
                }
                None => {
                    error!("Realtime transport gave up after {} attempts", attempt - 1);
                    self.set_state(ConnectionState::Disconnected);
                    self.idle(None).await;
                    return;
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!("Realtime transport {}", state);
            self.bus.publish(Event::Connection(state));
        }
    }

    async fn open(&mut self) -> Result<Connection, RealtimeError> {
        let token = self.auth.access_token().await;
        let mut url = self.config.url.clone();
        if let Some(token) = &token {
            url.query_pairs_mut().append_pair("token", token);
        }
        let host = self.config.url.host_str().unwrap_or("localhost").to_string();
        let heart_beat = self.config.heart_beat;

        let handshake = handshake(url, host, token, heart_beat);

        match timeout(self.config.handshake_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(RealtimeError::Handshake("timed out".into())),
        }
    }

    /// Runs one connected session until it drops or the caller disconnects.
    async fn session(&mut self, mut conn: Connection) -> Exit {
        let pruned = prune_closed(&mut self.subscriptions);
        if pruned > 0 {
            debug!("Dropped {} abandoned subscription(s) before replay", pruned);
        }
        for (id, entry) in &self.subscriptions {
            let frame = Frame::subscribe(id, &entry.destination);
            if let Err(err) = conn.sink.send(Message::Text(frame.encode().into())).await {
                warn!("Failed to replay subscription {}: {}", entry.destination, err);
                return Exit::Reconnect;
            }
        }

        let mut next_beat = conn.heartbeat.map(|every| Instant::now() + every);
        let mut read_deadline = conn.read_timeout.map(|limit| Instant::now() + limit);

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    let Some(request) = request else {
                        close(&mut conn).await;
                        self.set_state(ConnectionState::Disconnected);
                        return Exit::Shutdown;
                    };
                    match request {
                        Request::Disconnect { reply } => {
                            close(&mut conn).await;
                            self.set_state(ConnectionState::Disconnected);
                            let _ = reply.send(());
                            return Exit::Shutdown;
                        }
                        Request::Publish { destination, body, reply } => {
                            let frame = Frame::send(&destination, body);
                            let result = conn
                                .sink
                                .send(Message::Text(frame.encode().into()))
                                .await
                                .map_err(RealtimeError::from);
                            let failed = result.is_err();
                            let _ = reply.send(result);
                            if failed {
                                return Exit::Reconnect;
                            }
                        }
                        Request::Subscribe { id, destination, sink } => {
                            let frame = Frame::subscribe(&id, &destination);
                            self.subscriptions.insert(id, SubscriptionEntry { destination, sink });
                            if conn.sink.send(Message::Text(frame.encode().into())).await.is_err() {
                                return Exit::Reconnect;
                            }
                        }
                        Request::Unsubscribe { id } => {
                            if self.subscriptions.remove(&id).is_some() {
                                let frame = Frame::unsubscribe(&id);
                                if conn.sink.send(Message::Text(frame.encode().into())).await.is_err() {
                                    return Exit::Reconnect;
                                }
                            }
                        }
                    }
                    if let Some(every) = conn.heartbeat {
                        next_beat = Some(Instant::now() + every);
                    }
                }
                message = conn.stream.next() => {
                    read_deadline = conn.read_timeout.map(|limit| Instant::now() + limit);
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(err) = self.dispatch(&mut conn, text.as_str()).await {
                                warn!("Realtime session degraded: {}", err);
                                return Exit::Reconnect;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            info!("Server closed realtime connection: {:?}", frame);
                            return Exit::Reconnect;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!("Realtime transport error: {}", err);
                            return Exit::Reconnect;
                        }
                        None => return Exit::Reconnect,
                    }
                }
                _ = sleep_opt(next_beat) => {
                    if conn.sink.send(Message::Text("\n".to_string().into())).await.is_err() {
                        return Exit::Reconnect;
                    }
                    next_beat = conn.heartbeat.map(|every| Instant::now() + every);
                }
                _ = sleep_opt(read_deadline) => {
                    warn!("No heart-beat from server within {:?}", conn.read_timeout);
                    return Exit::Reconnect;
                }
            }
        }
    }

    async fn dispatch(&mut self, conn: &mut Connection, text: &str) -> Result<(), RealtimeError> {
        for frame in Frame::decode_all(text)? {
            match frame.command {
                Command::Message => {
                    let Some(id) = frame.get("subscription").map(str::to_string) else {
                        warn!("MESSAGE without subscription header");
                        continue;
                    };
                    let Some(entry) = self.subscriptions.get(&id) else {
                        debug!("MESSAGE for unknown subscription {}", id);
                        continue;
                    };
                    let inbound = InboundMessage {
                        destination: frame
                            .get("destination")
                            .unwrap_or(&entry.destination)
                            .to_string(),
                        message_id: frame.get("message-id").map(str::to_string),
                        body: frame.body,
                    };
                    if entry.sink.send(inbound).await.is_err() {
                        debug!("Subscriber for {} went away", entry.destination);
                        self.subscriptions.remove(&id);
                        let frame = Frame::unsubscribe(&id);
                        conn.sink.send(Message::Text(frame.encode().into())).await?;
                    }
                }
                Command::Error => {
                    let reason = frame.get("message").unwrap_or(&frame.body).to_string();
                    return Err(RealtimeError::Handshake(reason));
                }
                Command::Receipt => debug!("Receipt {:?}", frame.get("receipt-id")),
                other => debug!("Ignoring {} frame", other),
            }
        }
        Ok(())
    }

    /// Serves requests while no socket is up, until `deadline` (or forever).
    async fn idle(&mut self, deadline: Option<Instant>) -> Exit {
        loop {
            tokio::select! {
                _ = sleep_opt(deadline) => return Exit::Reconnect,
                request = self.requests.recv() => match request {
                    None => return Exit::Shutdown,
                    Some(Request::Disconnect { reply }) => {
                        self.set_state(ConnectionState::Disconnected);
                        let _ = reply.send(());
                        return Exit::Shutdown;
                    }
                    Some(Request::Publish { reply, .. }) => {
                        let _ = reply.send(Err(RealtimeError::NotConnected));
                    }
                    Some(Request::Subscribe { id, destination, sink }) => {
                        self.subscriptions.insert(id, SubscriptionEntry { destination, sink });
                    }
                    Some(Request::Unsubscribe { id }) => {
                        self.subscriptions.remove(&id);
                    }
                },
            }
        }
    }
}

async fn handshake(
    url: Url,
    host: String,
    token: Option<String>,
    heart_beat: HeartBeat,
) -> Result<Connection, RealtimeError> {
    let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
    let (mut sink, mut stream) = socket.split();

    let connect = Frame::connect(&host, token.as_deref(), heart_beat);
    sink.send(Message::Text(connect.encode().into())).await?;

    while let Some(message) = stream.next().await {
        let text = match message? {
            Message::Text(text) => text,
            Message::Close(_) => return Err(RealtimeError::Closed),
            _ => continue,
        };
        for frame in Frame::decode_all(text.as_str())? {
            match frame.command {
                Command::Connected => {
                    let server = frame
                        .get("heart-beat")
                        .and_then(HeartBeat::parse)
                        .unwrap_or_default();
                    return Ok(Connection {
                        sink,
                        stream,
                        heartbeat: heart_beat.outgoing_interval(server),
                        read_timeout: heart_beat
                            .incoming_interval(server)
                            .map(|every| every * MISSED_BEATS),
                    });
                }
                Command::Error => {
                    let reason = frame.get("message").unwrap_or(&frame.body).to_string();
                    return Err(RealtimeError::Handshake(reason));
                }
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }
    Err(RealtimeError::Closed)
}

async fn close(conn: &mut Connection) {
    let receipt = format!("disconnect-{}", Uuid::new_v4().simple());
    let frame = Frame::disconnect(&receipt);
    if let Err(err) = conn.sink.send(Message::Text(frame.encode().into())).await {
        debug!("DISCONNECT not delivered: {}", err);
    }
    let _ = conn.sink.close().await;
}

/// Forgets subscriptions whose receiver was dropped without reaching us.
fn prune_closed(subscriptions: &mut HashMap<String, SubscriptionEntry>) -> usize {
    let before = subscriptions.len();
    subscriptions.retain(|_, entry| !entry.sink.is_closed());
    before - subscriptions.len()
}

async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
