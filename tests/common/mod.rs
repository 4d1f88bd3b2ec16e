//! In-process STOMP broker over an axum WebSocket route.

#![allow(dead_code)]

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use moimate::realtime::{room_topic, Command, Frame};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use url::Url;

pub struct Broker {
    pub addr: SocketAddr,
    outbound: broadcast::Sender<(String, String)>,
    kill: broadcast::Sender<()>,
    heart_beat: &'static str,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    subscriptions: Mutex<Vec<String>>,
    sent: Mutex<Vec<(String, String)>>,
    tokens: Mutex<Vec<Option<String>>>,
    next_id: AtomicI64,
}

impl Broker {
    pub async fn start() -> Arc<Self> {
        Self::start_with_heart_beat("0,0").await
    }

    /// The broker advertises `heart_beat` in CONNECTED but never sends any.
    pub async fn start_with_heart_beat(heart_beat: &'static str) -> Arc<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (outbound, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let broker = Arc::new(Self {
            addr: listener.local_addr().unwrap(),
            outbound,
            kill,
            heart_beat,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            subscriptions: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1000),
        });

        let app = Router::new()
            .route("/ws-stomp", get(upgrade))
            .with_state(broker.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        broker
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/ws-stomp", self.addr)).unwrap()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<Option<String>> {
        self.tokens.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subscribers(&self, destination: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap()
            .iter()
            .filter(|d| *d == destination)
            .count()
    }

    /// Broadcasts a MESSAGE body to every subscriber of `destination`.
    pub fn push(&self, destination: &str, body: String) {
        let _ = self.outbound.send((destination.to_string(), body));
    }

    /// Drops every open connection.
    pub fn kill_connections(&self) {
        let _ = self.kill.send(());
    }

    pub async fn wait_for_subscribers(&self, destination: &str, count: usize) {
        wait_until(|| self.subscribers(destination) >= count).await;
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn chat_message_json(id: i64, sender: &str, text: &str, minute: u32) -> String {
    json!({
        "id": id,
        "senderId": 1,
        "senderName": sender,
        "text": text,
        "sentAtTime": format!("2024-05-01T12:{minute:02}:00"),
    })
    .to_string()
}

async fn upgrade(ws: WebSocketUpgrade, State(broker): State<Arc<Broker>>) -> Response {
    ws.on_upgrade(move |socket| serve(socket, broker))
}

async fn serve(socket: WebSocket, broker: Arc<Broker>) {
    let (mut sink, mut stream) = socket.split();
    let mut outbound = broker.outbound.subscribe();
    let mut kill = broker.kill.subscribe();
    let mut subs: HashMap<String, String> = HashMap::new();

    'conn: loop {
        tokio::select! {
            message = stream.next() => {
                let text = match message {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                    _ => break,
                };
                let Ok(frames) = Frame::decode_all(&text) else { break };
                for frame in frames {
                    match frame.command {
                        Command::Connect | Command::Stomp => {
                            broker.connects.fetch_add(1, Ordering::SeqCst);
                            broker.tokens.lock().unwrap().push(frame.get("access").map(str::to_string));
                            let reply = Frame::new(Command::Connected)
                                .header("version", "1.2")
                                .header("heart-beat", broker.heart_beat);
                            if sink.send(Message::Text(reply.encode())).await.is_err() {
                                break 'conn;
                            }
                        }
                        Command::Subscribe => {
                            let id = frame.get("id").unwrap_or_default().to_string();
                            let destination = frame.get("destination").unwrap_or_default().to_string();
                            broker.subscriptions.lock().unwrap().push(destination.clone());
                            subs.insert(destination, id);
                        }
                        Command::Unsubscribe => {
                            let id = frame.get("id").unwrap_or_default();
                            if let Some(destination) = subs
                                .iter()
                                .find(|(_, sub)| sub.as_str() == id)
                                .map(|(d, _)| d.clone())
                            {
                                subs.remove(&destination);
                                remove_one(&broker, &destination);
                            }
                        }
                        Command::Send => {
                            let destination = frame.get("destination").unwrap_or_default().to_string();
                            broker.sent.lock().unwrap().push((destination.clone(), frame.body.clone()));
                            if let Some(room) = destination.strip_prefix("/pub/chat/message/") {
                                let room: i64 = room.parse().unwrap();
                                let payload: serde_json::Value = serde_json::from_str(&frame.body).unwrap();
                                let id = broker.next_id.fetch_add(1, Ordering::SeqCst);
                                let body = chat_message_json(
                                    id,
                                    "echo",
                                    payload["content"].as_str().unwrap_or_default(),
                                    59,
                                );
                                broker.push(&room_topic(room), body);
                            }
                        }
                        Command::Disconnect => {
                            broker.disconnects.fetch_add(1, Ordering::SeqCst);
                            if let Some(receipt) = frame.get("receipt") {
                                let reply = Frame::new(Command::Receipt).header("receipt-id", receipt);
                                let _ = sink.send(Message::Text(reply.encode())).await;
                            }
                            break 'conn;
                        }
                        _ => {}
                    }
                }
            }
            event = outbound.recv() => {
                let Ok((destination, body)) = event else { continue };
                if let Some(id) = subs.get(&destination) {
                    let message_id = broker.next_id.fetch_add(1, Ordering::SeqCst);
                    let frame = Frame::new(Command::Message)
                        .header("destination", destination.as_str())
                        .header("subscription", id.as_str())
                        .header("message-id", message_id.to_string())
                        .body(body);
                    if sink.send(Message::Text(frame.encode())).await.is_err() {
                        break;
                    }
                }
            }
            _ = kill.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    for destination in subs.keys() {
        remove_one(&broker, destination);
    }
}

fn remove_one(broker: &Broker, destination: &str) {
    let mut subscriptions = broker.subscriptions.lock().unwrap();
    if let Some(pos) = subscriptions.iter().position(|d| d == destination) {
        subscriptions.remove(pos);
    }
}
