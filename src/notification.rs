use crate::api::{ApiClient, ApiError};
use crate::bus::{Event, EventBus};
use crate::entity::UserId;
use crate::realtime::{notification_topic, RealtimeError, RealtimeHandle};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const BANNER_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    Chat,
    Apply,
    Accept,
    Reject,
    SessionStart,
    SessionEnd,
    Payment,
    Refund,
    Review,
    #[serde(other)]
    Unknown,
}

impl NotificationKind {
    pub fn label(self) -> &'static str {
        match self {
            NotificationKind::Chat => "새 메시지",
            NotificationKind::Apply => "참여 신청",
            NotificationKind::Accept => "참여 승인",
            NotificationKind::Reject => "참여 거절",
            NotificationKind::SessionStart => "회차 시작",
            NotificationKind::SessionEnd => "회차 종료",
            NotificationKind::Payment => "결제 완료",
            NotificationKind::Refund => "환불 완료",
            NotificationKind::Review => "새 리뷰",
            NotificationKind::Unknown => "알림",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub content: String,
    #[serde(default)]
    pub related_id: Option<i64>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub notification_id: i64,
    pub kind: NotificationKind,
    pub text: String,
}

impl From<&Notification> for Banner {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            kind: n.kind,
            text: format!("[{}] {}", n.kind.label(), n.content),
        }
    }
}

struct Shared {
    banner: watch::Sender<Option<Banner>>,
    generation: AtomicU64,
    unread: AtomicU32,
    bus: Arc<EventBus>,
    timeout: Duration,
}

impl Shared {
    fn deliver(self: &Arc<Self>, notification: Notification) {
        if !notification.is_read {
            self.unread.fetch_add(1, Ordering::AcqRel);
        }
        self.show(Banner::from(&notification));
        self.bus.publish(Event::Notification(notification));
    }

    /// Replaces the current banner and restarts the dismiss timer.
    fn show(self: &Arc<Self>, banner: Banner) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.banner.send_replace(Some(banner));

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.timeout).await;
            shared.banner.send_if_modified(|current| {
                if shared.generation.load(Ordering::Acquire) == generation && current.is_some() {
                    *current = None;
                    true
                } else {
                    false
                }
            });
        });
    }
}

/// The global banner plus the unread counter.
pub struct NotificationCenter {
    api: ApiClient,
    shared: Arc<Shared>,
    pump: Option<JoinHandle<()>>,
}

impl NotificationCenter {
    pub fn new(api: ApiClient, bus: Arc<EventBus>) -> Self {
        let (banner, _rx) = watch::channel(None);
        Self {
            api,
            shared: Arc::new(Shared {
                banner,
                generation: AtomicU64::new(0),
                unread: AtomicU32::new(0),
                bus,
                timeout: BANNER_TIMEOUT,
            }),
            pump: None,
        }
    }

    /// Starts feeding banners from the user's notification topic.
    pub async fn listen(&mut self, realtime: &RealtimeHandle, user_id: UserId) -> Result<(), RealtimeError> {
        let mut subscription = realtime.subscribe(&notification_topic(user_id)).await?;
        let shared = Arc::clone(&self.shared);

        if let Some(previous) = self.pump.take() {
            previous.abort();
        }
        self.pump = Some(tokio::spawn(async move {
            while let Some(inbound) = subscription.recv().await {
                match serde_json::from_str::<Notification>(&inbound.body) {
                    Ok(notification) => {
                        debug!("Notification {} ({:?})", notification.id, notification.kind);
                        shared.deliver(notification);
                    }
                    Err(err) => warn!("Undecodable notification: {}", err),
                }
            }
            info!("Notification topic closed");
        }));
        Ok(())
    }

    /// Shows a notification received through some other channel.
    pub fn deliver(&self, notification: Notification) {
        self.shared.deliver(notification);
    }

    pub fn banner(&self) -> Option<Banner> {
        self.shared.banner.borrow().clone()
    }

    pub fn watch_banner(&self) -> watch::Receiver<Option<Banner>> {
        self.shared.banner.subscribe()
    }

    pub fn unread_count(&self) -> u32 {
        self.shared.unread.load(Ordering::Acquire)
    }

    /// Fetches the unread count; on failure the last known value stays.
    pub async fn refresh_unread(&self) -> u32 {
        match self.api.unread_notification_count().await {
            Ok(count) => {
                self.shared.unread.store(count, Ordering::Release);
                count
            }
            Err(err) => {
                warn!("Failed to fetch unread notification count: {}", err);
                self.unread_count()
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Notification>, ApiError> {
        self.api.notifications().await
    }

    pub async fn read_all(&self) -> Result<(), ApiError> {
        self.api.read_all_notifications().await?;
        self.shared.unread.store(0, Ordering::Release);
        Ok(())
    }
}

impl Drop for NotificationCenter {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::client_for;
    use crate::auth::AuthSession;
    use serde_json::json;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notification(id: i64, kind: NotificationKind) -> Notification {
        Notification {
            id,
            kind,
            content: format!("n{id}"),
            related_id: None,
            is_read: false,
            created_at: None,
        }
    }

    fn offline_center() -> NotificationCenter {
        let url = Url::parse("http://127.0.0.1:9").unwrap();
        let api = ApiClient::new(&url, Duration::from_secs(1), AuthSession::in_memory()).unwrap();
        NotificationCenter::new(api, Arc::new(EventBus::new()))
    }

    #[test]
    fn decodes_known_and_unknown_types() {
        let n: Notification = serde_json::from_value(json!({
            "id": 1, "type": "SESSION_START", "content": "3회차", "relatedId": 7, "isRead": false
        }))
        .unwrap();
        assert_eq!(n.kind, NotificationKind::SessionStart);
        assert_eq!(Banner::from(&n).text, "[회차 시작] 3회차");

        let n: Notification =
            serde_json::from_value(json!({"id": 2, "type": "SOMETHING_NEW", "content": "x"})).unwrap();
        assert_eq!(n.kind, NotificationKind::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn banner_dismisses_after_timeout() {
        let center = offline_center();
        center.deliver(notification(1, NotificationKind::Chat));
        assert_eq!(center.banner().map(|b| b.notification_id), Some(1));
        assert_eq!(center.unread_count(), 1);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert!(center.banner().is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(center.banner().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_banner_restarts_timer() {
        let center = offline_center();
        center.deliver(notification(1, NotificationKind::Chat));
        tokio::time::sleep(Duration::from_secs(2)).await;
        center.deliver(notification(2, NotificationKind::Apply));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(center.banner().map(|b| b.notification_id), Some(2));

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(center.banner().is_none());
    }

    #[tokio::test]
    async fn unread_count_survives_failed_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/unread-count"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"count": 4})))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/notifications/unread-count"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/api/notifications/read-all"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let api = client_for(&server, Some("t")).await;
        let center = NotificationCenter::new(api, Arc::new(EventBus::new()));

        assert_eq!(center.refresh_unread().await, 4);
        assert_eq!(center.refresh_unread().await, 4);
        center.read_all().await.unwrap();
        assert_eq!(center.unread_count(), 0);
    }
}
