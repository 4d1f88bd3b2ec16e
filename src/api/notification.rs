use super::{ApiClient, ApiError};
use crate::notification::Notification;
use reqwest::Method;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnreadCount {
    count: u32,
}

impl ApiClient {
    pub async fn notifications(&self) -> Result<Vec<Notification>, ApiError> {
        self.get_json("notifications", &[]).await
    }

    pub async fn unread_notification_count(&self) -> Result<u32, ApiError> {
        let unread: UnreadCount = self.get_json("notifications/unread-count", &[]).await?;
        Ok(unread.count)
    }

    pub async fn read_all_notifications(&self) -> Result<(), ApiError> {
        self.send_empty::<()>(Method::PATCH, "notifications/read-all", None)
            .await
    }
}
