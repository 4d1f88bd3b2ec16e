use super::{ApiClient, ApiError};
use crate::chat::{ChatMessage, MessageId};
use crate::entity::{Participant, RoomId, RoomRole};
use reqwest::Method;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomSummary {
    pub room_id: RoomId,
    pub title: String,
    #[serde(default)]
    pub post_id: Option<i64>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    pub role: RoomRole,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadRequest {
    message_id: MessageId,
}

impl ApiClient {
    pub async fn chat_rooms(&self) -> Result<Vec<ChatRoomSummary>, ApiError> {
        self.get_json("chat/rooms", &[]).await
    }

    pub async fn participants(&self, room_id: RoomId) -> Result<Vec<Participant>, ApiError> {
        self.get_json(&format!("chat/rooms/{room_id}/participants"), &[])
            .await
    }

    /// One page of history, newest page first; `before` pages further back.
    pub async fn messages(
        &self,
        room_id: RoomId,
        before: Option<MessageId>,
        size: u32,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        let mut query = vec![("size", size.to_string())];
        if let Some(before) = before {
            query.push(("before", before.to_string()));
        }
        self.get_json(&format!("chat/rooms/{room_id}/messages"), &query)
            .await
    }

    /// Reports the read cursor.
    pub async fn mark_read(&self, room_id: RoomId, message_id: MessageId) -> Result<(), ApiError> {
        self.send_empty(
            Method::POST,
            &format!("chat/rooms/{room_id}/read"),
            Some(&ReadRequest { message_id }),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::client_for;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn history_pages_with_before_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/chat/rooms/3/messages"))
            .and(query_param("size", "30"))
            .and(query_param("before", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": 99,
                "senderId": 2,
                "senderName": "joon",
                "text": "hi",
                "sentAtTime": "2024-05-01T10:00:00"
            }])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("t")).await;
        let page = client.messages(3, Some(100), 30).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, 99);
    }

    #[tokio::test]
    async fn mark_read_posts_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat/rooms/3/read"))
            .and(body_json(json!({"messageId": 42})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("t")).await;
        client.mark_read(3, 42).await.unwrap();
    }
}
