use super::{ApiClient, ApiError};
use crate::entity::RoomId;
use chrono::{NaiveDate, NaiveTime};
use reqwest::Method;
use serde::{Deserialize, Serialize};

pub type SessionId = i64;

/// One round of a recurring meetup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub round_number: u32,
    pub date: NaiveDate,
    pub time: NaiveTime,
    #[serde(default)]
    pub price: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub price: u32,
    pub location: String,
}

impl ApiClient {
    /// The room's active round, if any.
    pub async fn active_session(&self, room_id: RoomId) -> Result<Option<SessionInfo>, ApiError> {
        let path = format!("chat/rooms/{room_id}/sessions/active");
        let response = match self.send::<()>(Method::GET, &path, &[], None).await {
            Ok(response) => response,
            Err(ApiError::Status { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let session: Option<SessionInfo> = serde_json::from_slice(&bytes)?;
        Ok(session.filter(|s| s.active))
    }

    pub async fn start_session(
        &self,
        room_id: RoomId,
        request: &StartSessionRequest,
    ) -> Result<SessionInfo, ApiError> {
        self.send_json(Method::POST, &format!("chat/rooms/{room_id}/sessions"), request)
            .await
    }

    pub async fn end_session(&self, session_id: SessionId) -> Result<(), ApiError> {
        self.send_empty::<()>(Method::POST, &format!("sessions/{session_id}/end"), None)
            .await
    }
}
