use super::session::SessionId;
use super::{ApiClient, ApiError};
use crate::entity::UserId;
use chrono::NaiveDateTime;
use reqwest::Method;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub introduction: Option<String>,
    #[serde(default)]
    pub rating: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub introduction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub id: i64,
    pub reviewer_id: UserId,
    pub reviewee_id: UserId,
    pub score: u8,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewReview {
    pub session_id: SessionId,
    pub reviewee_id: UserId,
    pub score: u8,
    pub comment: String,
}

impl ApiClient {
    pub async fn profile(&self, user_id: UserId) -> Result<Profile, ApiError> {
        self.get_json(&format!("users/{user_id}"), &[]).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<Profile, ApiError> {
        self.send_json(Method::PATCH, "users/me", update).await
    }

    pub async fn reviews(&self, user_id: UserId) -> Result<Vec<Review>, ApiError> {
        self.get_json(&format!("users/{user_id}/reviews"), &[]).await
    }

    pub async fn write_review(&self, review: &NewReview) -> Result<Review, ApiError> {
        self.send_json(Method::POST, "reviews", review).await
    }
}
