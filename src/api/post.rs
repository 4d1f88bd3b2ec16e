use super::{ApiClient, ApiError};
use crate::entity::UserId;
use chrono::NaiveDateTime;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::warn;

pub type PostId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub location: Option<String>,
    pub max_participants: u32,
    #[serde(default)]
    pub current_participants: u32,
    #[serde(default)]
    pub like_count: u32,
    #[serde(default)]
    pub liked: bool,
    pub author_id: UserId,
    #[serde(default)]
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostPage {
    pub content: Vec<Post>,
    #[serde(default)]
    pub total_pages: u32,
    #[serde(default)]
    pub last: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub location: Option<String>,
    pub max_participants: u32,
}

#[derive(Debug, Serialize)]
struct ApplicationRequest<'a> {
    message: &'a str,
}

/// Optimistic like state of one post as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub count: u32,
}

impl LikeState {
    pub fn of(post: &Post) -> Self {
        Self {
            liked: post.liked,
            count: post.like_count,
        }
    }

    /// Flips locally and returns the state before the flip.
    pub fn toggle(&mut self) -> LikeState {
        let previous = *self;
        if self.liked {
            self.liked = false;
            self.count = self.count.saturating_sub(1);
        } else {
            self.liked = true;
            self.count += 1;
        }
        previous
    }
}

impl ApiClient {
    pub async fn posts(&self, page: u32, size: u32, keyword: Option<&str>) -> Result<PostPage, ApiError> {
        let mut query = vec![("page", page.to_string()), ("size", size.to_string())];
        if let Some(keyword) = keyword {
            query.push(("keyword", keyword.to_string()));
        }
        self.get_json("posts", &query).await
    }

    pub async fn post(&self, post_id: PostId) -> Result<Post, ApiError> {
        self.get_json(&format!("posts/{post_id}"), &[]).await
    }

    pub async fn create_post(&self, draft: &PostDraft) -> Result<Post, ApiError> {
        self.send_json(Method::POST, "posts", draft).await
    }

    pub async fn update_post(&self, post_id: PostId, draft: &PostDraft) -> Result<Post, ApiError> {
        self.send_json(Method::PUT, &format!("posts/{post_id}"), draft)
            .await
    }

    pub async fn delete_post(&self, post_id: PostId) -> Result<(), ApiError> {
        self.send_empty::<()>(Method::DELETE, &format!("posts/{post_id}"), None)
            .await
    }

    pub async fn apply_to_post(&self, post_id: PostId, message: &str) -> Result<(), ApiError> {
        self.send_empty(
            Method::POST,
            &format!("posts/{post_id}/applications"),
            Some(&ApplicationRequest { message }),
        )
        .await
    }

    /// Flips `state` immediately, then tells the server. Rolls back on failure.
    pub async fn toggle_like(&self, post_id: PostId, state: &mut LikeState) -> Result<(), ApiError> {
        let previous = state.toggle();
        let method = if state.liked {
            Method::POST
        } else {
            Method::DELETE
        };

        let result = self
            .send_empty::<()>(method, &format!("posts/{post_id}/like"), None)
            .await;
        if let Err(err) = &result {
            warn!("Like toggle on post {} failed, rolling back: {}", post_id, err);
            *state = previous;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::client_for;
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn like_then_unlike_restores_original() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/posts/4/like"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/posts/4/like"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("t")).await;
        let original = LikeState {
            liked: false,
            count: 7,
        };
        let mut state = original;

        client.toggle_like(4, &mut state).await.unwrap();
        assert_eq!(state, LikeState { liked: true, count: 8 });
        client.toggle_like(4, &mut state).await.unwrap();
        assert_eq!(state, original);
    }

    #[tokio::test]
    async fn failed_like_rolls_back() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/posts/4/like"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = client_for(&server, Some("t")).await;
        let mut state = LikeState {
            liked: false,
            count: 0,
        };
        assert!(client.toggle_like(4, &mut state).await.is_err());
        assert_eq!(state, LikeState { liked: false, count: 0 });
    }
}
