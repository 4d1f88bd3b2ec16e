//! REST client for the MoiMate API.
//!
//! All calls go through [`ApiClient::send`], which injects the `access`
//! header from the shared [`AuthSession`] and performs a single reissue and
//! retry when the server answers 401.

pub mod auth;
pub mod chat;
pub mod notification;
pub mod payment;
pub mod post;
pub mod profile;
pub mod session;

use crate::auth::AuthSession;
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub const ACCESS_HEADER: &str = "access";
pub const REFRESH_HEADER: &str = "refresh";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Server returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Not logged in or session expired")]
    Unauthorized,

    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Session storage error: {0}")]
    Session(anyhow::Error),

    #[error("Response missing {0}")]
    MissingField(&'static str),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            ApiError::Unauthorized => Some(401),
            _ => None,
        }
    }
}

/// Error body the server sends alongside non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base: Url,
    auth: AuthSession,
}

impl ApiClient {
    /// `api_url` is the server root; requests go to `{api_url}/api/...`.
    pub fn new(api_url: &Url, timeout: Duration, auth: AuthSession) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(concat!("moimate/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let mut root = api_url.clone();
        if !root.path().ends_with('/') {
            let path = format!("{}/", root.path());
            root.set_path(&path);
        }
        let base = root.join("api/")?;

        Ok(Self { client, base, auth })
    }

    pub fn auth(&self) -> &AuthSession {
        &self.auth
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base.join(path.trim_start_matches('/'))?)
    }

    pub(crate) async fn get_json<R>(&self, path: &str, query: &[(&str, String)]) -> Result<R, ApiError>
    where
        R: DeserializeOwned,
    {
        let response = self.send::<()>(Method::GET, path, query, None).await?;
        decode(response).await
    }

    pub(crate) async fn send_json<T, R>(&self, method: Method, path: &str, body: &T) -> Result<R, ApiError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.send(method, path, &[], Some(body)).await?;
        decode(response).await
    }

    /// For endpoints whose response body we don't need.
    pub(crate) async fn send_empty<T>(&self, method: Method, path: &str, body: Option<&T>) -> Result<(), ApiError>
    where
        T: Serialize + ?Sized,
    {
        self.send(method, path, &[], body).await?;
        Ok(())
    }

    pub(crate) async fn send<T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&T>,
    ) -> Result<Response, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let url = self.endpoint(path)?;
        let token = self.auth.access_token().await;

        let response = self
            .dispatch(method.clone(), url.clone(), query, body, token.as_deref())
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED || token.is_none() {
            return check(response).await;
        }

        debug!("{} {} answered 401, reissuing", method, url.path());
        self.reissue_after(token).await?;

        let token = self.auth.access_token().await;
        let response = self
            .dispatch(method, url, query, body, token.as_deref())
            .await?;
        check(response).await
    }

    async fn dispatch<T>(
        &self,
        method: Method,
        url: Url,
        query: &[(&str, String)],
        body: Option<&T>,
        token: Option<&str>,
    ) -> Result<Response, ApiError>
    where
        T: Serialize + ?Sized,
    {
        let mut req = self.client.request(method, url);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(token) = token {
            req = req.header(ACCESS_HEADER, token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    /// Reissues the access token unless another caller already replaced
    /// `stale` while we waited for the lock.
    async fn reissue_after(&self, stale: Option<String>) -> Result<(), ApiError> {
        let _guard = self.auth.lock_reissue().await;

        if self.auth.access_token().await != stale {
            return Ok(());
        }

        match self.reissue().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Token reissue failed: {}", err);
                self.auth.clear().await.map_err(ApiError::Session)?;
                Err(ApiError::Unauthorized)
            }
        }
    }
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|body| body.message.or(body.error))
        .unwrap_or_else(|| {
            if text.is_empty() {
                status.canonical_reason().unwrap_or("unknown error").to_string()
            } else {
                text
            }
        });

    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<R: DeserializeOwned>(response: Response) -> Result<R, ApiError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}


#[cfg(test)]
mod tests {
    use super::test_support::client_for;
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct Pong {
        ok: bool,
    }

    #[tokio::test]
    async fn injects_access_header() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .and(header("access", "token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("token-1")).await;
        let pong: Pong = client.get_json("/ping", &[]).await.unwrap();
        assert!(pong.ok);
    }

    #[tokio::test]
    async fn reissues_once_on_401_and_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .and(header("access", "stale"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/reissue"))
            .and(header("refresh", "refresh-token"))
            .respond_with(ResponseTemplate::new(200).insert_header("access", "fresh"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .and(header("access", "fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("stale")).await;
        let pong: Pong = client.get_json("ping", &[]).await.unwrap();
        assert!(pong.ok);
        assert_eq!(client.auth().access_token().await.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn failed_reissue_clears_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/reissue"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, Some("stale")).await;
        let err = client.get_json::<Pong>("ping", &[]).await.unwrap_err();
        assert!(matches!(err, ApiError::Unauthorized));
        assert!(!client.auth().is_logged_in().await);
    }

    #[tokio::test]
    async fn surfaces_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/ping"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"message": "이미 진행 중인 회차가 있습니다"})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, None).await;
        let err = client.get_json::<Pong>("ping", &[]).await.unwrap_err();
        match err {
            ApiError::Status { status, message } => {
                assert_eq!(status, 409);
                assert_eq!(message, "이미 진행 중인 회차가 있습니다");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn base_url_keeps_prefix() {
        let url = Url::parse("https://moimate.example/backend").unwrap();
        let client = ApiClient::new(&url, Duration::from_secs(1), AuthSession::in_memory()).unwrap();
        assert_eq!(client.base_url().as_str(), "https://moimate.example/backend/api/");
        assert_eq!(
            client.endpoint("/posts/3").unwrap().as_str(),
            "https://moimate.example/backend/api/posts/3"
        );
    }
}
