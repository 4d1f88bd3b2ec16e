use super::{check, ApiClient, ApiError, ACCESS_HEADER, REFRESH_HEADER};
use crate::auth::Tokens;
use crate::entity::UserIdentity;
use reqwest::{header::HeaderMap, Method};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthProvider {
    Kakao,
    Google,
}

impl OAuthProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            OAuthProvider::Kakao => "kakao",
            OAuthProvider::Google => "google",
        }
    }

    /// Where the user goes to obtain an authorization code.
    pub fn authorize_url(self, client_id: &str, redirect_uri: &str) -> Result<Url, ApiError> {
        let (base, scope) = match self {
            OAuthProvider::Kakao => (KAKAO_AUTHORIZE, None),
            OAuthProvider::Google => (GOOGLE_AUTHORIZE, Some("email profile")),
        };
        let mut url = Url::parse(base)?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", "code");
            if let Some(scope) = scope {
                query.append_pair("scope", scope);
            }
        }
        Ok(url)
    }
}

const KAKAO_AUTHORIZE: &str = "https://kauth.kakao.com/oauth/authorize";
const GOOGLE_AUTHORIZE: &str = "https://accounts.google.com/o/oauth2/v2/auth";

impl std::str::FromStr for OAuthProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kakao" => Ok(OAuthProvider::Kakao),
            "google" => Ok(OAuthProvider::Google),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    code: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    redirect_uri: Option<&'a str>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start_matches("Bearer ").to_string())
        .filter(|v| !v.is_empty())
}

impl ApiClient {
    /// Exchanges an OAuth authorization code for tokens and stores them.
    pub async fn login(
        &self,
        provider: OAuthProvider,
        code: &str,
        redirect_uri: Option<&str>,
    ) -> Result<UserIdentity, ApiError> {
        let url = self.endpoint(&format!("auth/login/{}", provider.as_str()))?;
        let response = self
            .client
            .post(url)
            .json(&LoginRequest { code, redirect_uri })
            .send()
            .await?;
        let response = check(response).await?;

        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        let body: LoginResponse = if bytes.is_empty() {
            LoginResponse::default()
        } else {
            serde_json::from_slice(&bytes)?
        };

        let access = header_value(&headers, ACCESS_HEADER)
            .or(body.access_token)
            .ok_or(ApiError::MissingField("access token"))?;
        let refresh = header_value(&headers, REFRESH_HEADER).or(body.refresh_token);

        self.auth
            .set_tokens(Tokens { access, refresh })
            .await
            .map_err(ApiError::Session)?;

        let me = self.me().await?;
        info!("Logged in as {}", me);
        Ok(me)
    }

    /// Calls the reissue endpoint with the refresh token and stores the result.
    /// Bypasses [`ApiClient::send`] so a 401 here cannot recurse.
    pub async fn reissue(&self) -> Result<(), ApiError> {
        let refresh = self
            .auth
            .refresh_token()
            .await
            .ok_or(ApiError::Unauthorized)?;

        let url = self.endpoint("auth/reissue")?;
        let mut req = self.client.post(url).header(REFRESH_HEADER, &refresh);
        if let Some(access) = self.auth.access_token().await {
            req = req.header(ACCESS_HEADER, access);
        }
        let response = check(req.send().await?).await?;

        let access = header_value(response.headers(), ACCESS_HEADER)
            .ok_or(ApiError::MissingField("access header"))?;
        let rotated = header_value(response.headers(), REFRESH_HEADER);

        self.auth
            .update_access(access, rotated)
            .await
            .map_err(ApiError::Session)?;
        info!("Access token reissued");
        Ok(())
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = self.send_empty::<()>(Method::POST, "auth/logout", None).await;
        // Local state goes regardless of what the server said.
        self.auth.clear().await.map_err(ApiError::Session)?;
        result
    }

    pub async fn withdraw(&self) -> Result<(), ApiError> {
        self.send_empty::<()>(Method::DELETE, "auth/withdraw", None)
            .await?;
        self.auth.clear().await.map_err(ApiError::Session)
    }

    /// Fetches the current identity and records it on the session.
    pub async fn me(&self) -> Result<UserIdentity, ApiError> {
        let me: UserIdentity = self.get_json("users/me", &[]).await?;
        self.auth.set_identity(me.clone()).await;
        Ok(me)
    }
}
