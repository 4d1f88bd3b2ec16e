use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws-stomp";

/// Runtime configuration, read from the environment (and `.env` when present).
#[derive(Debug, Clone)]
pub struct Config {
    /// Server root; the REST API lives under `{api_url}/api`.
    pub api_url: Url,
    /// STOMP WebSocket endpoint.
    pub ws_url: Url,
    pub db_path: PathBuf,
    pub http_timeout: Duration,
    pub kakao_client_id: Option<String>,
    pub google_client_id: Option<String>,
    pub push_sender_id: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup so tests don't touch process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_url = lookup("MOIMATE_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let ws_url = lookup("MOIMATE_WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.to_string());

        let db_path = match lookup("MOIMATE_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => {
                let home = lookup("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home).join(".moimate").join("client.db")
            }
        };

        let timeout_secs = match lookup("MOIMATE_HTTP_TIMEOUT_SECS") {
            Some(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("MOIMATE_HTTP_TIMEOUT_SECS is not a number: {raw}"))?,
            None => 30,
        };

        Ok(Self {
            api_url: Url::parse(&api_url).context("Invalid MOIMATE_API_URL")?,
            ws_url: Url::parse(&ws_url).context("Invalid MOIMATE_WS_URL")?,
            db_path,
            http_timeout: Duration::from_secs(timeout_secs),
            kakao_client_id: lookup("MOIMATE_KAKAO_CLIENT_ID").filter(|s| !s.is_empty()),
            google_client_id: lookup("MOIMATE_GOOGLE_CLIENT_ID").filter(|s| !s.is_empty()),
            push_sender_id: lookup("MOIMATE_PUSH_SENDER_ID").filter(|s| !s.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[("HOME", "/home/moi")])).unwrap();
        assert_eq!(config.api_url.as_str(), "http://localhost:8080/");
        assert_eq!(config.ws_url.as_str(), "ws://localhost:8080/ws-stomp");
        assert_eq!(config.db_path, PathBuf::from("/home/moi/.moimate/client.db"));
        assert_eq!(config.http_timeout, Duration::from_secs(30));
        assert!(config.kakao_client_id.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("MOIMATE_API_URL", "https://moimate.example"),
            ("MOIMATE_DB_PATH", "/tmp/moi.db"),
            ("MOIMATE_HTTP_TIMEOUT_SECS", "5"),
            ("MOIMATE_KAKAO_CLIENT_ID", "kakao-123"),
            ("MOIMATE_PUSH_SENDER_ID", ""),
        ]))
        .unwrap();
        assert_eq!(config.api_url.host_str(), Some("moimate.example"));
        assert_eq!(config.db_path, PathBuf::from("/tmp/moi.db"));
        assert_eq!(config.http_timeout, Duration::from_secs(5));
        assert_eq!(config.kakao_client_id.as_deref(), Some("kakao-123"));
        assert!(config.push_sender_id.is_none());
    }

    #[test]
    fn rejects_bad_timeout() {
        let err = Config::from_lookup(lookup_from(&[("MOIMATE_HTTP_TIMEOUT_SECS", "soon")]));
        assert!(err.is_err());
    }
}
