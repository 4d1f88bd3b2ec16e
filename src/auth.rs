use crate::entity::UserIdentity;
use crate::store::Store;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tokens {
    pub access: String,
    pub refresh: Option<String>,
}

#[derive(Debug, Default)]
struct AuthState {
    tokens: Option<Tokens>,
    identity: Option<UserIdentity>,
}

/// Single owner of the access/refresh tokens and the current identity.
///
/// Every outbound call reads the token from here, and every write goes
/// through here so it is persisted and broadcast to subscribers.
#[derive(Clone)]
pub struct AuthSession {
    state: Arc<RwLock<AuthState>>,
    store: Option<Store>,
    changes: Arc<watch::Sender<Option<String>>>,
    reissue_lock: Arc<Mutex<()>>,
}

impl AuthSession {
    /// A session that lives only in memory.
    pub fn in_memory() -> Self {
        Self::with_store(None, None)
    }

    /// Restores tokens persisted by a previous run.
    pub async fn restore(store: Store) -> Result<Self> {
        let access = store.get_value(ACCESS_TOKEN_KEY).await?;
        let refresh = store.get_value(REFRESH_TOKEN_KEY).await?;

        let tokens = access.map(|access| Tokens { access, refresh });
        match &tokens {
            Some(_) => info!("Restored persisted session"),
            None => info!("No persisted session found"),
        }

        Ok(Self::with_store(Some(store), tokens))
    }

    fn with_store(store: Option<Store>, tokens: Option<Tokens>) -> Self {
        let (tx, _rx) = watch::channel(tokens.as_ref().map(|t| t.access.clone()));
        Self {
            state: Arc::new(RwLock::new(AuthState {
                tokens,
                identity: None,
            })),
            store,
            changes: Arc::new(tx),
            reissue_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn access_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .tokens
            .as_ref()
            .map(|t| t.access.clone())
    }

    pub async fn refresh_token(&self) -> Option<String> {
        self.state
            .read()
            .await
            .tokens
            .as_ref()
            .and_then(|t| t.refresh.clone())
    }

    pub async fn is_logged_in(&self) -> bool {
        self.state.read().await.tokens.is_some()
    }

    pub async fn identity(&self) -> Option<UserIdentity> {
        self.state.read().await.identity.clone()
    }

    pub async fn set_identity(&self, identity: UserIdentity) {
        debug!("Session identity set to {}", identity);
        self.state.write().await.identity = Some(identity);
    }

    pub async fn set_tokens(&self, tokens: Tokens) -> Result<()> {
        if let Some(store) = &self.store {
            store.set_value(ACCESS_TOKEN_KEY, &tokens.access).await?;
            match &tokens.refresh {
                Some(refresh) => store.set_value(REFRESH_TOKEN_KEY, refresh).await?,
                None => store.remove_value(REFRESH_TOKEN_KEY).await?,
            }
        }

        let access = tokens.access.clone();
        self.state.write().await.tokens = Some(tokens);
        self.changes.send_replace(Some(access));
        Ok(())
    }

    /// Replaces the access token after a reissue, keeping the refresh token
    /// unless the server rotated it.
    pub async fn update_access(&self, access: String, refresh: Option<String>) -> Result<()> {
        let refresh = match refresh {
            Some(rotated) => Some(rotated),
            None => self.refresh_token().await,
        };
        self.set_tokens(Tokens { access, refresh }).await
    }

    pub async fn clear(&self) -> Result<()> {
        if let Some(store) = &self.store {
            store.remove_value(ACCESS_TOKEN_KEY).await?;
            store.remove_value(REFRESH_TOKEN_KEY).await?;
        }

        {
            let mut state = self.state.write().await;
            state.tokens = None;
            state.identity = None;
        }
        self.changes.send_replace(None);
        info!("Session cleared");
        Ok(())
    }

    /// Observe access-token changes (reissue, login, logout).
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.changes.subscribe()
    }

    /// Serializes reissue attempts so concurrent 401s refresh once.
    pub(crate) async fn lock_reissue(&self) -> MutexGuard<'_, ()> {
        self.reissue_lock.lock().await
    }
}
