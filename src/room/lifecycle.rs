use crate::api::session::{SessionInfo, StartSessionRequest};
use crate::api::{ApiClient, ApiError};
use crate::entity::{RoomId, RoomRole};
use crate::settlement::AttendanceSheet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    NoActiveSession,
    SessionActive(SessionInfo),
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::SessionActive(_))
    }
}

/// Which round controls a view may show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionControls {
    pub can_start: bool,
    pub can_end: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Started(SessionInfo),
    /// A round was already active; nothing was sent.
    AlreadyActive(SessionInfo),
    /// Another start is in flight; nothing was sent.
    InFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("only the room owner can {0}")]
    NotOwner(&'static str),

    #[error("no active session")]
    NoActiveSession,

    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    starting: bool,
}

/// Client mirror of a room's round state. The server stays the authority:
/// `end` only produces the attendance snapshot and `refresh` re-derives
/// the state afterwards.
#[derive(Clone)]
pub struct SessionLifecycle {
    room_id: RoomId,
    role: RoomRole,
    api: ApiClient,
    inner: Arc<Mutex<Inner>>,
}

impl SessionLifecycle {
    pub fn new(room_id: RoomId, role: RoomRole, api: ApiClient) -> Self {
        Self {
            room_id,
            role,
            api,
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::NoActiveSession,
                starting: false,
            })),
        }
    }

    pub fn role(&self) -> RoomRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.lock().state.clone()
    }

    pub fn controls(&self) -> SessionControls {
        let inner = self.lock();
        let owner = self.role.is_owner();
        SessionControls {
            can_start: owner && !inner.state.is_active() && !inner.starting,
            can_end: owner && inner.state.is_active(),
        }
    }

    pub async fn refresh(&self) -> Result<SessionState, ApiError> {
        let active = self.api.active_session(self.room_id).await?;
        let state = match active {
            Some(session) => SessionState::SessionActive(session),
            None => SessionState::NoActiveSession,
        };
        debug!("Room {} session state: {:?}", self.room_id, state);
        self.lock().state = state.clone();
        Ok(state)
    }

    pub async fn start(&self, request: &StartSessionRequest) -> Result<StartOutcome, SessionError> {
        if !self.role.is_owner() {
            return Err(SessionError::NotOwner("start a session"));
        }

        {
            let mut inner = self.lock();
            if let SessionState::SessionActive(session) = &inner.state {
                return Ok(StartOutcome::AlreadyActive(session.clone()));
            }
            if inner.starting {
                return Ok(StartOutcome::InFlight);
            }
            inner.starting = true;
        }

        let result = self.api.start_session(self.room_id, request).await;

        let mut inner = self.lock();
        inner.starting = false;
        let session = result?;
        info!(
            "Room {} started round {} ({})",
            self.room_id, session.round_number, session.id
        );
        inner.state = SessionState::SessionActive(session.clone());
        Ok(StartOutcome::Started(session))
    }

    /// Builds the attendance snapshot for the active round.
    pub async fn end(&self) -> Result<AttendanceSheet, SessionError> {
        if !self.role.is_owner() {
            return Err(SessionError::NotOwner("end a session"));
        }
        let session = match &self.lock().state {
            SessionState::SessionActive(session) => session.clone(),
            SessionState::NoActiveSession => return Err(SessionError::NoActiveSession),
        };

        let payments = self.api.payment_status(session.id).await?;
        Ok(AttendanceSheet::new(self.room_id, &session, payments))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means another task panicked mid-update; the
        // state itself is a plain value.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
