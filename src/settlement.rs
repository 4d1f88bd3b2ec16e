//! End-of-round attendance and deposit refunds.
//!
//! Ending a round is a multi-step server conversation: look up each
//! refundable deposit, refund it, then close the round. [`Settlement`]
//! records the outcome of every step so a run that stops part way can be
//! resumed without repeating a refund that already went through.

use crate::api::payment::{PaymentInfo, RefundRequest};
use crate::api::session::{SessionId, SessionInfo};
use crate::api::{ApiClient, ApiError};
use crate::entity::{Participant, RoomId, UserId};
use async_trait::async_trait;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceEntry {
    pub participant: Participant,
    pub paid: bool,
    pub attended: bool,
}

/// Snapshot of who paid for the round and who showed up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttendanceSheet {
    pub room_id: RoomId,
    pub session_id: SessionId,
    pub round_number: u32,
    entries: Vec<AttendanceEntry>,
}

impl AttendanceSheet {
    pub fn new(room_id: RoomId, session: &SessionInfo, participants: Vec<Participant>) -> Self {
        let entries = participants
            .into_iter()
            .map(|participant| AttendanceEntry {
                paid: participant.payment_status.is_paid(),
                attended: false,
                participant,
            })
            .collect();
        Self {
            room_id,
            session_id: session.id,
            round_number: session.round_number,
            entries,
        }
    }

    pub fn entries(&self) -> &[AttendanceEntry] {
        &self.entries
    }

    /// Flips the attendance mark; returns the new value, or `None` for an
    /// unknown user.
    pub fn toggle(&mut self, user_id: UserId) -> Option<bool> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.participant.user_id == user_id)?;
        entry.attended = !entry.attended;
        Some(entry.attended)
    }

    pub fn set_attended(&mut self, user_id: UserId, attended: bool) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|e| e.participant.user_id == user_id)
        {
            Some(entry) => {
                entry.attended = attended;
                true
            }
            None => false,
        }
    }

    /// Participants whose deposit goes back: paid and marked attended.
    pub fn refund_targets(&self) -> impl Iterator<Item = &AttendanceEntry> {
        self.entries.iter().filter(|e| e.paid && e.attended)
    }

    pub fn into_settlement(self) -> Settlement {
        let reason = format!("{}회차 출석 보증금 환불", self.round_number);
        let steps = self
            .refund_targets()
            .map(|e| RefundStep {
                user_id: e.participant.user_id,
                name: e.participant.name.clone(),
                info: None,
                refunded: false,
            })
            .collect();
        Settlement {
            session_id: self.session_id,
            reason,
            steps,
            session_ended: false,
        }
    }
}

/// Server calls a settlement needs.
#[async_trait]
pub trait SettlementApi: Send + Sync {
    async fn payment_info(&self, session_id: SessionId, user_id: UserId) -> Result<PaymentInfo, ApiError>;
    async fn refund(&self, request: &RefundRequest) -> Result<(), ApiError>;
    async fn end_session(&self, session_id: SessionId) -> Result<(), ApiError>;
}

#[async_trait]
impl SettlementApi for ApiClient {
    async fn payment_info(&self, session_id: SessionId, user_id: UserId) -> Result<PaymentInfo, ApiError> {
        ApiClient::payment_info(self, session_id, user_id).await
    }

    async fn refund(&self, request: &RefundRequest) -> Result<(), ApiError> {
        ApiClient::refund(self, request).await
    }

    async fn end_session(&self, session_id: SessionId) -> Result<(), ApiError> {
        ApiClient::end_session(self, session_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStep {
    Lookup(UserId),
    Refund(UserId),
    EndSession,
}

impl fmt::Display for SettlementStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettlementStep::Lookup(user) => write!(f, "payment lookup for user {user}"),
            SettlementStep::Refund(user) => write!(f, "refund for user {user}"),
            SettlementStep::EndSession => f.write_str("ending the session"),
        }
    }
}

#[derive(Debug, Clone)]
struct RefundStep {
    user_id: UserId,
    name: String,
    info: Option<PaymentInfo>,
    refunded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReport {
    pub refunded: Vec<UserId>,
    pub pending: Vec<UserId>,
    pub session_ended: bool,
}

#[derive(Debug, thiserror::Error)]
#[error("settlement stopped at {step}: {source}")]
pub struct SettlementError {
    pub step: SettlementStep,
    #[source]
    pub source: ApiError,
    pub report: SettlementReport,
}

/// Checkpointed refund-then-end workflow for one round.
#[derive(Debug, Clone)]
pub struct Settlement {
    session_id: SessionId,
    reason: String,
    steps: Vec<RefundStep>,
    session_ended: bool,
}

impl Settlement {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_complete(&self) -> bool {
        self.session_ended
    }

    pub fn report(&self) -> SettlementReport {
        let (done, pending): (Vec<_>, Vec<_>) = self.steps.iter().partition(|s| s.refunded);
        SettlementReport {
            refunded: done.iter().map(|s| s.user_id).collect(),
            pending: pending.iter().map(|s| s.user_id).collect(),
            session_ended: self.session_ended,
        }
    }

    /// Runs every step that has not completed yet. Calling it again after
    /// an error picks up at the failed step.
    pub async fn run<A>(&mut self, api: &A) -> Result<SettlementReport, SettlementError>
    where
        A: SettlementApi + ?Sized,
    {
        for index in 0..self.steps.len() {
            if self.steps[index].refunded {
                continue;
            }
            let user_id = self.steps[index].user_id;

            let info = match self.steps[index].info.clone() {
                Some(info) => info,
                None => {
                    let info = api
                        .payment_info(self.session_id, user_id)
                        .await
                        .map_err(|e| self.fail(SettlementStep::Lookup(user_id), e))?;
                    self.steps[index].info = Some(info.clone());
                    info
                }
            };

            let request = RefundRequest::full(&info, self.reason.clone());
            api.refund(&request)
                .await
                .map_err(|e| self.fail(SettlementStep::Refund(user_id), e))?;
            self.steps[index].refunded = true;
            info!(
                "Refunded {} to {} for session {}",
                info.amount, self.steps[index].name, self.session_id
            );
        }

        if !self.session_ended {
            api.end_session(self.session_id)
                .await
                .map_err(|e| self.fail(SettlementStep::EndSession, e))?;
            self.session_ended = true;
            info!("Session {} ended", self.session_id);
        }

        Ok(self.report())
    }

    pub async fn resume<A>(&mut self, api: &A) -> Result<SettlementReport, SettlementError>
    where
        A: SettlementApi + ?Sized,
    {
        self.run(api).await
    }

    fn fail(&self, step: SettlementStep, source: ApiError) -> SettlementError {
        warn!("Settlement of session {} stopped: {} failed: {}", self.session_id, step, source);
        SettlementError {
            step,
            source,
            report: self.report(),
        }
    }
}
