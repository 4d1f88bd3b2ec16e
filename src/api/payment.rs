use super::session::SessionId;
use super::{ApiClient, ApiError};
use crate::entity::{Participant, UserId};
use reqwest::Method;
use serde::{Deserialize, Serialize};

/// Identifiers of one deposit, needed to refund it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInfo {
    pub payment_id: i64,
    pub user_id: UserId,
    pub imp_uid: String,
    pub merchant_uid: String,
    pub amount: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub session_id: SessionId,
    pub imp_uid: String,
    pub merchant_uid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub payment_id: i64,
    pub imp_uid: String,
    pub merchant_uid: String,
    pub amount: u32,
    pub reason: String,
}

impl RefundRequest {
    pub fn full(info: &PaymentInfo, reason: impl Into<String>) -> Self {
        Self {
            payment_id: info.payment_id,
            imp_uid: info.imp_uid.clone(),
            merchant_uid: info.merchant_uid.clone(),
            amount: info.amount,
            reason: reason.into(),
        }
    }
}

impl ApiClient {
    /// Payment status of every participant for a round.
    pub async fn payment_status(&self, session_id: SessionId) -> Result<Vec<Participant>, ApiError> {
        self.get_json(&format!("sessions/{session_id}/payments"), &[])
            .await
    }

    pub async fn payment_info(
        &self,
        session_id: SessionId,
        user_id: UserId,
    ) -> Result<PaymentInfo, ApiError> {
        self.get_json(&format!("sessions/{session_id}/payments/{user_id}"), &[])
            .await
    }

    /// Confirms a completed checkout with the server.
    pub async fn verify_payment(&self, request: &VerifyPaymentRequest) -> Result<PaymentInfo, ApiError> {
        self.send_json(Method::POST, "payments/verify", request).await
    }

    pub async fn refund(&self, request: &RefundRequest) -> Result<(), ApiError> {
        self.send_empty(Method::POST, "payments/refund", Some(request))
            .await
    }
}
