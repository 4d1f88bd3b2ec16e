use serde::{Deserialize, Serialize};
use std::fmt;

pub type UserId = i64;
pub type RoomId = i64;

/// The logged-in user as returned by `/users/me`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserIdentity {
    pub user_id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub image: Option<String>,
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.nickname, self.user_id)
    }
}

/// Payment status of a participant for the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "참여")]
    Paid,
    #[serde(rename = "불참")]
    Unpaid,
}

impl PaymentStatus {
    pub fn is_paid(self) -> bool {
        matches!(self, PaymentStatus::Paid)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Paid => "참여",
            PaymentStatus::Unpaid => "불참",
        }
    }
}

impl Default for PaymentStatus {
    fn default() -> Self {
        PaymentStatus::Unpaid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub payment_status: PaymentStatus,
}

/// Role of the current user inside a chat room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomRole {
    Owner,
    Member,
}

impl RoomRole {
    pub fn is_owner(self) -> bool {
        matches!(self, RoomRole::Owner)
    }
}
