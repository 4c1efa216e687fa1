//! SMS request records and their delivery status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::consent::model::OptInStatus;
use crate::error::Error;

/// Delivery status of an SMS request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Waiting on consent from at least one party.
    VerifyCheck,
    /// Both parties consented; available to the sender.
    ReadyToSend,
    /// Picked up by the sender.
    Taken,
    /// Delivered by the sender.
    Sent,
    /// Moderation failed; needs manual remediation.
    Error,
    /// Refused by a party or by moderation.
    Blocked,
}

/// Statuses that consent changes and moderation results may still move.
pub const PENDING_STATUSES: &[RequestStatus] =
    &[RequestStatus::VerifyCheck, RequestStatus::ReadyToSend];

impl RequestStatus {
    pub const ALL: [RequestStatus; 6] = [
        Self::VerifyCheck,
        Self::ReadyToSend,
        Self::Taken,
        Self::Sent,
        Self::Error,
        Self::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VerifyCheck => "verify_check",
            Self::ReadyToSend => "ready_to_send",
            Self::Taken => "taken",
            Self::Sent => "sent",
            Self::Error => "error",
            Self::Blocked => "blocked",
        }
    }

    pub fn is_pending(&self) -> bool {
        PENDING_STATUSES.contains(self)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown request status: {s}")))
    }
}

/// Initial request status from both parties' consent, first match wins:
/// any refusal blocks, any outstanding consent waits, otherwise ready.
pub fn derive_initial_status(from: OptInStatus, to: OptInStatus) -> RequestStatus {
    if from == OptInStatus::False || to == OptInStatus::False {
        RequestStatus::Blocked
    } else if from.is_pending() || to.is_pending() {
        RequestStatus::VerifyCheck
    } else {
        RequestStatus::ReadyToSend
    }
}

/// A single message send attempt between two numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsRequest {
    pub id: Uuid,
    /// Raw sender number as submitted.
    pub from_number: String,
    /// Raw recipient number as submitted.
    pub to_number: String,
    pub from_optin_id: Uuid,
    pub to_optin_id: Uuid,
    pub status: RequestStatus,
    pub message: String,
    pub created: DateTime<Utc>,
}

impl std::fmt::Display for SmsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SmsRequest {{ id: {}, status: {} }}", self.id, self.status)
    }
}

/// A pending request together with both parties' current consent.
#[derive(Debug, Clone)]
pub struct ConsentView {
    pub request: SmsRequest,
    pub from_status: OptInStatus,
    pub to_status: OptInStatus,
}

/// Compare-and-set status write: applies only while the request is in `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTransition {
    pub request_id: Uuid,
    pub from: &'static [RequestStatus],
    pub to: RequestStatus,
}
