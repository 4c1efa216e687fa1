//! Wire and result types for the moderation pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FilterError;
use crate::requests::model::{PENDING_STATUSES, RequestStatus, StatusTransition};

/// Body POSTed to the moderation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FilterRequest<'a> {
    pub sms: &'a str,
}

/// Moderation endpoint verdict. `blocked` is mandatory; a body without it
/// is a malformed response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub blocked: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub included_categories: Vec<String>,
    #[serde(default)]
    pub excluded_categories: Vec<String>,
}

/// Exactly one of these is emitted per submission.
#[derive(Debug, Clone)]
pub struct FilterResult {
    pub request_id: Uuid,
    pub outcome: Result<ModerationVerdict, FilterError>,
}

impl FilterResult {
    /// Status write implied by this result.
    ///
    /// Writes only land on requests that are still pending, so a late
    /// result never reopens a sent, taken, blocked or failed request.
    pub fn transition(&self) -> StatusTransition {
        let to = match &self.outcome {
            Err(_) => RequestStatus::Error,
            Ok(verdict) if verdict.blocked => RequestStatus::Blocked,
            Ok(_) => RequestStatus::ReadyToSend,
        };
        StatusTransition {
            request_id: self.request_id,
            from: PENDING_STATUSES,
            to,
        }
    }
}
