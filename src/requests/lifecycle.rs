//! Request lifecycle: creation with consent-derived status, lookup and
//! direct status edits.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consent::ConsentLedger;
use crate::error::{Error, Result};
use crate::phone;
use crate::pipeline::FilterPipeline;
use crate::requests::model::{PENDING_STATUSES, RequestStatus, SmsRequest, StatusTransition};
use crate::store::Database;

pub struct RequestLifecycle {
    store: Arc<dyn Database>,
    ledger: Arc<ConsentLedger>,
    pipeline: Arc<FilterPipeline>,
}

impl RequestLifecycle {
    pub fn new(
        store: Arc<dyn Database>,
        ledger: Arc<ConsentLedger>,
        pipeline: Arc<FilterPipeline>,
    ) -> Self {
        Self {
            store,
            ledger,
            pipeline,
        }
    }

    /// Create a request between two numbers and queue its message for
    /// moderation.
    ///
    /// The returned record carries the consent-derived status; a moderation
    /// verdict may still move it later. Requests blocked at creation are
    /// never sent to moderation. Nothing is stored once the pipeline is shut
    /// down.
    pub async fn create(
        &self,
        from_number: &str,
        to_number: &str,
        message: &str,
    ) -> Result<SmsRequest> {
        if message.trim().is_empty() {
            return Err(Error::InvalidArgument("message must not be empty".into()));
        }
        phone::canonicalize(from_number)?;
        phone::canonicalize(to_number)?;

        if self.pipeline.is_closed().await {
            return Err(Error::PipelineClosed);
        }

        let from = self.ledger.find_or_create(from_number).await?;
        let to = self.ledger.find_or_create(to_number).await?;

        // Status is derived from the parties' consent as stored at insert
        // time, so a concurrent cascade either sees this row or ran first.
        let view = self
            .store
            .insert_request_with_consent(&SmsRequest {
                id: Uuid::new_v4(),
                from_number: from_number.to_string(),
                to_number: to_number.to_string(),
                from_optin_id: from.id,
                to_optin_id: to.id,
                status: RequestStatus::VerifyCheck,
                message: message.to_string(),
                created: Utc::now(),
            })
            .await?;
        let request = view.request;

        info!(
            request_id = %request.id,
            status = %request.status,
            from = %view.from_status,
            to = %view.to_status,
            "SMS request created"
        );

        if request.status == RequestStatus::Blocked {
            debug!(request_id = %request.id, "Blocked at creation, skipping moderation");
            return Ok(request);
        }

        // Shutdown can still win between the check above and here.
        if let Err(e) = self.pipeline.submit(request.id, request.message.clone()).await {
            warn!(request_id = %request.id, error = %e, "Could not queue moderation");
            self.store
                .apply_transitions(&[StatusTransition {
                    request_id: request.id,
                    from: PENDING_STATUSES,
                    to: RequestStatus::Error,
                }])
                .await?;
            return Err(e);
        }

        Ok(request)
    }

    pub async fn get(&self, id: Uuid) -> Result<SmsRequest> {
        self.store
            .get_request(id)
            .await?
            .ok_or_else(|| Error::not_found("sms_request", id))
    }

    /// Overwrite a request's status. No transition rules apply here.
    pub async fn update_status(&self, id: Uuid, status: RequestStatus) -> Result<SmsRequest> {
        let updated = self
            .store
            .set_request_status(id, status)
            .await?
            .ok_or_else(|| Error::not_found("sms_request", id))?;
        info!(request_id = %id, status = %status, "SMS request status set");
        Ok(updated)
    }

    /// Oldest request ready for the sender.
    pub async fn earliest_ready_to_send(&self) -> Result<SmsRequest> {
        self.store
            .earliest_request_with_status(RequestStatus::ReadyToSend)
            .await?
            .ok_or_else(|| Error::not_found("sms_request", "status ready_to_send"))
    }
}
