//! Cascade reconciler: moves pending requests after a consent change.

use std::sync::Arc;

use tracing::{debug, info};

use crate::consent::model::{OptIn, OptInStatus};
use crate::error::Result;
use crate::requests::model::{ConsentView, PENDING_STATUSES, RequestStatus, StatusTransition};
use crate::store::Database;

const AWAITING_CONSENT: &[RequestStatus] = &[RequestStatus::VerifyCheck];

/// Requests a change to `new_status` can affect.
fn affected_statuses(new_status: OptInStatus) -> &'static [RequestStatus] {
    match new_status {
        OptInStatus::True => AWAITING_CONSENT,
        OptInStatus::False => PENDING_STATUSES,
        OptInStatus::Ask | OptInStatus::Asked => &[],
    }
}

/// Transitions implied by a party moving to `new_status`, given the
/// affected requests with both parties' current consent.
///
/// Opting in promotes a waiting request only once the counterpart has also
/// opted in. Opting out blocks every pending request outright.
pub fn plan_cascade(new_status: OptInStatus, rows: &[ConsentView]) -> Vec<StatusTransition> {
    match new_status {
        OptInStatus::True => rows
            .iter()
            .filter(|row| row.request.status == RequestStatus::VerifyCheck)
            .filter(|row| row.from_status == OptInStatus::True && row.to_status == OptInStatus::True)
            .map(|row| StatusTransition {
                request_id: row.request.id,
                from: AWAITING_CONSENT,
                to: RequestStatus::ReadyToSend,
            })
            .collect(),
        OptInStatus::False => rows
            .iter()
            .filter(|row| row.request.status.is_pending())
            .map(|row| StatusTransition {
                request_id: row.request.id,
                from: PENDING_STATUSES,
                to: RequestStatus::Blocked,
            })
            .collect(),
        OptInStatus::Ask | OptInStatus::Asked => Vec::new(),
    }
}

pub struct CascadeReconciler {
    store: Arc<dyn Database>,
}

impl CascadeReconciler {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Re-evaluate every pending request involving `optin` after its
    /// status changed. Returns the number of requests moved.
    pub async fn reconcile(&self, optin: &OptIn) -> Result<usize> {
        let statuses = affected_statuses(optin.status);
        if statuses.is_empty() {
            return Ok(0);
        }

        let rows = self.store.list_requests_for_optin(optin.id, statuses).await?;
        let plan = plan_cascade(optin.status, &rows);
        if plan.is_empty() {
            debug!(optin_id = %optin.id, candidates = rows.len(), "Cascade found nothing to move");
            return Ok(0);
        }

        let changed = self.store.apply_transitions(&plan).await?;
        info!(
            optin_id = %optin.id,
            status = %optin.status,
            planned = plan.len(),
            changed,
            "Cascade applied"
        );
        Ok(changed)
    }
}
