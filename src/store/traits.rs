//! Backend-agnostic `Database` trait covering opt-ins and SMS requests.

use async_trait::async_trait;
use uuid::Uuid;

use crate::consent::model::{OptIn, OptInStatus};
use crate::error::DatabaseError;
use crate::requests::model::{ConsentView, RequestStatus, SmsRequest, StatusTransition};

/// Single async interface for all persistence.
///
/// Every method is atomic with respect to every other method on the same
/// backend; multi-row writes run inside one transaction.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Opt-ins ─────────────────────────────────────────────────────

    /// Insert a new opt-in. Fails with `Constraint` if the number already has one.
    async fn insert_optin(&self, optin: &OptIn) -> Result<(), DatabaseError>;

    async fn get_optin(&self, id: Uuid) -> Result<Option<OptIn>, DatabaseError>;

    async fn get_optin_by_number(&self, number: &str) -> Result<Option<OptIn>, DatabaseError>;

    /// Set an opt-in's status only if it is currently `from`.
    /// Returns the updated record, or `None` if the status had moved on.
    async fn transition_optin_status(
        &self,
        id: Uuid,
        from: OptInStatus,
        to: OptInStatus,
    ) -> Result<Option<OptIn>, DatabaseError>;

    /// Oldest opt-in (by creation time) currently in `status`.
    async fn earliest_optin_with_status(
        &self,
        status: OptInStatus,
    ) -> Result<Option<OptIn>, DatabaseError>;

    // ── SMS requests ────────────────────────────────────────────────

    /// Insert a request exactly as given, status included.
    async fn insert_request(&self, request: &SmsRequest) -> Result<(), DatabaseError>;

    /// Insert a request whose status is derived from both parties' stored
    /// consent, read in the same transaction as the insert. `request.status`
    /// is ignored. Fails with `NotFound` if either opt-in is missing.
    async fn insert_request_with_consent(
        &self,
        request: &SmsRequest,
    ) -> Result<ConsentView, DatabaseError>;

    async fn get_request(&self, id: Uuid) -> Result<Option<SmsRequest>, DatabaseError>;

    /// Overwrite a request's status unconditionally. `None` if the id is unknown.
    async fn set_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
    ) -> Result<Option<SmsRequest>, DatabaseError>;

    /// Apply compare-and-set transitions in a single transaction.
    /// Returns how many rows actually changed.
    async fn apply_transitions(
        &self,
        transitions: &[StatusTransition],
    ) -> Result<usize, DatabaseError>;

    /// Oldest request (by creation time) currently in `status`.
    async fn earliest_request_with_status(
        &self,
        status: RequestStatus,
    ) -> Result<Option<SmsRequest>, DatabaseError>;

    /// Requests in one of `statuses` where `optin_id` is either party,
    /// joined with both parties' current consent status.
    async fn list_requests_for_optin(
        &self,
        optin_id: Uuid,
        statuses: &[RequestStatus],
    ) -> Result<Vec<ConsentView>, DatabaseError>;
}
