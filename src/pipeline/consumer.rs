//! Single sequential consumer applying filter results to stored requests.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::FilterResult;
use crate::store::Database;

/// Drain `rx` until every sender is gone, applying results in arrival order.
pub fn spawn_result_consumer(
    mut rx: mpsc::Receiver<FilterResult>,
    store: Arc<dyn Database>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            if let Err(e) = apply_result(store.as_ref(), &result).await {
                error!(
                    request_id = %result.request_id,
                    error = %e,
                    "Failed to record filter result"
                );
            }
        }
        info!("Filter result channel closed, consumer exiting");
    })
}

/// Apply one result. Returns whether the stored status changed.
pub async fn apply_result(
    store: &dyn Database,
    result: &FilterResult,
) -> Result<bool, DatabaseError> {
    match &result.outcome {
        Ok(verdict) if verdict.blocked => {
            info!(
                request_id = %result.request_id,
                reason = %verdict.reason,
                categories = ?verdict.included_categories,
                "Message blocked by moderation"
            );
        }
        Ok(_) => {
            debug!(request_id = %result.request_id, "Message passed moderation");
        }
        Err(e) => {
            warn!(request_id = %result.request_id, error = %e, "Moderation failed");
        }
    }

    let transition = result.transition();
    let to = transition.to;
    let changed = store.apply_transitions(&[transition]).await? > 0;
    if changed {
        info!(request_id = %result.request_id, status = %to, "Filter result applied");
    } else {
        debug!(
            request_id = %result.request_id,
            "Request no longer pending, filter result ignored"
        );
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::consent::model::{OptIn, OptInStatus};
    use crate::error::FilterError;
    use crate::pipeline::types::ModerationVerdict;
    use crate::requests::model::{RequestStatus, SmsRequest};
    use crate::store::LibSqlBackend;

    async fn seeded(status: RequestStatus) -> (Arc<dyn Database>, Uuid) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let mut a = OptIn::new("(555)-000-0001").unwrap();
        let mut b = OptIn::new("(555)-000-0002").unwrap();
        a.status = OptInStatus::True;
        b.status = OptInStatus::True;
        db.insert_optin(&a).await.unwrap();
        db.insert_optin(&b).await.unwrap();

        let request = SmsRequest {
            id: Uuid::new_v4(),
            from_number: a.number.clone(),
            to_number: b.number.clone(),
            from_optin_id: a.id,
            to_optin_id: b.id,
            status,
            message: "hi".into(),
            created: Utc::now(),
        };
        db.insert_request(&request).await.unwrap();
        (db, request.id)
    }

    fn verdict(blocked: bool) -> Result<ModerationVerdict, FilterError> {
        Ok(ModerationVerdict {
            blocked,
            ..Default::default()
        })
    }

    async fn status_after(
        initial: RequestStatus,
        outcome: Result<ModerationVerdict, FilterError>,
    ) -> RequestStatus {
        let (db, id) = seeded(initial).await;
        apply_result(
            db.as_ref(),
            &FilterResult {
                request_id: id,
                outcome,
            },
        )
        .await
        .unwrap();
        db.get_request(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn blocked_verdict_blocks() {
        assert_eq!(
            status_after(RequestStatus::ReadyToSend, verdict(true)).await,
            RequestStatus::Blocked
        );
        assert_eq!(
            status_after(RequestStatus::VerifyCheck, verdict(true)).await,
            RequestStatus::Blocked
        );
    }

    #[tokio::test]
    async fn upstream_failure_is_error() {
        let failure = Err(FilterError::Transport("connection refused".into()));
        assert_eq!(
            status_after(RequestStatus::ReadyToSend, failure).await,
            RequestStatus::Error
        );
    }

    #[tokio::test]
    async fn pass_readies_pending_request() {
        assert_eq!(
            status_after(RequestStatus::VerifyCheck, verdict(false)).await,
            RequestStatus::ReadyToSend
        );
        assert_eq!(
            status_after(RequestStatus::ReadyToSend, verdict(false)).await,
            RequestStatus::ReadyToSend
        );
    }

    #[tokio::test]
    async fn late_result_never_overwrites_settled_status() {
        for settled in [
            RequestStatus::Sent,
            RequestStatus::Taken,
            RequestStatus::Blocked,
            RequestStatus::Error,
        ] {
            assert_eq!(status_after(settled, verdict(true)).await, settled);
            assert_eq!(
                status_after(settled, Err(FilterError::Status { status: 503 })).await,
                settled
            );
            assert_eq!(status_after(settled, verdict(false)).await, settled);
        }
    }

    #[tokio::test]
    async fn consumer_exits_when_channel_closes() {
        let (db, id) = seeded(RequestStatus::ReadyToSend).await;
        let (tx, rx) = mpsc::channel(4);
        let handle = spawn_result_consumer(rx, Arc::clone(&db));

        tx.send(FilterResult {
            request_id: id,
            outcome: verdict(true),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(
            db.get_request(id).await.unwrap().unwrap().status,
            RequestStatus::Blocked
        );
    }

    #[tokio::test]
    async fn unknown_request_is_ignored() {
        let (db, _) = seeded(RequestStatus::ReadyToSend).await;
        let changed = apply_result(
            db.as_ref(),
            &FilterResult {
                request_id: Uuid::new_v4(),
                outcome: verdict(true),
            },
        )
        .await
        .unwrap();
        assert!(!changed);
    }
}
