//! Consent ledger: lookup, find-or-create and codeword-gated toggling of
//! opt-in records. All operations take raw phone input and canonicalize it.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consent::model::{OptIn, OptInStatus};
use crate::error::{DatabaseError, Error, Result};
use crate::phone;
use crate::store::Database;

/// Compare-and-set attempts before a toggle gives up with `Conflict`.
const TOGGLE_ATTEMPTS: usize = 3;

/// Result of a toggle attempt.
#[derive(Debug, Clone)]
pub struct ToggleOutcome {
    /// The opt-in as stored after the call.
    pub optin: OptIn,
    /// Status before the call.
    pub previous: OptInStatus,
    /// Whether the reply carried the codeword.
    pub matched: bool,
}

impl ToggleOutcome {
    pub fn changed(&self) -> bool {
        self.optin.status != self.previous
    }
}

pub struct ConsentLedger {
    store: Arc<dyn Database>,
}

impl ConsentLedger {
    pub fn new(store: Arc<dyn Database>) -> Self {
        Self { store }
    }

    /// Return the opt-in for `number`, creating one in `Ask` if none exists.
    ///
    /// Creation relies on the unique key on `number`: a losing concurrent
    /// insert re-reads the winner's record instead of failing.
    pub async fn find_or_create(&self, number: &str) -> Result<OptIn> {
        let canonical = phone::canonicalize(number)?;

        if let Some(existing) = self.store.get_optin_by_number(&canonical).await? {
            return Ok(existing);
        }

        let optin = OptIn::new(canonical.clone())?;
        match self.store.insert_optin(&optin).await {
            Ok(()) => {
                info!(optin_id = %optin.id, number = %optin.number, "Opt-in created");
                Ok(optin)
            }
            Err(DatabaseError::Constraint(msg)) => {
                debug!(number = %canonical, "Opt-in created concurrently, re-reading");
                self.store
                    .get_optin_by_number(&canonical)
                    .await?
                    .ok_or(Error::Conflict(msg))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, number: &str) -> Result<OptIn> {
        let canonical = phone::canonicalize(number)?;
        self.store
            .get_optin_by_number(&canonical)
            .await?
            .ok_or_else(|| Error::not_found("optin", canonical))
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<OptIn> {
        self.store
            .get_optin(id)
            .await?
            .ok_or_else(|| Error::not_found("optin", id))
    }

    /// Flip consent for `number` if `reply` contains its codeword.
    ///
    /// `True` becomes `False`; `False`, `Ask` and `Asked` become `True`.
    /// A reply without the codeword leaves the record untouched. Every
    /// matching reply toggles once, so the same codeword sent twice
    /// toggles twice.
    pub async fn toggle(&self, number: &str, reply: &str) -> Result<ToggleOutcome> {
        for attempt in 1..=TOGGLE_ATTEMPTS {
            let current = self.get(number).await?;
            let previous = current.status;

            if !current.matches_codeword(reply) {
                info!(optin_id = %current.id, "Reply did not contain codeword, consent unchanged");
                return Ok(ToggleOutcome {
                    optin: current,
                    previous,
                    matched: false,
                });
            }

            let target = previous.toggled();
            match self
                .store
                .transition_optin_status(current.id, previous, target)
                .await?
            {
                Some(updated) => {
                    info!(
                        optin_id = %updated.id,
                        from = %previous,
                        to = %target,
                        "Consent toggled"
                    );
                    return Ok(ToggleOutcome {
                        optin: updated,
                        previous,
                        matched: true,
                    });
                }
                None => {
                    debug!(optin_id = %current.id, attempt, "Consent changed during toggle, retrying");
                }
            }
        }

        warn!(number, "Consent toggle kept losing to concurrent updates");
        Err(Error::Conflict(format!(
            "opt-in for {number} changed concurrently {TOGGLE_ATTEMPTS} times"
        )))
    }

    /// Record that the opt-in question was sent: `Ask` becomes `Asked`.
    /// Any other status is returned as is.
    pub async fn mark_asked(&self, number: &str) -> Result<OptIn> {
        let current = self.get(number).await?;
        if current.status != OptInStatus::Ask {
            return Ok(current);
        }

        match self
            .store
            .transition_optin_status(current.id, OptInStatus::Ask, OptInStatus::Asked)
            .await?
        {
            Some(updated) => {
                info!(optin_id = %updated.id, "Opt-in question marked as sent");
                Ok(updated)
            }
            None => self.get_by_id(current.id).await,
        }
    }

    /// Oldest opt-in that still needs the question sent.
    pub async fn earliest_to_ask(&self) -> Result<OptIn> {
        self.store
            .earliest_optin_with_status(OptInStatus::Ask)
            .await?
            .ok_or_else(|| Error::not_found("optin", "status ask"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;

    async fn test_ledger() -> ConsentLedger {
        let db = LibSqlBackend::new_memory().await.unwrap();
        ConsentLedger::new(Arc::new(db))
    }

    #[tokio::test]
    async fn find_or_create_is_stable_across_formats() {
        let ledger = test_ledger().await;
        let first = ledger.find_or_create("555-123-4567").await.unwrap();
        let second = ledger.find_or_create("(555) 123 4567").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.codeword, second.codeword);
        assert_eq!(first.number, "(555)-123-4567");
        assert_eq!(first.status, OptInStatus::Ask);
    }

    #[tokio::test]
    async fn concurrent_find_or_create_yields_one_record() {
        let ledger = Arc::new(test_ledger().await);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.find_or_create("555-123-4567").await })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn rejects_malformed_numbers() {
        let ledger = test_ledger().await;
        for bad in ["", "12345", "555-1234-567", "abc-def-ghij"] {
            assert!(matches!(
                ledger.find_or_create(bad).await,
                Err(Error::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn get_unknown_is_not_found() {
        let ledger = test_ledger().await;
        assert!(matches!(
            ledger.get("555-123-4567").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            ledger.get_by_id(Uuid::new_v4()).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn toggle_with_codeword_opts_in() {
        let ledger = test_ledger().await;
        let optin = ledger.find_or_create("555-123-4567").await.unwrap();
        let reply = format!("sure, {}!", optin.codeword.to_lowercase());

        let outcome = ledger.toggle("555-123-4567", &reply).await.unwrap();
        assert!(outcome.matched);
        assert!(outcome.changed());
        assert_eq!(outcome.previous, OptInStatus::Ask);
        assert_eq!(outcome.optin.status, OptInStatus::True);
    }

    #[tokio::test]
    async fn toggle_without_codeword_is_noop() {
        let ledger = test_ledger().await;
        ledger.find_or_create("555-123-4567").await.unwrap();

        let outcome = ledger.toggle("555-123-4567", "yes please").await.unwrap();
        assert!(!outcome.matched);
        assert!(!outcome.changed());
        assert_eq!(
            ledger.get("555-123-4567").await.unwrap().status,
            OptInStatus::Ask
        );
    }

    #[tokio::test]
    async fn same_codeword_twice_toggles_twice() {
        let ledger = test_ledger().await;
        let optin = ledger.find_or_create("555-123-4567").await.unwrap();

        let first = ledger.toggle("555-123-4567", &optin.codeword).await.unwrap();
        let second = ledger.toggle("555-123-4567", &optin.codeword).await.unwrap();
        assert_eq!(first.optin.status, OptInStatus::True);
        assert_eq!(second.optin.status, OptInStatus::False);

        let third = ledger.toggle("555-123-4567", &optin.codeword).await.unwrap();
        assert_eq!(third.optin.status, OptInStatus::True);
    }

    #[tokio::test]
    async fn concurrent_toggles_are_not_lost() {
        let ledger = Arc::new(test_ledger().await);
        let optin = ledger.find_or_create("555-123-4567").await.unwrap();

        let (a, b) = tokio::join!(
            ledger.toggle("555-123-4567", &optin.codeword),
            ledger.toggle("555-123-4567", &optin.codeword),
        );
        a.unwrap();
        b.unwrap();

        // Ask -> True -> False
        assert_eq!(
            ledger.get("555-123-4567").await.unwrap().status,
            OptInStatus::False
        );
    }

    #[tokio::test]
    async fn asked_toggles_to_true() {
        let ledger = test_ledger().await;
        let optin = ledger.find_or_create("555-123-4567").await.unwrap();
        ledger.mark_asked("555-123-4567").await.unwrap();

        let outcome = ledger.toggle("555-123-4567", &optin.codeword).await.unwrap();
        assert_eq!(outcome.previous, OptInStatus::Asked);
        assert_eq!(outcome.optin.status, OptInStatus::True);
    }

    #[tokio::test]
    async fn mark_asked_only_moves_ask() {
        let ledger = test_ledger().await;
        let optin = ledger.find_or_create("555-123-4567").await.unwrap();

        let asked = ledger.mark_asked("555-123-4567").await.unwrap();
        assert_eq!(asked.status, OptInStatus::Asked);
        let again = ledger.mark_asked("555-123-4567").await.unwrap();
        assert_eq!(again.status, OptInStatus::Asked);

        ledger.toggle("555-123-4567", &optin.codeword).await.unwrap();
        let opted_in = ledger.mark_asked("555-123-4567").await.unwrap();
        assert_eq!(opted_in.status, OptInStatus::True);
    }

    #[tokio::test]
    async fn earliest_to_ask_skips_asked() {
        let ledger = test_ledger().await;
        assert!(matches!(
            ledger.earliest_to_ask().await,
            Err(Error::NotFound { .. })
        ));

        ledger.find_or_create("555-000-0001").await.unwrap();
        let second = ledger.find_or_create("555-000-0002").await.unwrap();
        assert_eq!(
            ledger.earliest_to_ask().await.unwrap().number,
            "(555)-000-0001"
        );

        ledger.mark_asked("555-000-0001").await.unwrap();
        assert_eq!(ledger.earliest_to_ask().await.unwrap().id, second.id);
    }
}
