//! Broker facade: wires the consent ledger, request lifecycle, cascade
//! reconciler and moderation pipeline behind one handle.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::config::FilterConfig;
use crate::consent::{ConsentLedger, OptIn, ToggleOutcome};
use crate::error::Result;
use crate::pipeline::{
    FilterPipeline, FilterResult, HttpModerationClient, ModerationClient, spawn_result_consumer,
};
use crate::requests::{CascadeReconciler, RequestLifecycle, RequestStatus, SmsRequest};
use crate::store::Database;

pub struct Broker {
    ledger: Arc<ConsentLedger>,
    lifecycle: RequestLifecycle,
    reconciler: CascadeReconciler,
    pipeline: Arc<FilterPipeline>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    /// Assemble a broker around an existing pipeline and spawn the single
    /// consumer for its results. Must be called inside a Tokio runtime.
    pub fn new(
        store: Arc<dyn Database>,
        pipeline: FilterPipeline,
        results: mpsc::Receiver<FilterResult>,
    ) -> Self {
        let pipeline = Arc::new(pipeline);
        let ledger = Arc::new(ConsentLedger::new(Arc::clone(&store)));
        let consumer = spawn_result_consumer(results, Arc::clone(&store));

        Self {
            lifecycle: RequestLifecycle::new(
                Arc::clone(&store),
                Arc::clone(&ledger),
                Arc::clone(&pipeline),
            ),
            reconciler: CascadeReconciler::new(store),
            ledger,
            pipeline,
            consumer: Mutex::new(Some(consumer)),
        }
    }

    /// Broker using `client` for moderation.
    pub fn with_client(
        store: Arc<dyn Database>,
        client: Arc<dyn ModerationClient>,
        config: &FilterConfig,
    ) -> Self {
        let (pipeline, results) = FilterPipeline::new(client, config);
        Self::new(store, pipeline, results)
    }

    /// Broker calling the HTTP moderation endpoint from `config`.
    pub fn from_config(store: Arc<dyn Database>, config: &FilterConfig) -> Self {
        let client = Arc::new(HttpModerationClient::new(config.api_url.clone()));
        Self::with_client(store, client, config)
    }

    // ── Requests ────────────────────────────────────────────────────

    pub async fn create_request(
        &self,
        from_number: &str,
        to_number: &str,
        message: &str,
    ) -> Result<SmsRequest> {
        self.lifecycle.create(from_number, to_number, message).await
    }

    pub async fn get_request(&self, id: Uuid) -> Result<SmsRequest> {
        self.lifecycle.get(id).await
    }

    pub async fn update_request_status(
        &self,
        id: Uuid,
        status: RequestStatus,
    ) -> Result<SmsRequest> {
        self.lifecycle.update_status(id, status).await
    }

    pub async fn earliest_ready_to_send(&self) -> Result<SmsRequest> {
        self.lifecycle.earliest_ready_to_send().await
    }

    // ── Consent ─────────────────────────────────────────────────────

    /// Apply a codeword reply and cascade the change to pending requests.
    pub async fn toggle_consent(&self, number: &str, reply: &str) -> Result<ToggleOutcome> {
        let outcome = self.ledger.toggle(number, reply).await?;
        if outcome.changed() {
            self.reconciler.reconcile(&outcome.optin).await?;
        }
        Ok(outcome)
    }

    pub async fn get_optin(&self, number: &str) -> Result<OptIn> {
        self.ledger.get(number).await
    }

    pub async fn mark_asked(&self, number: &str) -> Result<OptIn> {
        self.ledger.mark_asked(number).await
    }

    pub async fn earliest_to_ask(&self) -> Result<OptIn> {
        self.ledger.earliest_to_ask().await
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn outstanding_filters(&self) -> usize {
        self.pipeline.outstanding()
    }

    /// Stop intake, wait for in-flight moderation, then let the consumer
    /// drain every remaining result.
    pub async fn shutdown(&self) {
        self.pipeline.shutdown().await;

        let consumer = self.consumer.lock().await.take();
        if let Some(handle) = consumer {
            if let Err(e) = handle.await {
                error!(error = %e, "Filter result consumer panicked");
            }
            info!("Broker shut down");
        }
    }
}
