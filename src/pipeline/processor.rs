//! Bounded moderation pipeline.
//!
//! Each submission becomes one task that waits for a concurrency slot,
//! makes a single moderation call under a timeout, releases the slot and
//! emits exactly one [`FilterResult`]. Results fan in to one channel that a
//! single consumer drains.
//!
//! Shutdown closes the intake, waits until every outstanding submission has
//! emitted its result, then lets the channel close so the consumer can drain
//! and exit.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::FilterConfig;
use crate::error::{Error, FilterError};
use crate::pipeline::client::ModerationClient;
use crate::pipeline::types::FilterResult;

pub struct FilterPipeline {
    client: Arc<dyn ModerationClient>,
    permits: Arc<Semaphore>,
    timeout: Duration,
    /// `None` once shutdown has begun.
    results_tx: Mutex<Option<mpsc::Sender<FilterResult>>>,
    outstanding: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl FilterPipeline {
    /// Build the pipeline and the receiving end of its result channel.
    pub fn new(
        client: Arc<dyn ModerationClient>,
        config: &FilterConfig,
    ) -> (Self, mpsc::Receiver<FilterResult>) {
        let (tx, rx) = mpsc::channel(config.result_buffer_size.max(1));
        let pipeline = Self {
            client,
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            timeout: config.timeout,
            results_tx: Mutex::new(Some(tx)),
            outstanding: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };
        (pipeline, rx)
    }

    /// Submissions that have not yet emitted their result.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub async fn is_closed(&self) -> bool {
        self.results_tx.lock().await.is_none()
    }

    /// Queue `message` for moderation. Returns immediately; the call
    /// itself waits for a free slot in the background.
    pub async fn submit(&self, request_id: Uuid, message: String) -> Result<(), Error> {
        let tx = {
            let guard = self.results_tx.lock().await;
            let Some(tx) = guard.as_ref() else {
                return Err(Error::PipelineClosed);
            };
            // Counted under the lock so shutdown never misses a submission.
            self.outstanding.fetch_add(1, Ordering::SeqCst);
            tx.clone()
        };

        let client = Arc::clone(&self.client);
        let permits = Arc::clone(&self.permits);
        let outstanding = Arc::clone(&self.outstanding);
        let idle = Arc::clone(&self.idle);
        let timeout = self.timeout;

        debug!(request_id = %request_id, "Submitted message for moderation");

        tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(permit) => {
                    let outcome =
                        match tokio::time::timeout(timeout, client.classify(&message)).await {
                            Ok(outcome) => outcome,
                            Err(_) => Err(FilterError::Timeout(timeout)),
                        };
                    drop(permit);
                    outcome
                }
                Err(_) => Err(FilterError::Transport(
                    "moderation slots are no longer available".into(),
                )),
            };

            if tx
                .send(FilterResult {
                    request_id,
                    outcome,
                })
                .await
                .is_err()
            {
                warn!(request_id = %request_id, "Result consumer is gone, dropping filter result");
            }
            drop(tx);

            if outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
                idle.notify_waiters();
            }
        });

        Ok(())
    }

    /// Stop accepting submissions and wait for all outstanding ones to
    /// emit their result. Idempotent.
    pub async fn shutdown(&self) {
        let closed = self.results_tx.lock().await.take();
        if closed.is_some() {
            info!(outstanding = self.outstanding(), "Filter pipeline shutting down");
        }
        drop(closed);

        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.outstanding() == 0 {
                break;
            }
            notified.await;
        }
        debug!("Filter pipeline drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::ModerationVerdict;
    use async_trait::async_trait;

    /// Client that records how many calls overlap.
    struct SlowClient {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SlowClient {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ModerationClient for SlowClient {
        async fn classify(&self, message: &str) -> Result<ModerationVerdict, FilterError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(ModerationVerdict {
                blocked: message.contains("spam"),
                ..Default::default()
            })
        }
    }

    fn config(max_concurrent: usize, timeout: Duration) -> FilterConfig {
        FilterConfig {
            max_concurrent,
            result_buffer_size: 2,
            timeout,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let client = Arc::new(SlowClient::new(Duration::from_millis(20)));
        let (pipeline, mut rx) =
            FilterPipeline::new(client.clone(), &config(3, Duration::from_secs(5)));

        for i in 0..12 {
            pipeline.submit(Uuid::new_v4(), format!("msg {i}")).await.unwrap();
        }

        let mut received = 0;
        while received < 12 {
            let result = rx.recv().await.unwrap();
            assert!(result.outcome.is_ok());
            received += 1;
        }

        assert!(client.peak.load(Ordering::SeqCst) <= 3);
        assert!(client.peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn one_result_per_submission() {
        let client = Arc::new(SlowClient::new(Duration::from_millis(1)));
        let roomy = FilterConfig {
            result_buffer_size: 8,
            ..config(2, Duration::from_secs(5))
        };
        let (pipeline, mut rx) = FilterPipeline::new(client, &roomy);

        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            pipeline.submit(*id, "hello".into()).await.unwrap();
        }
        pipeline.shutdown().await;
        assert_eq!(pipeline.outstanding(), 0);

        let mut seen = Vec::new();
        while let Some(result) = rx.recv().await {
            seen.push(result.request_id);
        }
        seen.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let client = Arc::new(SlowClient::new(Duration::from_secs(10)));
        let (pipeline, mut rx) =
            FilterPipeline::new(client, &config(1, Duration::from_millis(50)));

        pipeline.submit(Uuid::new_v4(), "hello".into()).await.unwrap();
        let result = rx.recv().await.unwrap();
        assert!(matches!(result.outcome, Err(FilterError::Timeout(_))));
    }

    #[tokio::test]
    async fn rejects_after_shutdown() {
        let client = Arc::new(SlowClient::new(Duration::from_millis(1)));
        let (pipeline, mut rx) = FilterPipeline::new(client, &config(1, Duration::from_secs(5)));

        pipeline.shutdown().await;
        assert!(pipeline.is_closed().await);
        assert!(matches!(
            pipeline.submit(Uuid::new_v4(), "late".into()).await,
            Err(Error::PipelineClosed)
        ));
        assert!(rx.recv().await.is_none());

        // Second shutdown is a no-op.
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_calls() {
        let client = Arc::new(SlowClient::new(Duration::from_millis(50)));
        let (pipeline, mut rx) = FilterPipeline::new(client, &config(1, Duration::from_secs(5)));

        for _ in 0..3 {
            pipeline.submit(Uuid::new_v4(), "hello".into()).await.unwrap();
        }
        assert!(pipeline.outstanding() > 0);

        // Drain concurrently; the buffer is smaller than the submission count.
        let drain = tokio::spawn(async move {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        });

        pipeline.shutdown().await;
        assert_eq!(pipeline.outstanding(), 0);
        assert_eq!(drain.await.unwrap(), 3);
    }
}
