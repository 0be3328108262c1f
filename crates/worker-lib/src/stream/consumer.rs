//! Stream consumer loop
//!
//! Polls the input stream, runs each job through the processor and
//! publishes the result. Every per-entry failure is contained at that entry;
//! only transport failures on the input side pause the loop, with
//! exponential backoff.

use super::codec::decode_job;
use super::publisher::ResultPublisher;
use super::{EntryId, StreamEntry, StreamTransport};
use crate::errors::{TransportError, WorkerError};
use crate::health::{components, HealthRegistry};
use crate::models::JobResult;
use crate::observability::{StructuredLogger, WorkerMetrics};
use crate::processor::{JobOutcome, JobProcessor};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Consumer configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub input_stream: String,
    /// Entry field holding the JSON job
    pub payload_field: String,
    /// Entries requested per poll
    pub batch_size: usize,
    /// How long one poll may wait for new entries
    pub block_timeout: Duration,
    /// First sleep after a transport failure
    pub backoff_initial: Duration,
    /// Upper bound of the transport backoff
    pub backoff_max: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            input_stream: "ml_input".to_string(),
            payload_field: "data".to_string(),
            batch_size: 50,
            block_timeout: Duration::from_secs(5),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

/// Counters for one consumer run
#[derive(Debug, Default, Clone)]
pub struct ConsumerStats {
    pub entries_received: u64,
    pub jobs_published: u64,
    pub decode_errors: u64,
    pub processing_errors: u64,
    pub publish_errors: u64,
    pub transport_errors: u64,
    /// Id of the last entry taken off the stream, whatever its outcome
    pub cursor: Option<EntryId>,
    pub last_error: Option<String>,
}

/// Exponential backoff with up to 10% jitter
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        self.failures += 1;
        let jitter = rand::thread_rng().gen_range(0.0..=0.1);
        base + base.mul_f64(jitter)
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// Consecutive failures since the last reset
    fn failures(&self) -> u32 {
        self.failures
    }
}

/// Builder for [`StreamConsumer`]
pub struct StreamConsumerBuilder {
    config: ConsumerConfig,
    transport: Option<Arc<dyn StreamTransport>>,
    processor: Option<Arc<JobProcessor>>,
    publisher: Option<ResultPublisher>,
    health: Option<HealthRegistry>,
    metrics: Option<WorkerMetrics>,
    logger: Option<StructuredLogger>,
}

impl StreamConsumerBuilder {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            transport: None,
            processor: None,
            publisher: None,
            health: None,
            metrics: None,
            logger: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn StreamTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn processor(mut self, processor: Arc<JobProcessor>) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn publisher(mut self, publisher: ResultPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn metrics(mut self, metrics: WorkerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn build(self) -> anyhow::Result<StreamConsumer> {
        let transport = self
            .transport
            .ok_or_else(|| anyhow::anyhow!("stream transport is required"))?;
        let processor = self
            .processor
            .ok_or_else(|| anyhow::anyhow!("job processor is required"))?;
        let publisher = self
            .publisher
            .ok_or_else(|| anyhow::anyhow!("result publisher is required"))?;
        if self.config.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }

        let backoff = Backoff::new(self.config.backoff_initial, self.config.backoff_max);
        Ok(StreamConsumer {
            config: self.config,
            transport,
            processor,
            publisher,
            health: self.health.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
            logger: self
                .logger
                .unwrap_or_else(|| StructuredLogger::new("anomaly-worker")),
            backoff,
            cursor: None,
            stats: Arc::new(RwLock::new(ConsumerStats::default())),
        })
    }
}

enum Poll {
    Batch(Vec<StreamEntry>),
    Failed(TransportError),
}

/// Long-running consumer of the input stream
pub struct StreamConsumer {
    config: ConsumerConfig,
    transport: Arc<dyn StreamTransport>,
    processor: Arc<JobProcessor>,
    publisher: ResultPublisher,
    health: HealthRegistry,
    metrics: WorkerMetrics,
    logger: StructuredLogger,
    backoff: Backoff,
    /// `None` until the starting position has been resolved
    cursor: Option<EntryId>,
    stats: Arc<RwLock<ConsumerStats>>,
}

impl StreamConsumer {
    pub fn builder(config: ConsumerConfig) -> StreamConsumerBuilder {
        StreamConsumerBuilder::new(config)
    }

    /// Shared handle to the run's counters
    pub fn stats_handle(&self) -> Arc<RwLock<ConsumerStats>> {
        Arc::clone(&self.stats)
    }

    /// Run until `shutdown` fires or its sender is dropped
    ///
    /// The signal is honored between entries and while waiting on a poll or
    /// a backoff sleep; an entry already being processed always completes.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> ConsumerStats {
        self.health.register(components::CONSUMER).await;
        self.health.register(components::DETECTOR).await;
        self.health.register(components::MODEL_STORE).await;
        self.health.register(components::PUBLISHER).await;

        info!(
            input_stream = %self.config.input_stream,
            batch_size = self.config.batch_size,
            "Stream consumer started"
        );

        let reason = loop {
            if shutdown_requested(&mut shutdown) {
                break "shutdown signal";
            }

            let poll = tokio::select! {
                _ = shutdown.recv() => break "shutdown signal",
                poll = self.poll() => poll,
            };

            match poll {
                Poll::Batch(entries) => {
                    self.on_poll_success().await;
                    let mut interrupted = false;
                    for entry in entries {
                        self.handle_entry(entry).await;
                        if shutdown_requested(&mut shutdown) {
                            interrupted = true;
                            break;
                        }
                    }
                    if interrupted {
                        break "shutdown signal";
                    }
                }
                Poll::Failed(e) => {
                    let delay = self.on_poll_failure(e).await;
                    tokio::select! {
                        _ = shutdown.recv() => break "shutdown signal",
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        self.logger.log_shutdown(reason);
        self.health.set_ready(false).await;
        let stats = self.stats.read().await.clone();
        info!(
            entries = stats.entries_received,
            published = stats.jobs_published,
            cursor = ?stats.cursor.map(|c| c.to_string()),
            "Stream consumer stopped"
        );
        stats
    }

    /// Resolve the starting position if needed, then read one batch
    async fn poll(&mut self) -> Poll {
        let after = match self.cursor {
            Some(cursor) => cursor,
            None => match self.transport.tail(&self.config.input_stream).await {
                Ok(tail) => {
                    self.pin_start(tail).await;
                    tail
                }
                Err(e) => return Poll::Failed(e),
            },
        };

        match self
            .transport
            .read(
                &self.config.input_stream,
                after,
                self.config.batch_size,
                self.config.block_timeout,
            )
            .await
        {
            Ok(entries) => Poll::Batch(entries),
            Err(e) => Poll::Failed(e),
        }
    }

    /// The tail is resolved once; later polls (failed or timed out) resume from it
    async fn pin_start(&mut self, start: EntryId) {
        self.cursor = Some(start);
        self.stats.write().await.cursor = Some(start);
        self.health.set_ready(true).await;
        info!(start = %start, "Resolved starting position");
    }

    async fn on_poll_success(&mut self) {
        if self.backoff.failures() > 0 {
            self.backoff.reset();
            self.logger.log_transport_status(true, None);
            self.health.set_healthy(components::CONSUMER).await;
        }
    }

    async fn on_poll_failure(&mut self, e: TransportError) -> Duration {
        let delay = self.backoff.next_delay();
        error!(
            error = %e,
            retry_in_ms = delay.as_millis() as u64,
            "Failed to poll input stream"
        );
        self.logger.log_transport_status(false, Some(delay));
        self.metrics.inc_transport_errors();
        self.health
            .set_degraded(components::CONSUMER, format!("input stream: {}", e))
            .await;

        let mut stats = self.stats.write().await;
        stats.transport_errors += 1;
        stats.last_error = Some(e.to_string());
        delay
    }

    async fn handle_entry(&mut self, entry: StreamEntry) {
        // Progress is recorded before processing so a failing entry is never re-read
        self.cursor = Some(entry.id);
        self.metrics.inc_entries_received();
        self.metrics.set_cursor(entry.id.ms);
        {
            let mut stats = self.stats.write().await;
            stats.entries_received += 1;
            stats.cursor = Some(entry.id);
        }

        let entry_id = entry.id.to_string();
        let started = Instant::now();

        match self.process_entry(&entry).await {
            Ok(result) => {
                let elapsed = started.elapsed();
                self.metrics.observe_job_latency(elapsed);
                self.metrics.inc_jobs_published();
                self.logger.log_job_completed(&entry_id, &result, elapsed);
                self.stats.write().await.jobs_published += 1;
            }
            Err(e) => {
                error!(entry_id = %entry_id, error = %e, "Failed to handle stream entry");
                let mut stats = self.stats.write().await;
                match &e {
                    WorkerError::Decode(_) => {
                        self.metrics.inc_decode_errors();
                        stats.decode_errors += 1;
                    }
                    WorkerError::Processing(_) => {
                        self.metrics.inc_processing_errors();
                        stats.processing_errors += 1;
                    }
                    WorkerError::Publish(_) => {
                        self.metrics.inc_publish_errors();
                        stats.publish_errors += 1;
                    }
                }
                stats.last_error = Some(e.to_string());
            }
        }
    }

    async fn process_entry(&self, entry: &StreamEntry) -> Result<JobResult, WorkerError> {
        let payload = entry.field(&self.config.payload_field).ok_or_else(|| {
            crate::errors::DecodeError::MissingField(self.config.payload_field.clone())
        })?;
        let job = decode_job(payload)?;
        debug!(
            entry_id = %entry.id,
            job_id = %job.job_id,
            samples = job.samples.len(),
            "Decoded job"
        );

        let processor = Arc::clone(&self.processor);
        let outcome: JobOutcome = tokio::task::spawn_blocking(move || processor.process(&job))
            .await
            .map_err(|e| WorkerError::Processing(e.to_string()))?;
        self.report_outcome(&outcome).await;

        match self.publisher.publish(&outcome.result).await {
            Ok(_) => {
                self.health.set_healthy(components::PUBLISHER).await;
                Ok(outcome.result)
            }
            Err(e) => {
                self.health
                    .set_degraded(components::PUBLISHER, e.to_string())
                    .await;
                Err(e.into())
            }
        }
    }

    async fn report_outcome(&self, outcome: &JobOutcome) {
        if outcome.failed_metrics.is_empty() {
            self.health.set_healthy(components::DETECTOR).await;
        } else {
            let names: Vec<&str> = outcome.failed_metrics.iter().map(|m| m.as_str()).collect();
            self.health
                .set_degraded(
                    components::DETECTOR,
                    format!("detection failed for {}", names.join(", ")),
                )
                .await;
        }

        if outcome.failed_saves == 0 {
            if !outcome.result.metrics_processed.is_empty() {
                self.health.set_healthy(components::MODEL_STORE).await;
            }
        } else {
            warn!(
                job_id = %outcome.result.job_id,
                failed = outcome.failed_saves,
                "Some model artifacts were not saved"
            );
            self.health
                .set_degraded(
                    components::MODEL_STORE,
                    format!("{} artifact writes failed", outcome.failed_saves),
                )
                .await;
        }
    }
}

fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) | Err(TryRecvError::Closed) | Err(TryRecvError::Lagged(_)) => true,
        Err(TryRecvError::Empty) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(110));
        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(200) && second <= Duration::from_millis(220));
        let third = backoff.next_delay();
        assert!(third >= Duration::from_millis(350) && third <= Duration::from_millis(385));
        let fourth = backoff.next_delay();
        assert!(fourth <= Duration::from_millis(385));

        assert_eq!(backoff.failures(), 4);
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        let again = backoff.next_delay();
        assert!(again <= Duration::from_millis(110));
    }

    #[test]
    fn test_shutdown_requested_on_closed_sender() {
        let (tx, mut rx) = broadcast::channel::<()>(1);
        assert!(!shutdown_requested(&mut rx));
        drop(tx);
        assert!(shutdown_requested(&mut rx));
    }
}
