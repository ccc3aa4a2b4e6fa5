use cropscan_core::{Config, FailureKind, JobEvent, JobFailure, RetryBackoff};
use cropscan_db::{JobStore, JobStoreError};
use cropscan_queue::{BrokerError, ConsumedMessage, DeliveryReceipt, NackDisposition, QueueConsumer};
use cropscan_storage::ObjectStore;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::vision::{VisionRequest, VisionService};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub concurrency: usize,
    /// Processing attempts before a job fails permanently.
    pub max_retries: i32,
    pub vision_timeout: Duration,
    pub retry_backoff: RetryBackoff,
    /// How often an in-flight job is re-read for a cancel request.
    pub cancel_poll_interval: Duration,
    /// Lease length requested on each heartbeat. Matches the broker's
    /// visibility timeout; heartbeats fire at a third of it.
    pub lease_duration: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            vision_timeout: Duration::from_secs(120),
            retry_backoff: RetryBackoff::default(),
            cancel_poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for WorkerConfig {
    fn from(config: &Config) -> Self {
        Self {
            concurrency: config.worker_concurrency,
            max_retries: config.max_retries,
            vision_timeout: config.vision_timeout,
            retry_backoff: RetryBackoff::new(config.retry_backoff_base, config.retry_backoff_max),
            lease_duration: config.visibility_timeout,
            ..Self::default()
        }
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Cancelled,
    RetryScheduled,
    FailedPermanently,
    /// Job already terminal or held by another worker; acked untouched.
    Duplicate,
    /// No job record; the message was acked and dropped.
    Orphaned,
    /// The outcome could not be recorded; the message was requeued.
    Deferred,
    /// The lease lapsed mid-analysis and the broker handed the message out
    /// again; this attempt stopped without touching the job or the delivery.
    LeaseLost,
}

enum Settlement {
    Ack,
    Nack(NackDisposition),
    /// The receipt is stale; leave the delivery to its new holder.
    Abandon,
}

#[derive(Clone)]
struct Processor {
    jobs: Arc<dyn JobStore>,
    files: Arc<ObjectStore>,
    vision: Arc<dyn VisionService>,
    consumer: QueueConsumer,
    config: WorkerConfig,
}

impl Processor {
    #[tracing::instrument(skip(self, consumed), fields(job.id = %consumed.message.job_id, delivery = consumed.receipt.delivery_count))]
    async fn handle(&self, consumed: ConsumedMessage) -> Outcome {
        let ConsumedMessage { message, receipt } = consumed;

        let lease_lost = CancellationToken::new();
        let heartbeat = self.spawn_lease_heartbeat(receipt.clone(), lease_lost.clone());
        let ran = self
            .run(message.job_id, receipt.redelivered(), &lease_lost)
            .await;
        heartbeat.abort();

        let (outcome, settlement) = match ran {
            Ok(settled) => settled,
            Err(e) => {
                tracing::error!(error = %e, "Failed to record job outcome, requeueing");
                (
                    Outcome::Deferred,
                    Settlement::Nack(NackDisposition::Requeue {
                        delay: self.config.retry_backoff.base,
                    }),
                )
            }
        };

        let settled = match settlement {
            Settlement::Ack => self.consumer.ack(&receipt).await,
            Settlement::Nack(disposition) => self.consumer.nack(&receipt, disposition).await,
            Settlement::Abandon => Ok(()),
        };
        if let Err(e) = settled {
            // The lease lapsed and the broker will redeliver; the job record
            // already absorbs the duplicate.
            tracing::warn!(error = %e, outcome = ?outcome, "Failed to settle delivery");
        }
        outcome
    }

    async fn run(
        &self,
        job_id: Uuid,
        redelivered: bool,
        lease_lost: &CancellationToken,
    ) -> Result<(Outcome, Settlement), JobStoreError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            tracing::warn!("Message references unknown job, dropping");
            return Ok((Outcome::Orphaned, Settlement::Ack));
        };
        if job.is_terminal() {
            tracing::debug!(status = %job.status, "Job already finished, acking duplicate");
            return Ok((Outcome::Duplicate, Settlement::Ack));
        }
        if job.cancel_requested {
            return self.observe_cancel(job_id).await;
        }

        let job = match self.jobs.apply(job_id, JobEvent::Claim { redelivered }).await {
            Ok(applied) if applied.changed => applied.job,
            Ok(_) => return Ok((Outcome::Duplicate, Settlement::Ack)),
            Err(JobStoreError::InvalidTransition(e)) => {
                tracing::info!(error = %e, "Job held by another worker, acking duplicate");
                return Ok((Outcome::Duplicate, Settlement::Ack));
            }
            Err(e) => return Err(e),
        };
        let attempts = job.attempts;
        tracing::info!(attempts, "Job claimed");

        if job.cancel_requested {
            return self.observe_cancel(job_id).await;
        }

        let file = match self.files.get(&job.stored_file_id).await {
            Some(file) if self.files.exists(&file.file_id).await => file,
            _ => {
                let failure = JobFailure {
                    code: "file_missing".to_string(),
                    message: format!("Stored file {} no longer exists", job.stored_file_id),
                    attempts,
                    retryable: false,
                };
                let reason = failure.message.clone();
                self.jobs
                    .apply(job_id, JobEvent::FailPermanent { failure })
                    .await?;
                tracing::error!(file_id = %job.stored_file_id, "Stored file missing, job failed");
                return Ok((
                    Outcome::FailedPermanently,
                    Settlement::Nack(NackDisposition::DeadLetter { reason }),
                ));
            }
        };

        let request = VisionRequest {
            job_id,
            file,
            analysis_type: job.analysis_type,
            parameters: job.parameters.clone(),
        };
        let Some(result) = self.call_vision(&request, lease_lost).await else {
            tracing::warn!(attempts, "Delivery lease lapsed during analysis, abandoning attempt");
            return Ok((Outcome::LeaseLost, Settlement::Abandon));
        };

        match result {
            Ok(value) => self.complete(job_id, value).await,
            Err(e) => match e.kind() {
                FailureKind::Cancelled => self.observe_cancel(job_id).await,
                FailureKind::Retryable if job.can_retry(self.config.max_retries) => {
                    let delay = self
                        .config
                        .retry_backoff
                        .delay_for(attempts.saturating_sub(1).max(0) as u32);
                    tracing::warn!(
                        error = %e,
                        attempts,
                        max_retries = self.config.max_retries,
                        retry_in_ms = delay.as_millis() as u64,
                        "Analysis failed, scheduling retry"
                    );
                    self.jobs
                        .apply(
                            job_id,
                            JobEvent::FailRetryable {
                                failure: e.to_failure(attempts),
                            },
                        )
                        .await?;
                    Ok((
                        Outcome::RetryScheduled,
                        Settlement::Nack(NackDisposition::Requeue { delay }),
                    ))
                }
                _ => {
                    tracing::error!(
                        error = %e,
                        attempts,
                        retryable = e.is_retryable(),
                        "Analysis failed permanently"
                    );
                    self.jobs
                        .apply(
                            job_id,
                            JobEvent::FailPermanent {
                                failure: e.to_failure(attempts),
                            },
                        )
                        .await?;
                    Ok((
                        Outcome::FailedPermanently,
                        Settlement::Nack(NackDisposition::DeadLetter {
                            reason: e.to_string(),
                        }),
                    ))
                }
            },
        }
    }

    /// `None` when the delivery lease was lost before the call finished; the
    /// in-flight call is dropped so the next holder runs alone.
    async fn call_vision(
        &self,
        request: &VisionRequest,
        lease_lost: &CancellationToken,
    ) -> Option<Result<Value, cropscan_core::ProcessingError>> {
        let cancel = CancellationToken::new();
        let watcher = self.spawn_cancel_watcher(request.job_id, cancel.clone());
        let call = tokio::time::timeout(
            self.config.vision_timeout,
            self.vision.analyze(request, cancel),
        );
        let result = tokio::select! {
            biased;
            _ = lease_lost.cancelled() => None,
            timed = call => Some(match timed {
                Ok(result) => result,
                Err(_) => Err(cropscan_core::ProcessingError::timeout(
                    self.config.vision_timeout,
                )),
            }),
        };
        watcher.abort();
        result
    }

    /// Keep the delivery leased while this worker holds it. Trips `lost` if
    /// the broker reports the lease already gone.
    fn spawn_lease_heartbeat(
        &self,
        receipt: DeliveryReceipt,
        lost: CancellationToken,
    ) -> JoinHandle<()> {
        let consumer = self.consumer.clone();
        let lease = self.config.lease_duration;
        let every = (lease / 3).max(Duration::from_millis(10));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(every).await;
                match consumer.extend_lease(&receipt, lease).await {
                    Ok(()) => {}
                    Err(BrokerError::StaleReceipt(_)) => {
                        tracing::warn!(
                            message_id = %receipt.message_id,
                            delivery = receipt.delivery_count,
                            "Delivery lease lapsed"
                        );
                        lost.cancel();
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Lease extension failed, will retry")
                    }
                }
            }
        })
    }

    /// Poll the job record and trip `cancel` once a cancel request lands.
    fn spawn_cancel_watcher(&self, job_id: Uuid, cancel: CancellationToken) -> JoinHandle<()> {
        let jobs = self.jobs.clone();
        let interval = self.config.cancel_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match jobs.get(job_id).await {
                    Ok(Some(job)) if job.cancel_requested => {
                        tracing::info!(job.id = %job_id, "Cancel requested during analysis");
                        cancel.cancel();
                        return;
                    }
                    Ok(Some(job)) if !job.is_terminal() => {}
                    Ok(_) => return,
                    Err(e) => tracing::warn!(job.id = %job_id, error = %e, "Cancel poll failed"),
                }
            }
        })
    }

    async fn complete(
        &self,
        job_id: Uuid,
        result: Value,
    ) -> Result<(Outcome, Settlement), JobStoreError> {
        self.jobs.apply(job_id, JobEvent::Complete { result }).await?;
        tracing::info!("Job completed");
        Ok((Outcome::Completed, Settlement::Ack))
    }

    async fn observe_cancel(&self, job_id: Uuid) -> Result<(Outcome, Settlement), JobStoreError> {
        let applied = self.jobs.apply(job_id, JobEvent::CancelObserved).await?;
        if applied.changed {
            tracing::info!("Job cancelled");
            Ok((Outcome::Cancelled, Settlement::Ack))
        } else {
            Ok((Outcome::Duplicate, Settlement::Ack))
        }
    }
}

/// Bounded pool of consumers.
///
/// One receive loop hands each message to a spawned task holding a semaphore
/// permit, so at most `concurrency` analyses run at once and nothing is
/// received without a free slot.
pub struct WorkerPool {
    shutdown: CancellationToken,
    concurrency: usize,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    pub fn start(
        consumer: QueueConsumer,
        jobs: Arc<dyn JobStore>,
        files: Arc<ObjectStore>,
        vision: Arc<dyn VisionService>,
        config: WorkerConfig,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let shutdown = CancellationToken::new();
        let processor = Processor {
            jobs,
            files,
            vision,
            consumer,
            config,
        };

        let handle = tokio::spawn(Self::run(
            processor,
            semaphore,
            shutdown.clone(),
            concurrency,
        ));

        Self {
            shutdown,
            concurrency,
            handle,
        }
    }

    async fn run(
        processor: Processor,
        semaphore: Arc<Semaphore>,
        shutdown: CancellationToken,
        concurrency: usize,
    ) {
        tracing::info!(concurrency, "Worker pool started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let consumed = tokio::select! {
                _ = shutdown.cancelled() => break,
                consumed = processor.consumer.recv() => consumed,
            };

            let processor = processor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let outcome = processor.handle(consumed).await;
                tracing::debug!(outcome = ?outcome, "Delivery settled");
            });
        }

        // Drain: in-flight tasks release their permits as they finish.
        let drained = semaphore.acquire_many(concurrency as u32).await;
        drop(drained);
        tracing::info!("Worker pool stopped");
    }

    pub fn workers(&self) -> usize {
        self.concurrency
    }

    /// Stop receiving and wait for in-flight messages to settle.
    pub async fn shutdown(self) {
        tracing::info!("Initiating worker pool shutdown");
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Worker pool task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cropscan_core::{AnalysisParameters, AnalysisType, JobStatus, NewJob, ProcessingError};
    use cropscan_db::InMemoryJobStore;
    use cropscan_queue::{BrokerHealth, MemoryBroker, QueueBroker};
    use cropscan_storage::ObjectStoreConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedVision {
        calls: AtomicUsize,
        fail_with: Option<fn() -> ProcessingError>,
    }

    #[async_trait]
    impl VisionService for ScriptedVision {
        async fn analyze(
            &self,
            request: &VisionRequest,
            _cancel: CancellationToken,
        ) -> Result<Value, ProcessingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(make) => Err(make()),
                None => Ok(json!({ "analysis_type": request.analysis_type })),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        jobs: Arc<InMemoryJobStore>,
        files: Arc<ObjectStore>,
        broker: Arc<MemoryBroker>,
        processor: Processor,
        vision: Arc<ScriptedVision>,
    }

    async fn fixture(fail_with: Option<fn() -> ProcessingError>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let files = Arc::new(
            ObjectStore::open(ObjectStoreConfig::new(dir.path()))
                .await
                .unwrap(),
        );
        let jobs = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(30)));
        let vision = Arc::new(ScriptedVision {
            calls: AtomicUsize::new(0),
            fail_with,
        });
        let consumer = QueueConsumer::new(broker.clone(), BrokerHealth::new())
            .with_receive_wait(Duration::from_millis(50));
        let processor = Processor {
            jobs: jobs.clone(),
            files: files.clone(),
            vision: vision.clone(),
            consumer,
            config: WorkerConfig {
                retry_backoff: RetryBackoff::new(Duration::ZERO, Duration::ZERO),
                ..WorkerConfig::default()
            },
        };
        Fixture {
            _dir: dir,
            jobs,
            files,
            broker,
            processor,
            vision,
        }
    }

    impl Fixture {
        async fn enqueue(&self) -> Uuid {
            let mut png = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
            png.extend(Uuid::new_v4().as_bytes());
            let mut handle = self.files.begin_upload("image/png", 1 << 20).await.unwrap();
            handle.write_chunk(&png).await.unwrap();
            let stored = self.files.commit_upload(handle).await.unwrap().stored;

            let job = self
                .jobs
                .create(NewJob {
                    job_id: Uuid::new_v4(),
                    stored_file_id: stored.file_id,
                    analysis_type: AnalysisType::Disease,
                    parameters: AnalysisParameters::default(),
                })
                .await
                .unwrap();
            let message = cropscan_core::JobMessage::for_job(&job, chrono::Utc::now());
            self.broker
                .publish(job.job_id, message.encode().unwrap())
                .await
                .unwrap();
            job.job_id
        }

        async fn next(&self) -> ConsumedMessage {
            self.processor.consumer.recv().await
        }
    }

    #[tokio::test]
    async fn test_success_completes_and_acks() {
        let fx = fixture(None).await;
        let job_id = fx.enqueue().await;

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::Completed);

        let job = fx.jobs.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(json!({ "analysis_type": "disease" })));
        assert_eq!(fx.broker.depth().await.unwrap().in_flight, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_claim_skips_vision() {
        let fx = fixture(None).await;
        let job_id = fx.enqueue().await;
        fx.jobs.request_cancel(job_id).await.unwrap();

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert_eq!(fx.vision.calls.load(Ordering::SeqCst), 0);
        let job = fx.jobs.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::CancelledCooperative);
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_dead_letters() {
        let fx = fixture(Some(|| {
            ProcessingError::permanent("vision_rejected", anyhow::anyhow!("bad image"))
        }))
        .await;
        let job_id = fx.enqueue().await;

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::FailedPermanently);

        let job = fx.jobs.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::FailedPermanently);
        let failure = job.error.unwrap();
        assert_eq!(failure.code, "vision_rejected");
        assert!(!failure.retryable);
        assert_eq!(fx.broker.dead_letters().await.len(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_until_ceiling() {
        let fx = fixture(Some(|| {
            ProcessingError::retryable("vision_unavailable", anyhow::anyhow!("503"))
        }))
        .await;
        let job_id = fx.enqueue().await;

        for expected_attempts in 1..=2 {
            let outcome = fx.processor.handle(fx.next().await).await;
            assert_eq!(outcome, Outcome::RetryScheduled);
            let job = fx.jobs.get_status(job_id).await.unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.attempts, expected_attempts);
        }

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::FailedPermanently);
        assert_eq!(fx.vision.calls.load(Ordering::SeqCst), 3);
        let job = fx.jobs.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::FailedPermanently);
        assert_eq!(job.error.unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_duplicate_message_for_finished_job_is_acked() {
        let fx = fixture(None).await;
        let job_id = fx.enqueue().await;
        fx.processor.handle(fx.next().await).await;

        // A second copy of the same descriptor.
        let job = fx.jobs.get_status(job_id).await.unwrap();
        let message = cropscan_core::JobMessage::for_job(&job, chrono::Utc::now());
        fx.broker
            .publish(job_id, message.encode().unwrap())
            .await
            .unwrap();

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::Duplicate);
        assert_eq!(fx.vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.broker.depth().await.unwrap(), Default::default());
    }

    struct StallingVision;

    #[async_trait]
    impl VisionService for StallingVision {
        async fn analyze(
            &self,
            _request: &VisionRequest,
            _cancel: CancellationToken,
        ) -> Result<Value, ProcessingError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_lost_lease_stops_the_attempt() {
        let mut fx = fixture(None).await;
        fx.processor.vision = Arc::new(StallingVision);
        fx.processor.config.lease_duration = Duration::from_millis(60);
        let job_id = fx.enqueue().await;

        let consumed = fx.next().await;
        let receipt = consumed.receipt.clone();
        let processor = fx.processor.clone();
        let running = tokio::spawn(async move { processor.handle(consumed).await });

        // The delivery is settled elsewhere while the analysis is in flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        fx.broker.ack(&receipt).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(2), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Outcome::LeaseLost);
        let job = fx.jobs.get_status(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_job_is_dropped() {
        let fx = fixture(None).await;
        let message = cropscan_core::JobMessage {
            schema_version: 1,
            job_id: Uuid::new_v4(),
            stored_file_id: "ef".repeat(32),
            analysis_type: AnalysisType::Pest,
            parameters: AnalysisParameters::default(),
            enqueued_at: chrono::Utc::now(),
        };
        fx.broker
            .publish(message.job_id, message.encode().unwrap())
            .await
            .unwrap();

        let outcome = fx.processor.handle(fx.next().await).await;
        assert_eq!(outcome, Outcome::Orphaned);
        assert_eq!(fx.vision.calls.load(Ordering::SeqCst), 0);
    }
}
