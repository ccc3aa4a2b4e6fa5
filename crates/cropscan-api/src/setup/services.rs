//! Service wiring
//!
//! Builds the object store, the job store and broker backends, and starts the
//! background tasks: broker health monitor, worker pool, reaper and
//! republisher.

use anyhow::{Context, Result};
use cropscan_core::Config;
use cropscan_db::{InMemoryJobStore, JobStore, PgJobStore};
use cropscan_queue::{
    BrokerHealth, MemoryBroker, PgBroker, PublisherConfig, QueueBroker, QueueConsumer,
    QueuePublisher,
};
use cropscan_services::{
    IntakeConfig, JobIntakeService, Reaper, ReaperConfig, RepublishConfig, RepublishService,
};
use cropscan_storage::{ObjectStore, ObjectStoreConfig};
use cropscan_worker::{HttpVisionClient, VisionService, WorkerConfig, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::state::AppState;

/// Fallback poll period for the Postgres queue when no NOTIFY arrives.
const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Storage and collaborator backends chosen at startup.
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub broker: Arc<dyn QueueBroker>,
    pub vision: Arc<dyn VisionService>,
    /// Tasks owned by the backends themselves (e.g. the queue listener).
    pub tasks: Vec<JoinHandle<()>>,
}

/// Postgres-backed jobs and queue when `DATABASE_URL` is set, in-memory otherwise.
pub async fn setup_backends(config: &Config) -> Result<Backends> {
    let vision: Arc<dyn VisionService> = Arc::new(
        HttpVisionClient::new(config.vision_service_url.clone(), config.vision_timeout)
            .context("Failed to build Vision Service client")?,
    );

    match &config.database_url {
        Some(url) => {
            let pool = super::database::setup_database(config, url).await?;
            let broker = PgBroker::new(pool.clone(), config.visibility_timeout, QUEUE_POLL_INTERVAL);
            let listener = broker.spawn_listener();
            Ok(Backends {
                jobs: Arc::new(PgJobStore::new(pool)),
                broker: Arc::new(broker),
                vision,
                tasks: vec![listener],
            })
        }
        None => {
            tracing::warn!("DATABASE_URL not set, jobs and queue are kept in memory");
            Ok(Backends {
                jobs: Arc::new(InMemoryJobStore::new()),
                broker: Arc::new(MemoryBroker::new(config.visibility_timeout)),
                vision,
                tasks: Vec::new(),
            })
        }
    }
}

/// Handles to everything started by [`initialize_services`].
pub struct BackgroundTasks {
    pool: WorkerPool,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Let in-flight jobs settle, then stop the periodic tasks.
    pub async fn shutdown(self) {
        self.pool.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

pub async fn initialize_services(
    config: &Config,
    backends: Backends,
) -> Result<(Arc<AppState>, BackgroundTasks)> {
    let Backends {
        jobs,
        broker,
        vision,
        mut tasks,
    } = backends;

    let files = Arc::new(
        ObjectStore::open(ObjectStoreConfig {
            root: config.storage_root.clone(),
            file_ttl: config.file_ttl,
            supported_formats: config.supported_formats.clone(),
        })
        .await
        .context("Failed to open object store")?,
    );

    let broker_health = BrokerHealth::new();
    tasks.push(broker_health.spawn_monitor(broker.clone(), config.health_check_interval));

    let publisher = QueuePublisher::new(broker.clone(), PublisherConfig::from(config))
        .with_health(broker_health.clone());
    let intake = JobIntakeService::new(
        files.clone(),
        jobs.clone(),
        publisher,
        IntakeConfig::from(config),
    );

    // One attempt per scan; the republisher paces retries itself.
    let republish_publisher = QueuePublisher::new(
        broker.clone(),
        PublisherConfig {
            attempts: 1,
            ..PublisherConfig::from(config)
        },
    )
    .with_health(broker_health.clone());
    let republisher = Arc::new(RepublishService::new(
        jobs.clone(),
        republish_publisher,
        RepublishConfig::from(config),
    ));
    tasks.push(republisher.start());

    let reaper = Arc::new(Reaper::new(
        files.clone(),
        jobs.clone(),
        ReaperConfig::from(config),
    ));
    tasks.push(reaper.clone().start());

    let consumer = QueueConsumer::new(broker, broker_health.clone());
    let pool = WorkerPool::start(
        consumer,
        jobs.clone(),
        files.clone(),
        vision,
        WorkerConfig::from(config),
    );

    let state = Arc::new(AppState {
        intake,
        jobs,
        files,
        reaper,
        broker_health,
        workers: pool.workers(),
    });

    tracing::info!(workers = state.workers, "Services initialized");
    Ok((state, BackgroundTasks { pool, tasks }))
}
