use cropscan_core::{Config, JobMessage, RetryBackoff};
use std::sync::Arc;
use std::time::Duration;

use crate::broker::QueueBroker;
use crate::error::PublishError;
use crate::health::BrokerHealth;

#[derive(Debug, Clone, Copy)]
pub struct PublisherConfig {
    /// Total tries, including the first.
    pub attempts: u32,
    pub backoff: RetryBackoff,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(16)),
        }
    }
}

impl From<&Config> for PublisherConfig {
    fn from(config: &Config) -> Self {
        Self {
            attempts: config.publish_attempts.max(1),
            backoff: RetryBackoff::new(config.publish_backoff_base, config.retry_backoff_max),
        }
    }
}

/// Inline publisher used by the intake path.
///
/// Retries a bounded number of times; callers record a publish failure on the
/// job when this gives up so a background task can republish later.
#[derive(Clone)]
pub struct QueuePublisher {
    broker: Arc<dyn QueueBroker>,
    config: PublisherConfig,
    health: Option<BrokerHealth>,
}

impl QueuePublisher {
    pub fn new(broker: Arc<dyn QueueBroker>, config: PublisherConfig) -> Self {
        Self {
            broker,
            config,
            health: None,
        }
    }

    /// Give up early instead of backing off while the monitor reports the
    /// broker as down.
    pub fn with_health(mut self, health: BrokerHealth) -> Self {
        self.health = Some(health);
        self
    }

    #[tracing::instrument(skip(self, message), fields(job.id = %message.job_id))]
    pub async fn publish(&self, message: &JobMessage) -> Result<(), PublishError> {
        let payload = message.encode()?;
        let attempts = self.config.attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..attempts {
            match self.broker.publish(message.job_id, payload.clone()).await {
                Ok(()) => {
                    if let Some(health) = &self.health {
                        health.mark_connected();
                    }
                    tracing::debug!(attempt = attempt + 1, "Job message published");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Failed to publish job message"
                    );
                }
            }

            let broker_down = self.health.as_ref().is_some_and(|h| !h.is_connected());
            if attempt + 1 == attempts || broker_down {
                return Err(PublishError::BrokerUnavailable {
                    attempts: attempt + 1,
                    last_error,
                });
            }
            tokio::time::sleep(self.config.backoff.delay_for(attempt)).await;
        }

        Err(PublishError::BrokerUnavailable {
            attempts,
            last_error,
        })
    }
}
