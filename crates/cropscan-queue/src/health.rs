use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::QueueBroker;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub connected: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Shared view of broker connectivity.
///
/// The monitor pings the broker on an interval and publishes the result on a
/// watch channel. Consumers park on [`BrokerHealth::wait_until_connected`]
/// instead of spinning on receive errors.
#[derive(Clone)]
pub struct BrokerHealth {
    tx: Arc<watch::Sender<HealthStatus>>,
    rx: watch::Receiver<HealthStatus>,
}

impl Default for BrokerHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerHealth {
    /// Starts optimistic: connected until a ping says otherwise.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(HealthStatus {
            connected: true,
            last_checked_at: None,
            last_error: None,
        });
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.rx.borrow().connected
    }

    pub fn status(&self) -> HealthStatus {
        self.rx.borrow().clone()
    }

    pub fn mark_connected(&self) {
        self.update(true, None);
    }

    pub fn mark_disconnected(&self, error: impl Into<String>) {
        self.update(false, Some(error.into()));
    }

    fn update(&self, connected: bool, error: Option<String>) {
        let was_connected = self.is_connected();
        if was_connected && !connected {
            tracing::error!(error = ?error, "Queue broker connection lost");
        } else if !was_connected && connected {
            tracing::info!("Queue broker connection restored");
        }
        self.tx.send_replace(HealthStatus {
            connected,
            last_checked_at: Some(Utc::now()),
            last_error: error,
        });
    }

    pub async fn wait_until_connected(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as `self`, so this only returns once connected.
        let _ = rx.wait_for(|status| status.connected).await;
    }

    /// Ping the broker once and record the result.
    pub async fn check(&self, broker: &dyn QueueBroker) -> bool {
        match broker.ping().await {
            Ok(()) => {
                self.mark_connected();
                true
            }
            Err(e) => {
                self.mark_disconnected(e.to_string());
                false
            }
        }
    }

    pub fn spawn_monitor(&self, broker: Arc<dyn QueueBroker>, interval: Duration) -> JoinHandle<()> {
        let health = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                health.check(broker.as_ref()).await;
            }
        })
    }
}
