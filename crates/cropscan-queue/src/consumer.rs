use cropscan_core::JobMessage;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{DeliveryReceipt, NackDisposition, QueueBroker};
use crate::error::BrokerError;
use crate::health::BrokerHealth;

#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub message: JobMessage,
    pub receipt: DeliveryReceipt,
}

/// Decoding receive loop on top of a [`QueueBroker`].
///
/// Payloads that do not decode, including newer schema versions, are
/// dead-lettered here and never reach the worker.
#[derive(Clone)]
pub struct QueueConsumer {
    broker: Arc<dyn QueueBroker>,
    health: BrokerHealth,
    receive_wait: Duration,
    reconnect_delay: Duration,
}

impl QueueConsumer {
    pub fn new(broker: Arc<dyn QueueBroker>, health: BrokerHealth) -> Self {
        Self {
            broker,
            health,
            receive_wait: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(1),
        }
    }

    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    /// Wait for the next decodable message.
    ///
    /// While the broker is unreachable this parks until the health monitor
    /// reports it back, retrying at most once per reconnect delay.
    pub async fn recv(&self) -> ConsumedMessage {
        loop {
            if !self.health.is_connected() {
                tokio::select! {
                    _ = self.health.wait_until_connected() => {}
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
            }

            let delivery = match self.broker.receive(self.receive_wait).await {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    self.health.mark_disconnected(e.to_string());
                    continue;
                }
            };

            match JobMessage::decode(&delivery.payload) {
                Ok(message) => {
                    return ConsumedMessage {
                        message,
                        receipt: delivery.receipt,
                    }
                }
                Err(e) => {
                    tracing::error!(
                        message_id = %delivery.receipt.message_id,
                        error = %e,
                        "Undecodable job message, dead-lettering"
                    );
                    let reason = format!("undecodable: {}", e);
                    if let Err(e) = self
                        .broker
                        .nack(&delivery.receipt, NackDisposition::DeadLetter { reason })
                        .await
                    {
                        tracing::warn!(error = %e, "Failed to dead-letter undecodable message");
                    }
                }
            }
        }
    }

    pub async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), BrokerError> {
        self.broker.ack(receipt).await
    }

    pub async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        disposition: NackDisposition,
    ) -> Result<(), BrokerError> {
        self.broker.nack(receipt, disposition).await
    }

    pub async fn extend_lease(
        &self,
        receipt: &DeliveryReceipt,
        extension: Duration,
    ) -> Result<(), BrokerError> {
        self.broker.extend_lease(receipt, extension).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use chrono::Utc;
    use cropscan_core::{AnalysisParameters, AnalysisType};
    use uuid::Uuid;

    #[tokio::test]
    async fn test_undecodable_and_future_versions_are_dead_lettered() {
        let broker = Arc::new(MemoryBroker::new(Duration::from_secs(30)));
        let consumer = QueueConsumer::new(broker.clone(), BrokerHealth::new())
            .with_receive_wait(Duration::from_millis(20));

        broker
            .publish(Uuid::new_v4(), b"not json".to_vec())
            .await
            .unwrap();
        let future = serde_json::json!({
            "schema_version": 2,
            "job_id": Uuid::new_v4(),
            "stored_file_id": "ab",
            "analysis_type": "disease",
            "enqueued_at": Utc::now(),
        });
        broker
            .publish(Uuid::new_v4(), serde_json::to_vec(&future).unwrap())
            .await
            .unwrap();

        let good = JobMessage {
            schema_version: 1,
            job_id: Uuid::new_v4(),
            stored_file_id: "cd".repeat(32),
            analysis_type: AnalysisType::Disease,
            parameters: AnalysisParameters::default(),
            enqueued_at: Utc::now(),
        };
        broker
            .publish(good.job_id, good.encode().unwrap())
            .await
            .unwrap();

        let consumed = tokio::time::timeout(Duration::from_secs(2), consumer.recv())
            .await
            .expect("good message should arrive");
        assert_eq!(consumed.message, good);
        consumer.ack(&consumed.receipt).await.unwrap();

        let dead = broker.dead_letters().await;
        assert_eq!(dead.len(), 2);
        assert!(dead.iter().all(|d| d.reason.starts_with("undecodable")));
    }
}
