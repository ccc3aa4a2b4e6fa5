use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use crate::error::BrokerError;

/// Opaque handle for one delivery, owned by the consumer until ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub delivery_id: Uuid,
    pub message_id: Uuid,
    /// 1 on first delivery.
    pub delivery_count: u32,
    pub(crate) lease_id: Uuid,
}

impl DeliveryReceipt {
    /// True when an earlier delivery of this message was never acked.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub payload: Vec<u8>,
    pub receipt: DeliveryReceipt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackDisposition {
    /// Make the message receivable again after `delay`.
    Requeue { delay: Duration },
    /// Park the message; it will not be delivered again.
    DeadLetter { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub in_flight: u64,
    pub dead: u64,
}

/// A durable queue with leased, at-least-once delivery.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    async fn publish(&self, message_id: Uuid, payload: Vec<u8>) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next receivable message.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), BrokerError>;

    async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        disposition: NackDisposition,
    ) -> Result<(), BrokerError>;

    /// Move the lease's expiry to `extension` from now.
    ///
    /// Fails with [`BrokerError::StaleReceipt`] once the lease has lapsed or
    /// the delivery was settled; the holder must then stop working on it.
    async fn extend_lease(
        &self,
        receipt: &DeliveryReceipt,
        extension: Duration,
    ) -> Result<(), BrokerError>;

    /// Connectivity check used by the health monitor.
    async fn ping(&self) -> Result<(), BrokerError>;

    async fn depth(&self) -> Result<QueueDepth, BrokerError>;
}
