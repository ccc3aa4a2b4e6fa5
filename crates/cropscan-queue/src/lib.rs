//! Queue bridge
//!
//! Carries [`JobMessage`](cropscan_core::JobMessage) descriptors, never image
//! bytes, from the intake path to the worker pool with at-least-once delivery.
//! A delivery stays leased to one consumer until it is acked, nacked, or its
//! visibility timeout lapses, after which the broker hands it out again.

pub mod broker;
pub mod consumer;
pub mod error;
pub mod health;
pub mod memory;
pub mod postgres;
pub mod publisher;

pub use broker::{Delivery, DeliveryReceipt, NackDisposition, QueueBroker, QueueDepth};
pub use consumer::{ConsumedMessage, QueueConsumer};
pub use error::{BrokerError, PublishError};
pub use health::{BrokerHealth, HealthStatus};
pub use memory::{DeadLetter, MemoryBroker};
pub use postgres::PgBroker;
pub use publisher::{PublisherConfig, QueuePublisher};
