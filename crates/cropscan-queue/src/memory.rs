use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryReceipt, NackDisposition, QueueBroker, QueueDepth};
use crate::error::BrokerError;

#[derive(Debug, Clone)]
struct Entry {
    delivery_id: Uuid,
    message_id: Uuid,
    payload: Vec<u8>,
    delivery_count: u32,
    visible_at: Instant,
    lease_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: Uuid,
    pub payload: Vec<u8>,
    pub delivery_count: u32,
    pub reason: String,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Entry>,
    in_flight: HashMap<Uuid, Entry>,
    dead: Vec<DeadLetter>,
}

impl State {
    /// Move deliveries whose lease lapsed back to the ready queue.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(mut entry) = self.in_flight.remove(&id) {
                tracing::warn!(
                    message_id = %entry.message_id,
                    delivery_count = entry.delivery_count,
                    "Delivery lease expired, message will be redelivered"
                );
                entry.lease_id = None;
                self.ready.push_front(entry);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.ready
            .iter()
            .chain(self.in_flight.values())
            .map(|entry| entry.visible_at)
            .min()
    }

    fn take_lease(&mut self, receipt: &DeliveryReceipt) -> Result<Entry, BrokerError> {
        match self.in_flight.get(&receipt.delivery_id) {
            Some(entry) if entry.lease_id == Some(receipt.lease_id) => self
                .in_flight
                .remove(&receipt.delivery_id)
                .ok_or(BrokerError::StaleReceipt(receipt.delivery_id)),
            _ => Err(BrokerError::StaleReceipt(receipt.delivery_id)),
        }
    }
}

/// In-process broker with FIFO delivery, leases and a dead-letter list.
///
/// Used for single-node deployments and tests.
pub struct MemoryBroker {
    state: Mutex<State>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    async fn publish(&self, message_id: Uuid, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ready.push_back(Entry {
            delivery_id: Uuid::new_v4(),
            message_id,
            payload,
            delivery_count: 0,
            visible_at: Instant::now(),
            lease_id: None,
        });
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            let now = Instant::now();
            let wake_at = {
                let mut state = self.state.lock().await;
                state.reclaim_expired(now);

                if let Some(pos) = state.ready.iter().position(|e| e.visible_at <= now) {
                    if let Some(mut entry) = state.ready.remove(pos) {
                        let lease_id = Uuid::new_v4();
                        entry.delivery_count += 1;
                        entry.visible_at = now + self.visibility_timeout;
                        entry.lease_id = Some(lease_id);
                        let delivery = Delivery {
                            payload: entry.payload.clone(),
                            receipt: DeliveryReceipt {
                                delivery_id: entry.delivery_id,
                                message_id: entry.message_id,
                                delivery_count: entry.delivery_count,
                                lease_id,
                            },
                        };
                        state.in_flight.insert(entry.delivery_id, entry);
                        return Ok(Some(delivery));
                    }
                }

                state
                    .next_wake()
                    .map_or(deadline, |at| at.min(deadline))
            };

            if now >= deadline {
                return Ok(None);
            }

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), BrokerError> {
        self.state.lock().await.take_lease(receipt)?;
        Ok(())
    }

    async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        disposition: NackDisposition,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let mut entry = state.take_lease(receipt)?;
        entry.lease_id = None;
        match disposition {
            NackDisposition::Requeue { delay } => {
                entry.visible_at = Instant::now() + delay;
                state.ready.push_back(entry);
                drop(state);
                self.notify.notify_one();
            }
            NackDisposition::DeadLetter { reason } => {
                tracing::warn!(
                    message_id = %entry.message_id,
                    delivery_count = entry.delivery_count,
                    reason = %reason,
                    "Message dead-lettered"
                );
                state.dead.push(DeadLetter {
                    message_id: entry.message_id,
                    payload: entry.payload,
                    delivery_count: entry.delivery_count,
                    reason,
                });
            }
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt: &DeliveryReceipt,
        extension: Duration,
    ) -> Result<(), BrokerError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);
        match state.in_flight.get_mut(&receipt.delivery_id) {
            Some(entry) if entry.lease_id == Some(receipt.lease_id) => {
                entry.visible_at = now + extension;
                Ok(())
            }
            _ => Err(BrokerError::StaleReceipt(receipt.delivery_id)),
        }
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, BrokerError> {
        let state = self.state.lock().await;
        Ok(QueueDepth {
            ready: state.ready.len() as u64,
            in_flight: state.in_flight.len() as u64,
            dead: state.dead.len() as u64,
        })
    }
}
