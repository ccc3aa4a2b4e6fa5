use async_trait::async_trait;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryReceipt, NackDisposition, QueueBroker, QueueDepth};
use crate::error::BrokerError;

pub const QUEUE_NOTIFY_CHANNEL: &str = "cropscan_job_queue";

/// Postgres table used as a durable queue.
///
/// Receivers claim rows with `FOR UPDATE SKIP LOCKED`, so a row is handed to
/// exactly one consumer until its lease (`visible_at`) lapses. Publishing
/// raises a `NOTIFY` that wakes idle receivers; polling covers missed wakeups.
pub struct PgBroker {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl PgBroker {
    pub fn new(pool: PgPool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Spawn the LISTEN loop that wakes waiting receivers on publish.
    pub fn spawn_listener(&self) -> tokio::task::JoinHandle<()> {
        let pool = self.pool.clone();
        let notify = self.notify.clone();
        tokio::spawn(async move {
            loop {
                match sqlx::postgres::PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if let Err(e) = listener.listen(QUEUE_NOTIFY_CHANNEL).await {
                            tracing::warn!(error = %e, "LISTEN failed, will retry");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            continue;
                        }
                        while listener.recv().await.is_ok() {
                            notify.notify_one();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "PgListener connect failed, will retry");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        })
    }

    async fn claim_next(&self) -> Result<Option<Delivery>, BrokerError> {
        let lease_id = Uuid::new_v4();
        let row = sqlx::query(
            r#"
            UPDATE job_queue
            SET state = 'in_flight',
                delivery_count = delivery_count + 1,
                lease_id = $1,
                visible_at = NOW() + ($2 * interval '1 millisecond')
            WHERE delivery_id = (
                SELECT delivery_id
                FROM job_queue
                WHERE state IN ('ready', 'in_flight')
                    AND visible_at <= NOW()
                ORDER BY enqueued_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING delivery_id, message_id, payload, delivery_count
            "#,
        )
        .bind(lease_id)
        .bind(self.visibility_timeout.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let delivery_count: i32 = row.get("delivery_count");
            Delivery {
                payload: row.get("payload"),
                receipt: DeliveryReceipt {
                    delivery_id: row.get("delivery_id"),
                    message_id: row.get("message_id"),
                    delivery_count: delivery_count.max(0) as u32,
                    lease_id,
                },
            }
        }))
    }
}

#[async_trait]
impl QueueBroker for PgBroker {
    async fn publish(&self, message_id: Uuid, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO job_queue (delivery_id, message_id, payload)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(message_id)
        .bind(payload)
        .execute(&mut *tx)
        .await?;
        sqlx::query("SELECT pg_notify($1, '')")
            .bind(QUEUE_NOTIFY_CHANNEL)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.claim_next().await? {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wake_at = (now + self.poll_interval).min(deadline);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, receipt: &DeliveryReceipt) -> Result<(), BrokerError> {
        let result = sqlx::query(
            "DELETE FROM job_queue WHERE delivery_id = $1 AND lease_id = $2 AND state = 'in_flight'",
        )
        .bind(receipt.delivery_id)
        .bind(receipt.lease_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleReceipt(receipt.delivery_id));
        }
        Ok(())
    }

    async fn nack(
        &self,
        receipt: &DeliveryReceipt,
        disposition: NackDisposition,
    ) -> Result<(), BrokerError> {
        let result = match disposition {
            NackDisposition::Requeue { delay } => {
                sqlx::query(
                    r#"
                    UPDATE job_queue
                    SET state = 'ready',
                        lease_id = NULL,
                        visible_at = NOW() + ($3 * interval '1 millisecond')
                    WHERE delivery_id = $1 AND lease_id = $2 AND state = 'in_flight'
                    "#,
                )
                .bind(receipt.delivery_id)
                .bind(receipt.lease_id)
                .bind(delay.as_millis() as i64)
                .execute(&self.pool)
                .await?
            }
            NackDisposition::DeadLetter { reason } => {
                tracing::warn!(
                    message_id = %receipt.message_id,
                    delivery_count = receipt.delivery_count,
                    reason = %reason,
                    "Message dead-lettered"
                );
                sqlx::query(
                    r#"
                    UPDATE job_queue
                    SET state = 'dead',
                        lease_id = NULL,
                        last_error = $3
                    WHERE delivery_id = $1 AND lease_id = $2 AND state = 'in_flight'
                    "#,
                )
                .bind(receipt.delivery_id)
                .bind(receipt.lease_id)
                .bind(reason)
                .execute(&self.pool)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleReceipt(receipt.delivery_id));
        }
        Ok(())
    }

    async fn extend_lease(
        &self,
        receipt: &DeliveryReceipt,
        extension: Duration,
    ) -> Result<(), BrokerError> {
        let result = sqlx::query(
            r#"
            UPDATE job_queue
            SET visible_at = NOW() + ($3 * interval '1 millisecond')
            WHERE delivery_id = $1
                AND lease_id = $2
                AND state = 'in_flight'
                AND visible_at > NOW()
            "#,
        )
        .bind(receipt.delivery_id)
        .bind(receipt.lease_id)
        .bind(extension.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BrokerError::StaleReceipt(receipt.delivery_id));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn depth(&self) -> Result<QueueDepth, BrokerError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'ready')::bigint AS ready,
                COUNT(*) FILTER (WHERE state = 'in_flight')::bigint AS in_flight,
                COUNT(*) FILTER (WHERE state = 'dead')::bigint AS dead
            FROM job_queue
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        let get = |name: &str| row.get::<i64, _>(name).max(0) as u64;
        Ok(QueueDepth {
            ready: get("ready"),
            in_flight: get("in_flight"),
            dead: get("dead"),
        })
    }
}
