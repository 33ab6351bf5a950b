//! Job queue producer and consumers
//!
//! Async views never run inline: the assembled statement is handed to the
//! queue under a fresh job id and the caller polls the status store.
//! Publishing never waits for a worker; a full or unavailable queue is an
//! immediate `QueueError`.
//!
//! Two backends share the [`JobQueue`] / [`JobConsumer`] seams:
//! - [`PgJobQueue`]: the `export_queue` table, claimed with `SKIP LOCKED` and
//!   redelivered after a visibility timeout (at-least-once)
//! - [`ChannelQueue`]: a bounded in-process channel for tests and local runs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::query::SqlParam;

/// Body of one queued export request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: String,
    #[serde(rename = "sql_query")]
    pub sql: String,
    #[serde(default)]
    pub params: Vec<SqlParam>,
    #[serde(default)]
    pub debug: bool,
}

/// Publishing side of a message queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Must not wait for consumers
    async fn publish(&self, body: String) -> Result<()>;
}

/// One received message
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Backend handle used to acknowledge the message
    pub receipt: String,
    pub body: String,
    /// 1 on first delivery, higher on redelivery
    pub attempts: u32,
}

/// Consuming side of a message queue
#[async_trait]
pub trait JobConsumer: Send + Sync {
    /// Wait for the next message; `None` once the queue is closed for good
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Remove a handled message so it is not delivered again
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
}

#[derive(Clone)]
pub struct JobProducer {
    queue: Arc<dyn JobQueue>,
}

impl JobProducer {
    pub fn new(queue: Arc<dyn JobQueue>) -> Self {
        Self { queue }
    }

    /// Publish the statement and return its job id
    ///
    /// No status record is written here; a job without one reads as queued.
    pub async fn enqueue(&self, sql: &str, params: &[SqlParam], debug: bool) -> Result<String> {
        let message = JobMessage {
            job_id: Uuid::new_v4().to_string(),
            sql: sql.to_string(),
            params: params.to_vec(),
            debug,
        };
        let body = serde_json::to_string(&message)
            .map_err(|e| Error::QueueError(format!("failed to encode message: {e}")))?;
        self.queue.publish(body).await?;
        info!(job_id = %message.job_id, "export job queued");
        Ok(message.job_id)
    }
}

/// In-process bounded queue feeding the worker pool
#[derive(Clone)]
pub struct ChannelQueue {
    tx: mpsc::Sender<String>,
}

/// Consumer side of a [`ChannelQueue`], shareable between workers
#[derive(Clone)]
pub struct QueueReceiver {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl ChannelQueue {
    pub fn bounded(capacity: usize) -> (ChannelQueue, QueueReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            ChannelQueue { tx },
            QueueReceiver {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl JobQueue for ChannelQueue {
    async fn publish(&self, body: String) -> Result<()> {
        self.tx.try_send(body).map_err(|e| match e {
            TrySendError::Full(_) => Error::QueueError("queue is full".into()),
            TrySendError::Closed(_) => Error::QueueError("queue is closed".into()),
        })
    }
}

impl QueueReceiver {
    /// Next message body, or None once every producer is gone
    pub async fn next(&self) -> Option<String> {
        let body = self.rx.lock().await.recv().await;
        if body.is_none() {
            debug!("queue drained");
        }
        body
    }
}

#[async_trait]
impl JobConsumer for QueueReceiver {
    async fn receive(&self) -> Result<Option<Delivery>> {
        Ok(self.next().await.map(|body| Delivery {
            receipt: String::new(),
            body,
            attempts: 1,
        }))
    }

    /// Channel messages are gone once received
    async fn ack(&self, _delivery: &Delivery) -> Result<()> {
        Ok(())
    }
}

const CREATE_QUEUE_TABLE: &str = "CREATE TABLE IF NOT EXISTS export_queue (
    id BIGSERIAL PRIMARY KEY,
    body TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    visible_at TIMESTAMPTZ NOT NULL DEFAULT now(),
    enqueued_at TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Oldest visible message, hidden for the visibility timeout while it is processed
const CLAIM_MESSAGE: &str = "UPDATE export_queue
    SET attempts = attempts + 1,
        visible_at = now() + make_interval(secs => $1)
    WHERE id = (
        SELECT id FROM export_queue
        WHERE visible_at <= now()
        ORDER BY id
        FOR UPDATE SKIP LOCKED
        LIMIT 1
    )
    RETURNING id, body, attempts";

/// Durable queue in the `export_queue` table
///
/// A claimed message that is never acknowledged (worker crash, restart)
/// becomes visible again after `visibility_timeout` and is redelivered.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, visibility_timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            pool,
            visibility_timeout,
            poll_interval,
        }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_QUEUE_TABLE).execute(&self.pool).await?;
        debug!("export_queue table ready");
        Ok(())
    }

    async fn claim(&self) -> Result<Option<Delivery>> {
        let row: Option<(i64, String, i32)> = sqlx::query_as(CLAIM_MESSAGE)
            .bind(self.visibility_timeout.as_secs_f64())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id, body, attempts)| Delivery {
            receipt: id.to_string(),
            body,
            attempts: u32::try_from(attempts).unwrap_or(u32::MAX),
        }))
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn publish(&self, body: String) -> Result<()> {
        sqlx::query("INSERT INTO export_queue (body) VALUES ($1)")
            .bind(body)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::QueueError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl JobConsumer for PgJobQueue {
    /// Polls until a message is visible; never returns `None`
    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            if let Some(delivery) = self.claim().await? {
                debug!(receipt = %delivery.receipt, attempts = delivery.attempts, "message claimed");
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let id: i64 = delivery
            .receipt
            .parse()
            .map_err(|_| Error::QueueError(format!("bad receipt {:?}", delivery.receipt)))?;
        sqlx::query("DELETE FROM export_queue WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_enqueue_publishes_message() {
        let (queue, receiver) = ChannelQueue::bounded(4);
        let producer = JobProducer::new(Arc::new(queue));

        let job_id = producer
            .enqueue(
                r#"SELECT * FROM "pixel_spectra_mv" WHERE "pixel_id" = $1"#,
                &[SqlParam::Int(42)],
                true,
            )
            .await
            .unwrap();
        assert!(Uuid::parse_str(&job_id).is_ok());

        let body = receiver.next().await.unwrap();
        let raw: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(raw["job_id"], job_id.as_str());
        assert!(raw["sql_query"].as_str().unwrap().contains("pixel_spectra_mv"));
        assert_eq!(raw["params"], serde_json::json!([42]));

        let message: JobMessage = serde_json::from_str(&body).unwrap();
        assert!(message.debug);
    }

    #[tokio::test]
    async fn test_job_ids_are_unique() {
        let (queue, _receiver) = ChannelQueue::bounded(4);
        let producer = JobProducer::new(Arc::new(queue));
        let a = producer.enqueue("SELECT 1", &[], false).await.unwrap();
        let b = producer.enqueue("SELECT 1", &[], false).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_full_queue_fails_without_waiting() {
        let (queue, receiver) = ChannelQueue::bounded(1);
        let producer = JobProducer::new(Arc::new(queue));
        producer.enqueue("SELECT 1", &[], false).await.unwrap();

        let second = tokio::time::timeout(
            Duration::from_secs(2),
            producer.enqueue("SELECT 2", &[], false),
        )
        .await
        .expect("enqueue must not wait for a consumer");
        assert!(matches!(second, Err(Error::QueueError(msg)) if msg.contains("full")));

        // the first message is still there
        assert!(receiver.next().await.unwrap().contains("SELECT 1"));
    }

    #[tokio::test]
    async fn test_closed_queue_is_an_error() {
        let (queue, receiver) = ChannelQueue::bounded(1);
        drop(receiver);
        let producer = JobProducer::new(Arc::new(queue));
        let err = producer.enqueue("SELECT 1", &[], false).await.unwrap_err();
        assert!(matches!(err, Error::QueueError(_)));
    }

    #[tokio::test]
    async fn test_channel_consumer() {
        let (queue, receiver) = ChannelQueue::bounded(2);
        queue.publish("body".into()).await.unwrap();
        drop(queue);

        let delivery = receiver.receive().await.unwrap().unwrap();
        assert_eq!(delivery.body, "body");
        assert_eq!(delivery.attempts, 1);
        receiver.ack(&delivery).await.unwrap();
        assert_eq!(receiver.receive().await.unwrap(), None);
    }

    #[test]
    fn test_claim_skips_locked_rows() {
        assert!(CLAIM_MESSAGE.contains("FOR UPDATE SKIP LOCKED"));
        assert!(CLAIM_MESSAGE.contains("visible_at <= now()"));
        assert!(CLAIM_MESSAGE.contains("ORDER BY id"));
    }

    #[test]
    fn test_message_defaults() {
        let message: JobMessage =
            serde_json::from_str(r#"{"job_id": "j", "sql_query": "SELECT 1"}"#).unwrap();
        assert!(message.params.is_empty());
        assert!(!message.debug);
    }
}
