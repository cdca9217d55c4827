use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::verdict::AddressTask;

const QUEUE_KEY: &str = "bulk_verify:jobs";
const PROCESSING_KEY: &str = "bulk_verify:processing";
const DELAYED_KEY: &str = "bulk_verify:delayed";
const COMPLETED_KEY: &str = "bulk_verify:completed";
const FAILED_KEY: &str = "bulk_verify:failed";
const DEAD_LETTER_KEY: &str = "bulk_verify:dead_letter";

/// Moves due delayed messages onto the ready list in one step so two workers
/// never promote the same payload twice.
const PROMOTE_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 100)
for _, payload in ipairs(due) do
    redis.call('ZREM', KEYS[1], payload)
    redis.call('LPUSH', KEYS[2], payload)
end
return #due
"#;

/// Job payload serialized into the queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub job_id: Uuid,
    pub workspace_id: Uuid,
    pub addresses: Vec<AddressTask>,
    /// Offset into `addresses` where the next attempt resumes.
    #[serde(default)]
    pub cursor: usize,
    /// Failed attempts so far. Bounds retries when the job store cannot.
    #[serde(default)]
    pub attempts: i32,
}

impl QueueMessage {
    pub fn new(job_id: Uuid, workspace_id: Uuid, addresses: Vec<AddressTask>) -> Self {
        Self {
            job_id,
            workspace_id,
            addresses,
            cursor: 0,
            attempts: 0,
        }
    }

    pub fn with_cursor(&self, cursor: usize) -> Self {
        Self {
            cursor: cursor.min(self.addresses.len()),
            ..self.clone()
        }
    }

    pub fn with_attempts(&self, attempts: i32) -> Self {
        Self {
            attempts,
            ..self.clone()
        }
    }
}

/// A dequeued message. `payload` is the exact bytes held in the in-flight
/// list, needed to remove it on ack.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueueMessage,
    payload: String,
}

impl Delivery {
    /// Decode a claimed payload. On failure the raw payload is handed back
    /// so the caller can dead-letter it.
    fn decode(payload: String) -> Result<Self, (String, serde_json::Error)> {
        match serde_json::from_str(&payload) {
            Ok(message) => Ok(Self { message, payload }),
            Err(e) => Err((payload, e)),
        }
    }
}

/// How a delivery left the queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
    /// Redelivery of a job that was already terminal (or missing).
    Skipped,
}

/// Retained record of a finished delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueueReceipt {
    pub job_id: Uuid,
    pub outcome: JobOutcome,
    pub finished_at: DateTime<Utc>,
}

/// At-least-once work queue for bulk verification jobs.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Make `message` visible after `delay`.
    async fn enqueue_after(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Claim the next ready message, if any.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Drop a delivery from the in-flight set and record its outcome.
    async fn ack(&self, delivery: &Delivery, outcome: JobOutcome) -> Result<(), QueueError>;

    /// Return a delivery to the queue, replaced by `message`, after `delay`.
    async fn retry(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), QueueError>;

    /// Messages waiting, ready or delayed.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
pub fn backoff_delay(attempt: i32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 31) as u32;
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// Redis-backed job queue with delayed retries and bounded history.
pub struct RedisJobQueue {
    client: redis::Client,
    history_retention: usize,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str, history_retention: usize) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self {
            client,
            history_retention: history_retention.max(1),
        })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn history_key(outcome: JobOutcome) -> &'static str {
    match outcome {
        JobOutcome::Completed | JobOutcome::Skipped => COMPLETED_KEY,
        JobOutcome::Failed => FAILED_KEY,
    }
}

#[async_trait]
impl WorkQueue for RedisJobQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(())
    }

    async fn enqueue_after(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message)?;
        let ready_at = now_millis() + delay.as_millis() as i64;
        conn.zadd::<_, _, _, ()>(DELAYED_KEY, &payload, ready_at).await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.conn().await?;

        redis::Script::new(PROMOTE_DUE_SCRIPT)
            .key(DELAYED_KEY)
            .key(QUEUE_KEY)
            .arg(now_millis())
            .invoke_async::<i64>(&mut conn)
            .await?;

        let result: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;
        let Some(payload) = result else {
            return Ok(None);
        };

        match Delivery::decode(payload) {
            Ok(delivery) => Ok(Some(delivery)),
            Err((payload, e)) => {
                tracing::error!(error = %e, "Undecodable queue payload, moving to dead letters");
                redis::pipe()
                    .atomic()
                    .lrem(PROCESSING_KEY, 1, &payload)
                    .ignore()
                    .lpush(DEAD_LETTER_KEY, &payload)
                    .ignore()
                    .ltrim(DEAD_LETTER_KEY, 0, self.history_retention as isize - 1)
                    .ignore()
                    .query_async::<()>(&mut conn)
                    .await?;
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let receipt = serde_json::to_string(&QueueReceipt {
            job_id: delivery.message.job_id,
            outcome,
            finished_at: Utc::now(),
        })?;
        let key = history_key(outcome);

        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.payload)
            .ignore()
            .lpush(key, &receipt)
            .ignore()
            .ltrim(key, 0, self.history_retention as isize - 1)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(message)?;
        let ready_at = now_millis() + delay.as_millis() as i64;

        redis::pipe()
            .atomic()
            .lrem(PROCESSING_KEY, 1, &delivery.payload)
            .ignore()
            .zadd(DELAYED_KEY, &payload, ready_at)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.conn().await?;
        let ready: u64 = conn.llen(QUEUE_KEY).await?;
        let delayed: u64 = conn.zcard(DELAYED_KEY).await?;
        Ok(ready + delayed)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryQueueState {
    ready: VecDeque<String>,
    delayed: Vec<(Instant, String)>,
    in_flight: Vec<String>,
    completed: VecDeque<QueueReceipt>,
    failed: VecDeque<QueueReceipt>,
    dead_letters: Vec<String>,
}

/// In-process queue with the same delivery semantics as the Redis one.
/// Delays follow tokio's clock, so paused-time tests control them.
pub struct InMemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    history_retention: usize,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new(1_000)
    }
}

impl InMemoryJobQueue {
    pub fn new(history_retention: usize) -> Self {
        Self {
            state: Mutex::new(MemoryQueueState::default()),
            history_retention: history_retention.max(1),
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.in_flight.len()
    }

    pub async fn completed(&self) -> Vec<QueueReceipt> {
        self.state.lock().await.completed.iter().cloned().collect()
    }

    pub async fn failed(&self) -> Vec<QueueReceipt> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Messages scheduled for later, with their remaining delay.
    pub async fn delayed(&self) -> Vec<(Duration, QueueMessage)> {
        let now = Instant::now();
        let state = self.state.lock().await;
        state
            .delayed
            .iter()
            .filter_map(|(at, payload)| {
                let message = serde_json::from_str(payload).ok()?;
                Some((at.saturating_duration_since(now), message))
            })
            .collect()
    }

    fn take_in_flight(state: &mut MemoryQueueState, payload: &str) {
        if let Some(pos) = state.in_flight.iter().position(|p| p == payload) {
            state.in_flight.remove(pos);
        }
    }
}

#[async_trait]
impl WorkQueue for InMemoryJobQueue {
    async fn enqueue(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        self.state.lock().await.ready.push_back(payload);
        Ok(())
    }

    async fn enqueue_after(&self, message: &QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        self.state
            .lock()
            .await
            .delayed
            .push((Instant::now() + delay, payload));
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|(at, _)| *at <= now);
        state.delayed = pending;
        due.sort_by_key(|(at, _)| *at);
        state.ready.extend(due.into_iter().map(|(_, payload)| payload));

        let Some(payload) = state.ready.pop_front() else {
            return Ok(None);
        };
        match Delivery::decode(payload) {
            Ok(delivery) => {
                state.in_flight.push(delivery.payload.clone());
                Ok(Some(delivery))
            }
            Err((payload, e)) => {
                state.dead_letters.push(payload);
                Err(QueueError::Serialize(e))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery, outcome: JobOutcome) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        Self::take_in_flight(&mut state, &delivery.payload);

        let receipt = QueueReceipt {
            job_id: delivery.message.job_id,
            outcome,
            finished_at: Utc::now(),
        };
        let history = match outcome {
            JobOutcome::Completed | JobOutcome::Skipped => &mut state.completed,
            JobOutcome::Failed => &mut state.failed,
        };
        history.push_front(receipt);
        history.truncate(self.history_retention);
        Ok(())
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        message: &QueueMessage,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let payload = serde_json::to_string(message)?;
        let mut state = self.state.lock().await;
        Self::take_in_flight(&mut state, &delivery.payload);
        state.delayed.push((Instant::now() + delay, payload));
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let state = self.state.lock().await;
        Ok((state.ready.len() + state.delayed.len()) as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
