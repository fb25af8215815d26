use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

const QUEUE_KEY: &str = "defect_scan:jobs";
const PROCESSING_KEY: &str = "defect_scan:processing";
const CLAIMS_KEY: &str = "defect_scan:claims";

/// Job payload serialized into the queue.
///
/// Every delivery of a job carries its own `delivery_id`, so acking one
/// delivery never releases the claim held on another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub delivery_id: Uuid,
    pub file_path: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    pub fn new(job_id: Uuid, file_path: impl Into<String>) -> Self {
        Self {
            job_id,
            delivery_id: Uuid::new_v4(),
            file_path: file_path.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// The same job as a new, independently acked delivery.
    pub fn redelivery(&self) -> Self {
        Self::new(self.job_id, self.file_path.clone())
    }
}

/// At-least-once work channel between submitters and workers.
///
/// A dequeued job stays claimed until `ack`; claims older than a timeout can
/// be pulled back with `reclaim_stale` and redelivered.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Claim the next job, waiting up to `wait` for one to arrive.
    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError>;

    /// Release the claim held by this delivery. Other deliveries of the same
    /// job are unaffected.
    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError>;

    /// Remove and return claims held longer than `older_than`.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<QueuedJob>, QueueError>;

    /// Number of jobs waiting to be claimed.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

/// Redis-backed reliable queue (list + processing list + claim timestamps).
pub struct RedisJobQueue {
    client: redis::Client,
}

impl RedisJobQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        // BRPOPLPUSH treats 0 as "block forever", so never pass less than a second.
        let timeout = wait.as_secs().max(1);
        let result: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(QUEUE_KEY)
            .arg(PROCESSING_KEY)
            .arg(timeout)
            .query_async(&mut conn)
            .await
            .map_err(QueueError::Redis)?;

        let Some(payload) = result else {
            return Ok(None);
        };
        conn.hset::<_, _, _, ()>(CLAIMS_KEY, &payload, Utc::now().timestamp_millis())
            .await
            .map_err(QueueError::Redis)?;

        let job: QueuedJob = serde_json::from_str(&payload).map_err(QueueError::Serialize)?;
        Ok(Some(job))
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let payload = serde_json::to_string(job).map_err(QueueError::Serialize)?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload)
            .await
            .map_err(QueueError::Redis)?;
        conn.hdel::<_, _, ()>(CLAIMS_KEY, &payload)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<QueuedJob>, QueueError> {
        let mut conn = self.connection().await?;
        let in_flight: Vec<String> = conn
            .lrange(PROCESSING_KEY, 0, -1)
            .await
            .map_err(QueueError::Redis)?;

        let now = Utc::now().timestamp_millis();
        let cutoff = now - older_than.as_millis() as i64;
        let mut reclaimed = Vec::new();

        for payload in in_flight {
            let claimed_at: Option<i64> = conn
                .hget(CLAIMS_KEY, &payload)
                .await
                .map_err(QueueError::Redis)?;

            match claimed_at {
                // Popped but not yet stamped: start the clock now.
                None => {
                    conn.hset::<_, _, _, ()>(CLAIMS_KEY, &payload, now)
                        .await
                        .map_err(QueueError::Redis)?;
                }
                Some(at) if at <= cutoff => {
                    let removed: i64 = conn
                        .lrem(PROCESSING_KEY, 1, &payload)
                        .await
                        .map_err(QueueError::Redis)?;
                    conn.hdel::<_, _, ()>(CLAIMS_KEY, &payload)
                        .await
                        .map_err(QueueError::Redis)?;
                    if removed == 0 {
                        continue;
                    }
                    match serde_json::from_str::<QueuedJob>(&payload) {
                        Ok(job) => reclaimed.push(job),
                        Err(e) => {
                            tracing::error!(error = %e, payload = %payload, "Dropping unreadable queue entry");
                        }
                    }
                }
                Some(_) => {}
            }
        }

        Ok(reclaimed)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await.map_err(QueueError::Redis)?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// Process-local queue with the same claim semantics, for tests and single-node runs.
#[derive(Default)]
pub struct InMemoryJobQueue {
    ready: Mutex<VecDeque<QueuedJob>>,
    claimed: Mutex<HashMap<Uuid, (QueuedJob, Instant)>>,
    notify: Notify,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of deliveries currently claimed and not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.claimed.lock().map(|c| c.len()).unwrap_or(0)
    }

    fn try_claim(&self) -> Result<Option<QueuedJob>, QueueError> {
        let job = self.ready.lock().map_err(|_| QueueError::Poisoned)?.pop_front();
        if let Some(job) = &job {
            self.claimed
                .lock()
                .map_err(|_| QueueError::Poisoned)?
                .insert(job.delivery_id, (job.clone(), Instant::now()));
        }
        Ok(job)
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.ready
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .push_back(job.clone());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<QueuedJob>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.try_claim()? {
                return Ok(Some(job));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_claim();
            }
        }
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), QueueError> {
        self.claimed
            .lock()
            .map_err(|_| QueueError::Poisoned)?
            .remove(&job.delivery_id);
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<Vec<QueuedJob>, QueueError> {
        let mut claimed = self.claimed.lock().map_err(|_| QueueError::Poisoned)?;
        let stale: Vec<Uuid> = claimed
            .iter()
            .filter(|(_, (_, at))| at.elapsed() >= older_than)
            .map(|(id, _)| *id)
            .collect();
        Ok(stale
            .into_iter()
            .filter_map(|id| claimed.remove(&id).map(|(job, _)| job))
            .collect())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.ready.lock().map_err(|_| QueueError::Poisoned)?.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Queue transport faults. All of them are retryable by redelivery.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("In-memory queue lock poisoned")]
    Poisoned,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_fifo_delivery() {
        let queue = InMemoryJobQueue::new();
        let first = QueuedJob::new(Uuid::new_v4(), "a.png");
        let second = QueuedJob::new(Uuid::new_v4(), "b.png");
        assert_ok!(queue.enqueue(&first).await);
        assert_ok!(queue.enqueue(&second).await);
        assert_eq!(queue.depth().await.unwrap(), 2);

        let got = queue.dequeue(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(got, first);
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_when_empty() {
        let queue = InMemoryJobQueue::new();
        let got = queue.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = QueuedJob::new(Uuid::new_v4(), "late.mp4");
        queue.enqueue(&job).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got, Some(job));
    }

    #[tokio::test]
    async fn test_ack_releases_claim() {
        let queue = InMemoryJobQueue::new();
        let job = QueuedJob::new(Uuid::new_v4(), "a.png");
        queue.enqueue(&job).await.unwrap();
        let claimed = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        queue.ack(&claimed).await.unwrap();
        assert_eq!(queue.in_flight(), 0);
        assert!(queue.reclaim_stale(Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unacked_claim_is_reclaimable() {
        let queue = InMemoryJobQueue::new();
        let job = QueuedJob::new(Uuid::new_v4(), "a.png");
        queue.enqueue(&job).await.unwrap();
        queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        assert!(queue.reclaim_stale(Duration::from_secs(3600)).await.unwrap().is_empty());
        let stale = queue.reclaim_stale(Duration::ZERO).await.unwrap();
        assert_eq!(stale, vec![job]);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_stale_ack_leaves_redelivery_claimed() {
        let queue = InMemoryJobQueue::new();
        let job = QueuedJob::new(Uuid::new_v4(), "a.png");
        queue.enqueue(&job).await.unwrap();
        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();

        let stale = queue.reclaim_stale(Duration::ZERO).await.unwrap();
        let again = stale[0].redelivery();
        assert_eq!(again.job_id, first.job_id);
        assert_ne!(again.delivery_id, first.delivery_id);
        queue.enqueue(&again).await.unwrap();
        let second = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(second, again);

        queue.ack(&first).await.unwrap();
        assert_eq!(queue.in_flight(), 1);
        assert_eq!(queue.reclaim_stale(Duration::ZERO).await.unwrap(), vec![second]);
    }

    #[test]
    fn test_payload_roundtrip_is_stable() {
        let job = QueuedJob::new(Uuid::new_v4(), "/data/uploads/x.png");
        let text = serde_json::to_string(&job).unwrap();
        let back: QueuedJob = serde_json::from_str(&text).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), text);
    }
}
