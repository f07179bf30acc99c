//! Dispatch queue: hands job attempts to workers and schedules retries.
//!
//! A job id has at most one unfinished delivery at a time. While that
//! delivery is claimed no other worker can receive the same job, which is what
//! serializes the orchestrator's writes for a job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipit_config::QueueConfig;
use shipit_core::BuildId;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job {0} already has an unfinished delivery")]
    AlreadyQueued(BuildId),

    #[error("delivery {0} is not active")]
    NotActive(Uuid),

    #[error("corrupt queue row: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Exponential backoff: the delay after the k-th retryable failure is
/// `base_delay * 2^(k-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(2000),
        }
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
        }
    }
}

impl RetryPolicy {
    /// Whether a job with `retry_count` retryable failures gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_attempts
    }

    /// Backoff after the `failures`-th retryable failure.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.max(1) - 1;
        let factor = 1u32.checked_shl(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// A claimed job attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: Uuid,
    pub build_id: BuildId,
    pub attempt: u32,
    pub worker_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// Acknowledgement of an enqueue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReceipt {
    pub delivery_id: Uuid,
    pub build_id: BuildId,
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-delivery scheduled after `delay`.
    Scheduled { attempt: u32, delay: Duration },
    /// Attempt limit reached; the delivery is finished.
    Exhausted,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Name of this queue backend.
    fn name(&self) -> &'static str;

    fn policy(&self) -> &RetryPolicy;

    /// Make a job attempt available immediately.
    async fn enqueue(&self, build_id: &BuildId, attempt: u32) -> QueueResult<QueueReceipt>;

    /// Claim the next available delivery, oldest first.
    async fn claim(&self, worker_id: &str) -> QueueResult<Option<Delivery>>;

    /// Suspend until work may be available.
    async fn wait_for_work(&self);

    /// Finish a delivery for good. Unknown or finished deliveries are ignored.
    async fn complete(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Handle a retryable failure of a claimed delivery.
    async fn retry(&self, delivery: &Delivery, retry_count: u32) -> QueueResult<RetryDecision>;

    /// Put a claimed delivery back without counting an attempt.
    async fn release(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Deliveries waiting to be claimed.
    async fn depth(&self) -> QueueResult<usize>;

    /// The claimed delivery of a job, if any.
    async fn active_delivery(&self, build_id: &BuildId) -> QueueResult<Option<Delivery>>;
}

#[derive(Debug)]
struct Entry {
    id: Uuid,
    build_id: BuildId,
    attempt: u32,
    available_at: Instant,
    claim: Option<(String, DateTime<Utc>)>,
}

impl Entry {
    fn matches(&self, delivery: &Delivery) -> bool {
        self.id == delivery.id
            && self.attempt == delivery.attempt
            && self
                .claim
                .as_ref()
                .is_some_and(|(worker, _)| *worker == delivery.worker_id)
    }

    fn delivery(&self) -> Option<Delivery> {
        self.claim.as_ref().map(|(worker_id, claimed_at)| Delivery {
            id: self.id,
            build_id: self.build_id.clone(),
            attempt: self.attempt,
            worker_id: worker_id.clone(),
            claimed_at: *claimed_at,
        })
    }
}

/// In-process dispatch queue. Holds only unfinished deliveries.
pub struct MemoryDispatchQueue {
    policy: RetryPolicy,
    entries: Mutex<Vec<Entry>>,
    notify: Notify,
}

impl MemoryDispatchQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn enqueue(&self, build_id: &BuildId, attempt: u32) -> QueueResult<QueueReceipt> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|e| e.build_id == *build_id) {
            return Err(QueueError::AlreadyQueued(build_id.clone()));
        }
        let entry = Entry {
            id: Uuid::now_v7(),
            build_id: build_id.clone(),
            attempt,
            available_at: Instant::now(),
            claim: None,
        };
        let receipt = QueueReceipt {
            delivery_id: entry.id,
            build_id: build_id.clone(),
            attempt,
        };
        entries.push(entry);
        drop(entries);

        self.notify.notify_one();
        Ok(receipt)
    }

    async fn claim(&self, worker_id: &str) -> QueueResult<Option<Delivery>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let next = entries
            .iter_mut()
            .filter(|e| e.claim.is_none() && e.available_at <= now)
            .min_by_key(|e| e.available_at);

        Ok(next.and_then(|entry| {
            entry.claim = Some((worker_id.to_string(), Utc::now()));
            entry.delivery()
        }))
    }

    async fn wait_for_work(&self) {
        let next_due = {
            let entries = self.entries.lock().await;
            entries
                .iter()
                .filter(|e| e.claim.is_none())
                .map(|e| e.available_at)
                .min()
        };

        match next_due {
            Some(at) if at <= Instant::now() => {}
            Some(at) => {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.notify.notified().await,
        }
    }

    async fn complete(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut entries = self.entries.lock().await;
        entries.retain(|e| !e.matches(delivery));
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, retry_count: u32) -> QueueResult<RetryDecision> {
        let mut entries = self.entries.lock().await;
        let index = entries
            .iter()
            .position(|e| e.matches(delivery))
            .ok_or(QueueError::NotActive(delivery.id))?;

        if !self.policy.should_retry(retry_count) {
            entries.remove(index);
            return Ok(RetryDecision::Exhausted);
        }

        let attempt = retry_count + 1;
        let delay = self.policy.delay_for(retry_count);
        let entry = &mut entries[index];
        entry.attempt = attempt;
        entry.available_at = Instant::now() + delay;
        entry.claim = None;
        drop(entries);

        debug!(job_id = %delivery.build_id, attempt, ?delay, "Scheduled retry");
        self.notify.notify_one();
        Ok(RetryDecision::Scheduled { attempt, delay })
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.iter_mut().find(|e| e.matches(delivery)) {
            entry.claim = None;
            entry.available_at = Instant::now();
            drop(entries);
            self.notify.notify_one();
        }
        Ok(())
    }

    async fn depth(&self) -> QueueResult<usize> {
        let entries = self.entries.lock().await;
        Ok(entries.iter().filter(|e| e.claim.is_none()).count())
    }

    async fn active_delivery(&self, build_id: &BuildId) -> QueueResult<Option<Delivery>> {
        let entries = self.entries.lock().await;
        Ok(entries
            .iter()
            .find(|e| e.build_id == *build_id)
            .and_then(Entry::delivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> BuildId {
        BuildId::parse(raw).unwrap()
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(32000));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(1),
        };
        assert_eq!(
            policy.delay_for(200),
            Duration::from_secs(1).saturating_mul(u32::MAX)
        );
    }

    #[test]
    fn test_should_retry_until_max_attempts() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_per_job() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("a"), 1).await.unwrap();
        assert!(matches!(
            queue.enqueue(&id("a"), 1).await,
            Err(QueueError::AlreadyQueued(_))
        ));

        let delivery = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(delivery.build_id, id("a"));
        assert!(queue.claim("w2").await.unwrap().is_none());
        assert_eq!(
            queue.active_delivery(&id("a")).await.unwrap(),
            Some(delivery.clone())
        );

        queue.complete(&delivery).await.unwrap();
        queue.complete(&delivery).await.unwrap();
        assert!(queue.active_delivery(&id("a")).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_claims_oldest_first() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("first"), 1).await.unwrap();
        queue.enqueue(&id("second"), 1).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 2);

        let a = queue.claim("w1").await.unwrap().unwrap();
        let b = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(a.build_id, id("first"));
        assert_eq!(b.build_id, id("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_for_backoff() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("a"), 1).await.unwrap();
        let delivery = queue.claim("w1").await.unwrap().unwrap();

        let decision = queue.retry(&delivery, 2).await.unwrap();
        assert_eq!(
            decision,
            RetryDecision::Scheduled {
                attempt: 3,
                delay: Duration::from_millis(4000)
            }
        );
        assert!(queue.claim("w1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(3999)).await;
        assert!(queue.claim("w1").await.unwrap().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        let again = queue.claim("w1").await.unwrap().unwrap();
        assert_eq!(again.attempt, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_work_wakes_at_backoff_deadline() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("a"), 1).await.unwrap();
        let delivery = queue.claim("w1").await.unwrap().unwrap();
        queue.retry(&delivery, 1).await.unwrap();

        let started = Instant::now();
        let claimed = loop {
            if let Some(delivery) = queue.claim("w1").await.unwrap() {
                break delivery;
            }
            queue.wait_for_work().await;
        };
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert_eq!(claimed.attempt, 2);
    }

    #[tokio::test]
    async fn test_retry_exhausted_finishes_delivery() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("a"), 1).await.unwrap();
        let delivery = queue.claim("w1").await.unwrap().unwrap();

        assert_eq!(
            queue.retry(&delivery, 5).await.unwrap(),
            RetryDecision::Exhausted
        );
        assert!(queue.active_delivery(&id("a")).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert!(matches!(
            queue.retry(&delivery, 5).await,
            Err(QueueError::NotActive(_))
        ));
    }

    #[tokio::test]
    async fn test_release_makes_delivery_claimable() {
        let queue = MemoryDispatchQueue::new(RetryPolicy::default());
        queue.enqueue(&id("a"), 1).await.unwrap();
        let delivery = queue.claim("w1").await.unwrap().unwrap();
        queue.release(&delivery).await.unwrap();

        let again = queue.claim("w2").await.unwrap().unwrap();
        assert_eq!(again.id, delivery.id);
        assert_eq!(again.worker_id, "w2");

        // The stale handle no longer owns the delivery.
        queue.complete(&delivery).await.unwrap();
        assert!(queue.active_delivery(&id("a")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiting_worker() {
        let queue = std::sync::Arc::new(MemoryDispatchQueue::new(RetryPolicy::default()));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue.wait_for_work().await;
                queue.claim("w1").await.unwrap()
            })
        };
        tokio::task::yield_now().await;
        queue.enqueue(&id("a"), 1).await.unwrap();

        let claimed = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.unwrap().build_id, id("a"));
    }
}
