//! Dispatch queue implementation using PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shipit_core::BuildId;
use sqlx::PgPool;
use std::time::Duration;
use tokio::time::sleep;

use crate::queue::{
    Delivery, DispatchQueue, QueueError, QueueReceipt, QueueResult, RetryDecision, RetryPolicy,
};

/// A dispatch_queue row.
#[derive(Debug, Clone, sqlx::FromRow)]
struct QueueRow {
    id: uuid::Uuid,
    build_id: String,
    attempt: i32,
    claimed_by: Option<String>,
    claimed_at: Option<DateTime<Utc>>,
}

impl QueueRow {
    fn build_id(&self) -> QueueResult<BuildId> {
        BuildId::parse(&self.build_id).map_err(|e| QueueError::Decode(e.to_string()))
    }

    fn attempt(&self) -> QueueResult<u32> {
        u32::try_from(self.attempt)
            .map_err(|_| QueueError::Decode(format!("negative attempt {}", self.attempt)))
    }

    fn into_delivery(self) -> QueueResult<Option<Delivery>> {
        let build_id = self.build_id()?;
        let attempt = self.attempt()?;
        Ok(match (self.claimed_by, self.claimed_at) {
            (Some(worker_id), Some(claimed_at)) => Some(Delivery {
                id: self.id,
                build_id,
                attempt,
                worker_id,
                claimed_at,
            }),
            _ => None,
        })
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

/// Dispatch queue backed by PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so any number of workers, in any
/// number of processes, can pull from the same table.
pub struct PgDispatchQueue {
    pool: PgPool,
    policy: RetryPolicy,
    poll_interval: Duration,
}

impl PgDispatchQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy, poll_interval: Duration) -> Self {
        Self {
            pool,
            policy,
            poll_interval,
        }
    }
}

#[async_trait]
impl DispatchQueue for PgDispatchQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn enqueue(&self, build_id: &BuildId, attempt: u32) -> QueueResult<QueueReceipt> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            INSERT INTO dispatch_queue (id, build_id, attempt, available_at, created_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (build_id) WHERE finished_at IS NULL DO NOTHING
            RETURNING id, build_id, attempt, claimed_by, claimed_at
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(build_id.as_str())
        .bind(to_i32(attempt))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| QueueError::AlreadyQueued(build_id.clone()))?;

        Ok(QueueReceipt {
            delivery_id: row.id,
            build_id: row.build_id()?,
            attempt: row.attempt()?,
        })
    }

    async fn claim(&self, worker_id: &str) -> QueueResult<Option<Delivery>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            UPDATE dispatch_queue
            SET claimed_by = $1, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM dispatch_queue
                WHERE finished_at IS NULL AND claimed_by IS NULL AND available_at <= NOW()
                ORDER BY available_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING id, build_id, attempt, claimed_by, claimed_at
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_delivery(),
            None => Ok(None),
        }
    }

    async fn wait_for_work(&self) {
        sleep(self.poll_interval).await;
    }

    async fn complete(&self, delivery: &Delivery) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_queue SET finished_at = NOW()
            WHERE id = $1 AND attempt = $2 AND claimed_by = $3 AND finished_at IS NULL
            "#,
        )
        .bind(delivery.id)
        .bind(to_i32(delivery.attempt))
        .bind(&delivery.worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retry(&self, delivery: &Delivery, retry_count: u32) -> QueueResult<RetryDecision> {
        if !self.policy.should_retry(retry_count) {
            let result = sqlx::query(
                r#"
                UPDATE dispatch_queue SET finished_at = NOW()
                WHERE id = $1 AND attempt = $2 AND claimed_by = $3 AND finished_at IS NULL
                "#,
            )
            .bind(delivery.id)
            .bind(to_i32(delivery.attempt))
            .bind(&delivery.worker_id)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(QueueError::NotActive(delivery.id));
            }
            return Ok(RetryDecision::Exhausted);
        }

        let attempt = retry_count + 1;
        let delay = self.policy.delay_for(retry_count);
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        let result = sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET attempt = $4,
                available_at = NOW() + ($5::bigint * INTERVAL '1 millisecond'),
                claimed_by = NULL,
                claimed_at = NULL
            WHERE id = $1 AND attempt = $2 AND claimed_by = $3 AND finished_at IS NULL
            "#,
        )
        .bind(delivery.id)
        .bind(to_i32(delivery.attempt))
        .bind(&delivery.worker_id)
        .bind(to_i32(attempt))
        .bind(delay_ms)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::NotActive(delivery.id));
        }
        Ok(RetryDecision::Scheduled { attempt, delay })
    }

    async fn release(&self, delivery: &Delivery) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE dispatch_queue
            SET claimed_by = NULL, claimed_at = NULL, available_at = NOW()
            WHERE id = $1 AND attempt = $2 AND claimed_by = $3 AND finished_at IS NULL
            "#,
        )
        .bind(delivery.id)
        .bind(to_i32(delivery.attempt))
        .bind(&delivery.worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn depth(&self) -> QueueResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM dispatch_queue WHERE finished_at IS NULL AND claimed_by IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn active_delivery(&self, build_id: &BuildId) -> QueueResult<Option<Delivery>> {
        let row = sqlx::query_as::<_, QueueRow>(
            r#"
            SELECT id, build_id, attempt, claimed_by, claimed_at FROM dispatch_queue
            WHERE build_id = $1 AND finished_at IS NULL AND claimed_by IS NOT NULL
            "#,
        )
        .bind(build_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.into_delivery(),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipit_core::Job;
    use shipit_db::{JobStore, PgJobStore};
    use std::collections::BTreeMap;

    async fn setup() -> (PgDispatchQueue, BuildId) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = shipit_db::create_pool(&url, 2).await.unwrap();
        shipit_db::run_migrations(&pool).await.unwrap();

        let id = BuildId::parse(&format!("q-{}", uuid::Uuid::new_v4().simple())).unwrap();
        PgJobStore::new(pool.clone())
            .insert(&Job::new(
                id.clone(),
                "https://example.com/r.git",
                None,
                BTreeMap::new(),
            ))
            .await
            .unwrap();

        let queue = PgDispatchQueue::new(
            pool,
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(50),
            },
            Duration::from_millis(10),
        );
        (queue, id)
    }

    /// Claim until this test's job comes up; other jobs may share the table.
    async fn claim_job(queue: &PgDispatchQueue, id: &BuildId, worker: &str) -> Delivery {
        loop {
            if let Some(d) = queue.claim(worker).await.unwrap() {
                if d.build_id == *id {
                    return d;
                }
                queue.release(&d).await.unwrap();
            }
            queue.wait_for_work().await;
        }
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_pg_retry_cycle() {
        let (queue, id) = setup().await;
        queue.enqueue(&id, 1).await.unwrap();
        assert!(matches!(
            queue.enqueue(&id, 1).await,
            Err(QueueError::AlreadyQueued(_))
        ));

        let first = claim_job(&queue, &id, "w1").await;
        assert_eq!(queue.active_delivery(&id).await.unwrap(), Some(first.clone()));

        let decision = queue.retry(&first, 1).await.unwrap();
        assert!(matches!(decision, RetryDecision::Scheduled { attempt: 2, .. }));
        assert!(queue.active_delivery(&id).await.unwrap().is_none());

        let second = claim_job(&queue, &id, "w2").await;
        assert_eq!(second.attempt, 2);
        assert_eq!(
            queue.retry(&second, 2).await.unwrap(),
            RetryDecision::Exhausted
        );
        // A finished job can be enqueued again.
        queue.enqueue(&id, 1).await.unwrap();
    }
}
