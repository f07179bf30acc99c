//! Job store: durable record of every build job and its status.
//!
//! Every write touches a single row. Status changes go through
//! [`StatusUpdate`] and only apply when the stored status is a valid
//! predecessor of the target, so a stale writer can never move a job
//! backwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shipit_core::{BuildId, Job, JobStatus, StatusUpdate};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::error::is_unique_violation;
use crate::{DbError, DbResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a job. Fails with [`DbError::Duplicate`] if the id exists.
    async fn insert(&self, job: &Job) -> DbResult<Job>;

    /// Create a job, or replace the submission fields of one that is still
    /// queued. Fails with [`DbError::Conflict`] once the job has started.
    async fn upsert(&self, job: &Job) -> DbResult<Job>;

    /// Apply a status mutation if the current status allows it.
    async fn update_status(&self, id: &BuildId, update: &StatusUpdate) -> DbResult<Job>;

    async fn get(&self, id: &BuildId) -> DbResult<Job>;

    /// Most recent jobs first.
    async fn list(&self, limit: i64) -> DbResult<Vec<Job>>;
}

/// A job row from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub build_id: String,
    pub repo_url: String,
    pub user_id: Option<String>,
    pub env_vars: Json<BTreeMap<String, String>>,
    pub status: String,
    pub retry_count: i32,
    pub build_size: Option<i64>,
    pub build_duration: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        let id = BuildId::parse(&record.build_id)
            .map_err(|e| DbError::Decode(format!("job {}: {}", record.build_id, e)))?;
        let status = record
            .status
            .parse::<JobStatus>()
            .map_err(|e| DbError::Decode(format!("job {}: {}", record.build_id, e)))?;
        let retry_count = u32::try_from(record.retry_count).map_err(|_| {
            DbError::Decode(format!(
                "job {}: negative retry_count {}",
                record.build_id, record.retry_count
            ))
        })?;

        Ok(Job {
            id,
            repo_url: record.repo_url,
            user_id: record.user_id,
            env_vars: record.env_vars.0,
            status,
            retry_count,
            build_size: record.build_size,
            build_duration: record.build_duration,
            error_message: record.error_message,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

/// Column values a [`StatusUpdate`] writes.
struct StatusColumns {
    retry_increment: i32,
    set_metrics: bool,
    build_size: Option<i64>,
    build_duration: Option<i64>,
    set_error: bool,
    error_message: Option<String>,
}

impl From<&StatusUpdate> for StatusColumns {
    fn from(update: &StatusUpdate) -> Self {
        let mut columns = StatusColumns {
            retry_increment: 0,
            set_metrics: false,
            build_size: None,
            build_duration: None,
            set_error: false,
            error_message: None,
        };
        match update {
            StatusUpdate::Started | StatusUpdate::Requeued => {}
            StatusUpdate::Succeeded { size, duration_ms } => {
                columns.set_metrics = true;
                columns.build_size = Some(*size);
                columns.build_duration = Some(*duration_ms);
                columns.set_error = true;
            }
            StatusUpdate::RetryableFailure { message } => {
                columns.retry_increment = 1;
                columns.set_error = true;
                columns.error_message = Some(message.clone());
            }
            StatusUpdate::PermanentFailure { message } => {
                columns.set_error = true;
                columns.error_message = Some(message.clone());
            }
        }
        columns
    }
}

/// PostgreSQL implementation of JobStore.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (build_id, repo_url, user_id, env_vars, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.repo_url)
        .bind(&job.user_id)
        .bind(Json(&job.env_vars))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                DbError::Duplicate(format!("job {}", job.id))
            } else {
                DbError::Database(e)
            }
        })?;
        record.try_into()
    }

    async fn upsert(&self, job: &Job) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            INSERT INTO jobs (build_id, repo_url, user_id, env_vars, status, retry_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, 'queued', 0, NOW(), NOW())
            ON CONFLICT (build_id) DO UPDATE
                SET repo_url = EXCLUDED.repo_url,
                    user_id = EXCLUDED.user_id,
                    env_vars = EXCLUDED.env_vars,
                    updated_at = NOW()
                WHERE jobs.status = 'queued'
            RETURNING *
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.repo_url)
        .bind(&job.user_id)
        .bind(Json(&job.env_vars))
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::Conflict(format!("job {} has already started", job.id)))?;
        record.try_into()
    }

    async fn update_status(&self, id: &BuildId, update: &StatusUpdate) -> DbResult<Job> {
        let target = update.target();
        let predecessors: Vec<&str> = target.predecessors().iter().map(|s| s.as_str()).collect();
        let columns = StatusColumns::from(update);

        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = $2,
                retry_count = retry_count + $3,
                build_size = CASE WHEN $4 THEN $5 ELSE build_size END,
                build_duration = CASE WHEN $4 THEN $6 ELSE build_duration END,
                error_message = CASE WHEN $7 THEN $8 ELSE error_message END,
                updated_at = NOW()
            WHERE build_id = $1 AND status = ANY($9)
            RETURNING *
            "#,
        )
        .bind(id.as_str())
        .bind(target.as_str())
        .bind(columns.retry_increment)
        .bind(columns.set_metrics)
        .bind(columns.build_size)
        .bind(columns.build_duration)
        .bind(columns.set_error)
        .bind(columns.error_message)
        .bind(&predecessors)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => record.try_into(),
            None => {
                // Either the row is missing or its status is not a predecessor.
                let current = self.get(id).await?;
                Err(DbError::InvalidTransition {
                    from: current.status,
                    to: target,
                })
            }
        }
    }

    async fn get(&self, id: &BuildId) -> DbResult<Job> {
        let record = sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE build_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        record.try_into()
    }

    async fn list(&self, limit: i64) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        records.into_iter().map(Job::try_from).collect()
    }
}

/// In-process job store for single-node mode and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<BuildId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> DbResult<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(DbError::Duplicate(format!("job {}", job.id)));
        }
        let now = Utc::now();
        let stored = Job {
            status: JobStatus::Queued,
            retry_count: 0,
            build_size: None,
            build_duration: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            ..job.clone()
        };
        jobs.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn upsert(&self, job: &Job) -> DbResult<Job> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) if existing.status != JobStatus::Queued => Err(DbError::Conflict(
                format!("job {} has already started", job.id),
            )),
            Some(existing) => {
                existing.repo_url = job.repo_url.clone();
                existing.user_id = job.user_id.clone();
                existing.env_vars = job.env_vars.clone();
                existing.updated_at = Utc::now();
                Ok(existing.clone())
            }
            None => {
                let now = Utc::now();
                let stored = Job {
                    status: JobStatus::Queued,
                    retry_count: 0,
                    build_size: None,
                    build_duration: None,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                    ..job.clone()
                };
                jobs.insert(stored.id.clone(), stored.clone());
                Ok(stored)
            }
        }
    }

    async fn update_status(&self, id: &BuildId, update: &StatusUpdate) -> DbResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
        job.apply(update, Utc::now()).map_err(|e| match e {
            shipit_core::Error::InvalidTransition { from, to } => {
                DbError::InvalidTransition { from, to }
            }
            other => DbError::Decode(other.to_string()),
        })?;
        Ok(job.clone())
    }

    async fn get(&self, id: &BuildId) -> DbResult<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self, limit: i64) -> DbResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(id: &str) -> Job {
        let mut env_vars = BTreeMap::new();
        env_vars.insert("NODE_ENV".to_string(), "production".to_string());
        Job::new(
            BuildId::parse(id).unwrap(),
            "https://example.com/site.git",
            Some("user-1".to_string()),
            env_vars,
        )
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryJobStore::new();
        let inserted = store.insert(&job("a1")).await.unwrap();
        assert_eq!(inserted.status, JobStatus::Queued);
        assert_eq!(inserted.retry_count, 0);

        let fetched = store.get(&inserted.id).await.unwrap();
        assert_eq!(fetched.repo_url, "https://example.com/site.git");
        assert_eq!(fetched.env_vars["NODE_ENV"], "production");
    }

    #[tokio::test]
    async fn test_insert_duplicate_fails() {
        let store = MemoryJobStore::new();
        store.insert(&job("a1")).await.unwrap();
        assert!(matches!(
            store.insert(&job("a1")).await,
            Err(DbError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = MemoryJobStore::new();
        let id = BuildId::parse("nope").unwrap();
        assert!(matches!(store.get(&id).await, Err(DbError::NotFound(_))));
        assert!(matches!(
            store.update_status(&id, &StatusUpdate::Started).await,
            Err(DbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_upsert_only_while_queued() {
        let store = MemoryJobStore::new();
        store.upsert(&job("a1")).await.unwrap();

        let mut changed = job("a1");
        changed.repo_url = "https://example.com/other.git".to_string();
        let updated = store.upsert(&changed).await.unwrap();
        assert_eq!(updated.repo_url, "https://example.com/other.git");

        store
            .update_status(&changed.id, &StatusUpdate::Started)
            .await
            .unwrap();
        assert!(matches!(
            store.upsert(&changed).await,
            Err(DbError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_writer_is_rejected() {
        let store = MemoryJobStore::new();
        let id = store.insert(&job("a1")).await.unwrap().id;
        store.update_status(&id, &StatusUpdate::Started).await.unwrap();
        store
            .update_status(
                &id,
                &StatusUpdate::Succeeded {
                    size: 10,
                    duration_ms: 20,
                },
            )
            .await
            .unwrap();

        let err = store
            .update_status(&id, &StatusUpdate::Started)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition {
                from: JobStatus::Success,
                to: JobStatus::Running
            }
        ));
        let job = store.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.build_size, Some(10));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let store = MemoryJobStore::new();
        store.insert(&job("first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store.insert(&job("second")).await.unwrap();

        let jobs = store.list(10).await.unwrap();
        assert_eq!(jobs[0].id.as_str(), "second");
        assert_eq!(store.list(1).await.unwrap().len(), 1);
    }

    fn status_update() -> impl Strategy<Value = StatusUpdate> {
        prop_oneof![
            Just(StatusUpdate::Started),
            (0i64..10_000, 0i64..10_000).prop_map(|(size, duration_ms)| {
                StatusUpdate::Succeeded { size, duration_ms }
            }),
            "[a-z ]{1,12}".prop_map(|message| StatusUpdate::RetryableFailure { message }),
            "[a-z ]{1,12}".prop_map(|message| StatusUpdate::PermanentFailure { message }),
            Just(StatusUpdate::Requeued),
        ]
    }

    proptest! {
        #[test]
        fn random_updates_never_take_illegal_edges(
            updates in proptest::collection::vec(status_update(), 0..40)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = MemoryJobStore::new();
                let id = store.insert(&job("prop")).await.unwrap().id;
                let mut retryable_failures = 0u32;

                for update in &updates {
                    let before = store.get(&id).await.unwrap();
                    let legal = before.status.can_transition_to(update.target());
                    let result = store.update_status(&id, update).await;
                    let after = store.get(&id).await.unwrap();

                    if legal {
                        prop_assert!(result.is_ok());
                        prop_assert_eq!(after.status, update.target());
                        if matches!(update, StatusUpdate::RetryableFailure { .. }) {
                            retryable_failures += 1;
                        }
                    } else {
                        let is_invalid_transition =
                            matches!(result, Err(DbError::InvalidTransition { .. }));
                        prop_assert!(is_invalid_transition);
                        prop_assert_eq!(&after, &before);
                    }
                    prop_assert_eq!(after.retry_count, retryable_failures);
                    if after.status == JobStatus::Success {
                        prop_assert!(after.error_message.is_none());
                        prop_assert!(after.build_size.is_some());
                    }
                }
                Ok(())
            })?;
        }
    }

    async fn pg_store() -> PgJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = crate::create_pool(&url, 2).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        PgJobStore::new(pool)
    }

    #[tokio::test]
    #[ignore = "requires Postgres (DATABASE_URL)"]
    async fn test_pg_lifecycle() {
        let store = pg_store().await;
        let new = job(&format!("pg-{}", uuid::Uuid::new_v4().simple()));
        let id = store.insert(&new).await.unwrap().id;
        assert!(matches!(store.insert(&new).await, Err(DbError::Duplicate(_))));

        store.update_status(&id, &StatusUpdate::Started).await.unwrap();
        let failed = store
            .update_status(
                &id,
                &StatusUpdate::RetryableFailure {
                    message: "ECONNRESET".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.error_message.as_deref(), Some("ECONNRESET"));

        let err = store
            .update_status(
                &id,
                &StatusUpdate::Succeeded {
                    size: 1,
                    duration_ms: 1,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DbError::InvalidTransition {
                from: JobStatus::RetryableFailed,
                to: JobStatus::Success
            }
        ));

        let requeued = store.update_status(&id, &StatusUpdate::Requeued).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.error_message.as_deref(), Some("ECONNRESET"));
    }
}
