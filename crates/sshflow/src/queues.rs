use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use crate::db::notify_new_job;
use crate::error::{Error, Result};
use crate::jobs::model::JobOptions;
use crate::jobs::{Job, JobsRepo};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub status: String,
    pub default_job_options: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Active,
    Paused,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Active => "ACTIVE",
            QueueStatus::Paused => "PAUSED",
        }
    }
}

/// Job counts grouped by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub stalled: i64,
    pub cancelled: i64,
}

#[derive(Clone)]
pub struct QueuesRepo {
    pool: PgPool,
}

impl QueuesRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Lifecycle
    // ----------------------------

    /// Fetch the queue row, lazily inserting it if absent. Existing rows
    /// keep their stored defaults; `default_options` only seeds new rows.
    pub async fn ensure(&self, name: &str, default_options: Option<&Value>) -> Result<Queue> {
        if let Some(options) = default_options {
            // Reject malformed defaults before they are persisted.
            JobOptions::merged(Some(options), None)?;
        }

        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, Queue>("SELECT * FROM queue WHERE name = $1 FOR UPDATE")
            .bind(name)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(queue) = existing {
            tx.commit().await?;
            return Ok(queue);
        }

        sqlx::query(
            r#"
            INSERT INTO queue (name, default_job_options)
            VALUES ($1, $2)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(name)
        .bind(default_options.cloned())
        .execute(&mut *tx)
        .await?;

        let queue = sqlx::query_as::<_, Queue>("SELECT * FROM queue WHERE name = $1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(queue)
    }

    pub async fn get(&self, name: &str) -> Result<Option<Queue>> {
        let queue = sqlx::query_as::<_, Queue>("SELECT * FROM queue WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(queue)
    }

    /// Delete the queue; its jobs and their logs go with it (cascade).
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ----------------------------
    // Insert path
    // ----------------------------

    /// Add a job to this queue. Rejects when the queue is PAUSED; already
    /// leased jobs are unaffected by pausing.
    pub async fn add(
        &self,
        queue: &str,
        name: &str,
        command: &str,
        args: &[String],
        overrides: Option<&Value>,
    ) -> Result<Job> {
        JobsRepo::new(self.pool.clone())
            .create(queue, name, command, args, overrides)
            .await
    }

    // ----------------------------
    // Pause / resume
    // ----------------------------

    pub async fn pause(&self, name: &str) -> Result<Queue> {
        let queue = sqlx::query_as::<_, Queue>(
            r#"
            UPDATE queue
            SET status = 'PAUSED',
                paused_at = now(),
                updated_at = now()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        Ok(queue)
    }

    pub async fn resume(&self, name: &str) -> Result<Queue> {
        let queue = sqlx::query_as::<_, Queue>(
            r#"
            UPDATE queue
            SET status = 'ACTIVE',
                paused_at = NULL,
                updated_at = now()
            WHERE name = $1
            RETURNING *
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::QueueNotFound(name.to_string()))?;

        Ok(queue)
    }

    // ----------------------------
    // Statistics
    // ----------------------------

    pub async fn get_stats(&self, name: &str) -> Result<QueueStats> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            r#"
            SELECT j.status, COUNT(*)
            FROM job j
            JOIN queue q ON q.id = j.queue_id
            WHERE q.name = $1
            GROUP BY j.status
            "#,
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match status.as_str() {
                "PENDING" => stats.pending = count,
                "RUNNING" => stats.running = count,
                "COMPLETED" => stats.completed = count,
                "FAILED" => stats.failed = count,
                "STALLED" => stats.stalled = count,
                "CANCELLED" => stats.cancelled = count,
                _ => {}
            }
        }

        Ok(stats)
    }

    // ----------------------------
    // Stall handling
    // ----------------------------

    /// Move RUNNING jobs whose `processed_on` is older than `threshold_ms`
    /// to STALLED and drop their lease.
    ///
    /// SKIP LOCKED keeps the sweep from blocking on (or clobbering) a row
    /// whose worker is committing a transition at this moment.
    pub async fn mark_stalled_jobs(&self, name: &str, threshold_ms: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            WITH stalled AS (
                SELECT j.id
                FROM job j
                JOIN queue q ON q.id = j.queue_id
                WHERE q.name = $1
                  AND j.status = 'RUNNING'
                  AND j.processed_on < now() - ($2::bigint * interval '1 millisecond')
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE job
            SET status = 'STALLED',
                lock_token = NULL,
                updated_at = now()
            WHERE id IN (SELECT id FROM stalled)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(threshold_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    /// Rearm every STALLED job of this queue as PENDING and republish the
    /// wake-up hint. Returns the number of jobs requeued; a no-op on an
    /// empty STALLED set.
    pub async fn retry_stalled_jobs(&self, name: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            WITH stalled AS (
                SELECT j.id
                FROM job j
                JOIN queue q ON q.id = j.queue_id
                WHERE q.name = $1
                  AND j.status = 'STALLED'
                FOR UPDATE OF j SKIP LOCKED
            )
            UPDATE job
            SET status = 'PENDING',
                lock_token = NULL,
                processed_on = NULL,
                updated_at = now()
            WHERE id IN (SELECT id FROM stalled)
            "#,
        )
        .bind(name)
        .execute(&mut *tx)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            notify_new_job(&mut *tx, name).await?;
        }

        tx.commit().await?;
        Ok(requeued)
    }
}
