use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::db::notify_new_job;
use crate::error::{Error, Result};
use crate::jobs::model::{Job, JobLog, JobOptions, JobStatus};
use crate::queues::{Queue, QueueStatus};

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // ----------------------------
    // Insert path
    // ----------------------------

    /// Insert a PENDING job into `queue`, merging `overrides` with the
    /// queue's `default_job_options`, and publish a `new_job` hint.
    ///
    /// The queue row is locked first so a concurrent pause cannot race the
    /// insert; a PAUSED queue rejects the job outright.
    pub async fn create(
        &self,
        queue: &str,
        name: &str,
        command: &str,
        args: &[String],
        overrides: Option<&Value>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        let queue_row = sqlx::query_as::<_, Queue>("SELECT * FROM queue WHERE name = $1 FOR UPDATE")
            .bind(queue)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        if queue_row.status == QueueStatus::Paused.as_str() {
            return Err(Error::QueuePaused(queue.to_string()));
        }

        let options = JobOptions::merged(queue_row.default_job_options.as_ref(), overrides)?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            INSERT INTO job (
                custom_id, name, command, args, working_dir, timeout,
                priority, max_attempts, keep_logs, queue_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(&options.custom_id)
        .bind(name)
        .bind(command)
        .bind(Json(args.to_vec()))
        .bind(&options.working_dir)
        .bind(options.timeout)
        .bind(options.priority)
        .bind(options.max_attempts)
        .bind(options.keep_logs)
        .bind(queue_row.id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_custom_id_conflict(e, options.custom_id.as_deref()))?;

        notify_new_job(&mut *tx, name).await?;
        tx.commit().await?;

        Ok(job)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM job WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    pub async fn get_job_by_custom_id(&self, custom_id: &str) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM job WHERE custom_id = $1")
            .bind(custom_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    /// Recent-first view of a queue's jobs for an embedding front-end.
    pub async fn list_jobs(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: i64,
    ) -> Result<Vec<Job>> {
        let limit = limit.clamp(1, 500);

        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT j.*
                    FROM job j
                    JOIN queue q ON q.id = j.queue_id
                    WHERE q.name = $1 AND j.status = $2
                    ORDER BY j.created_at DESC, j.id DESC
                    LIMIT $3
                    "#,
                )
                .bind(queue)
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Job>(
                    r#"
                    SELECT j.*
                    FROM job j
                    JOIN queue q ON q.id = j.queue_id
                    WHERE q.name = $1
                    ORDER BY j.created_at DESC, j.id DESC
                    LIMIT $2
                    "#,
                )
                .bind(queue)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(jobs)
    }

    // ----------------------------
    // Leasing
    // ----------------------------

    /// Atomically claim up to `limit` PENDING jobs of `queue` for
    /// `lock_token`.
    ///
    /// The CTE selects with FOR UPDATE SKIP LOCKED and the UPDATE happens
    /// in the same statement, so under any number of concurrent workers
    /// each row is returned to exactly one of them.
    pub async fn lease_jobs(&self, queue: &str, lock_token: &str, limit: i64) -> Result<Vec<Job>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }

        let mut jobs = sqlx::query_as::<_, Job>(
            r#"
            WITH next AS (
                SELECT id FROM job
                WHERE status = 'PENDING'
                  AND queue_id = (SELECT id FROM queue WHERE name = $1)
                  AND lock_token IS NULL
                ORDER BY priority ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE job
            SET status = 'RUNNING',
                lock_token = $3,
                processed_on = now(),
                attempts_made = attempts_made + 1,
                updated_at = now()
            WHERE id IN (SELECT id FROM next)
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(lock_token)
        .fetch_all(&self.pool)
        .await?;

        // UPDATE .. RETURNING does not preserve the CTE's ordering.
        jobs.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });

        Ok(jobs)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    /// PENDING -> RUNNING for single-worker flows and tests. The batched
    /// lease path performs this transition inside the lease statement.
    pub async fn move_to_running(&self, id: i64, lock_token: &str) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let current = lock_job(&mut tx, id).await?;
        expect_status(&current, JobStatus::Pending)?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE job
            SET status = 'RUNNING',
                lock_token = $2,
                processed_on = now(),
                attempts_made = attempts_made + 1,
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(lock_token)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// RUNNING -> COMPLETED with the captured result.
    pub async fn move_to_completed(
        &self,
        id: i64,
        exit_code: i32,
        std_out: &str,
        std_err: &str,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let current = lock_job(&mut tx, id).await?;
        expect_status(&current, JobStatus::Running)?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE job
            SET status = 'COMPLETED',
                exit_code = $2,
                std_out = $3,
                std_err = $4,
                lock_token = NULL,
                finished_on = now(),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(exit_code)
        .bind(std_out)
        .bind(std_err)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    /// RUNNING -> PENDING (retry) while attempts remain, otherwise
    /// RUNNING -> FAILED.
    ///
    /// The retry branch preserves `attempts_made` — leases count attempts,
    /// the failure itself does not — and republishes `new_job` so an idle
    /// worker picks the row up again without waiting out a poll interval.
    pub async fn move_to_failed(
        &self,
        id: i64,
        reason: &str,
        stack_trace: Option<&str>,
        exit_code: Option<i32>,
        std_out: Option<&str>,
        std_err: Option<&str>,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let current = lock_job(&mut tx, id).await?;
        expect_status(&current, JobStatus::Running)?;

        let job = if current.attempts_made < current.max_attempts {
            let job = sqlx::query_as::<_, Job>(
                r#"
                UPDATE job
                SET status = 'PENDING',
                    lock_token = NULL,
                    processed_on = NULL,
                    finished_on = NULL,
                    failed_reason = NULL,
                    stack_trace = NULL,
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

            notify_new_job(&mut *tx, &current.name).await?;
            job
        } else {
            sqlx::query_as::<_, Job>(
                r#"
                UPDATE job
                SET status = 'FAILED',
                    failed_reason = $2,
                    stack_trace = $3,
                    exit_code = $4,
                    std_out = $5,
                    std_err = $6,
                    lock_token = NULL,
                    finished_on = now(),
                    updated_at = now()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(reason)
            .bind(stack_trace)
            .bind(exit_code)
            .bind(std_out)
            .bind(std_err)
            .fetch_one(&mut *tx)
            .await?
        };

        tx.commit().await?;
        Ok(job)
    }

    /// PENDING -> CANCELLED. Running jobs cannot be cancelled.
    pub async fn move_to_cancelled(&self, id: i64, reason: &str) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let current = lock_job(&mut tx, id).await?;
        expect_status(&current, JobStatus::Pending)?;

        let job = sqlx::query_as::<_, Job>(
            r#"
            UPDATE job
            SET status = 'CANCELLED',
                failed_reason = $2,
                finished_on = now(),
                updated_at = now()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(reason)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(job)
    }

    // ----------------------------
    // Logs
    // ----------------------------

    /// Append one log row for `job_id` and trim to the newest `keep_logs`.
    ///
    /// The parent job row is locked first: the SSH transport fires stdout
    /// and stderr callbacks concurrently, and the row lock is what keeps
    /// `sequence` dense and gap-free under those interleavings.
    pub async fn add_log(&self, job_id: i64, message: &str) -> Result<JobLog> {
        let mut tx = self.pool.begin().await?;

        let keep_logs: i32 =
            sqlx::query_scalar("SELECT keep_logs FROM job WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(Error::JobNotFound(job_id))?;

        let sequence: i32 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) + 1 FROM job_log WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *tx)
        .await?;

        let log = sqlx::query_as::<_, JobLog>(
            r#"
            INSERT INTO job_log (id, job_id, message, sequence)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(job_id)
        .bind(message)
        .bind(sequence)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM job_log WHERE job_id = $1 AND sequence <= $2")
            .bind(job_id)
            .bind(sequence - keep_logs)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(log)
    }

    pub async fn get_logs(&self, job_id: i64, limit: Option<i64>) -> Result<Vec<JobLog>> {
        let logs = match limit {
            Some(limit) => {
                sqlx::query_as::<_, JobLog>(
                    "SELECT * FROM job_log WHERE job_id = $1 ORDER BY sequence ASC LIMIT $2",
                )
                .bind(job_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobLog>(
                    "SELECT * FROM job_log WHERE job_id = $1 ORDER BY sequence ASC",
                )
                .bind(job_id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(logs)
    }
}

async fn lock_job(tx: &mut Transaction<'_, Postgres>, id: i64) -> Result<Job> {
    sqlx::query_as::<_, Job>("SELECT * FROM job WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(Error::JobNotFound(id))
}

fn expect_status(job: &Job, expected: JobStatus) -> Result<()> {
    if job.status != expected.as_str() {
        return Err(Error::InvalidTransition {
            id: job.id,
            actual: job.status.clone(),
            expected: expected.as_str(),
        });
    }
    Ok(())
}

fn map_custom_id_conflict(err: sqlx::Error, custom_id: Option<&str>) -> Error {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.constraint() == Some("job_custom_id_key") {
            return Error::DuplicateCustomId(custom_id.unwrap_or_default().to_string());
        }
    }
    err.into()
}
