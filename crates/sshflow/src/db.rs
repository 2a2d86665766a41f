use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Channel the insert path publishes on and workers LISTEN to.
pub const NEW_JOB_CHANNEL: &str = "new_job";

/// Pool for transactional work. Sized by the caller: the spec wants
/// `worker_concurrency + 2` so every in-flight job can append logs while
/// the scheduling loop still gets a connection.
pub async fn make_pool(database_url: &str, max_connections: u32) -> crate::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    Ok(pool)
}

pub async fn run_migrations(pool: &PgPool) -> crate::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Publish a wake-up hint on the `new_job` channel. The payload is opaque
/// to consumers. When called on an open transaction, Postgres delivers the
/// notification at commit, so listeners never see uncommitted jobs.
pub async fn notify_new_job<'e, E>(executor: E, payload: &str) -> sqlx::Result<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(NEW_JOB_CHANNEL)
        .bind(payload)
        .execute(executor)
        .await?;

    Ok(())
}
