use anyhow::Context;
use sshflow::{db, Config, SshExecutor, Worker, WorkerEvent};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env()?;

    let pool = db::make_pool(&cfg.database_url, cfg.pool_size()).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let executor = SshExecutor::new(cfg.remote.clone());
    let worker = Worker::new(pool, executor, cfg.worker_options())?;

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::JobCompleted(job)) => {
                    info!(job_id = job.id, name = %job.name, "completed");
                }
                Ok(WorkerEvent::JobFailed { job, error }) => {
                    warn!(job_id = job.id, name = %job.name, %error, "failed");
                }
                Ok(WorkerEvent::JobStalled(jobs)) => {
                    warn!(count = jobs.len(), "stalled");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    worker.start().await?;
    info!(
        queue = %cfg.queue_name,
        concurrency = cfg.worker_concurrency,
        "sshflow worker running, ctrl-c to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutting down");
    worker.stop().await;

    Ok(())
}
