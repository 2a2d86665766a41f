use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::NEW_JOB_CHANNEL;
use crate::error::{Error, Result};
use crate::jobs::{Job, JobsRepo};
use crate::queues::QueuesRepo;
use crate::ssh::{OutputChunk, RemoteExecutor};

/// Lifecycle notifications for observers. Handlers subscribe through
/// [`Worker::subscribe`]; a worker with no subscribers emits into the
/// void at no cost.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    JobStarted(Job),
    JobCompleted(Job),
    JobFailed { job: Job, error: String },
    JobStalled(Vec<Job>),
    Paused,
    Resumed,
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub queue_name: String,
    pub concurrency: usize,
    pub poll_interval_ms: u64,
    pub stalled_timeout_ms: i64,
}

impl WorkerOptions {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            concurrency: 1,
            poll_interval_ms: 5_000,
            stalled_timeout_ms: 60_000,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.queue_name.trim().is_empty() {
            return Err(Error::Config("queue_name must not be empty".into()));
        }
        if self.concurrency < 1 {
            return Err(Error::Config("concurrency must be >= 1".into()));
        }
        if self.poll_interval_ms < 1 {
            return Err(Error::Config("poll_interval_ms must be >= 1".into()));
        }
        if self.stalled_timeout_ms < 1 {
            return Err(Error::Config("stalled_timeout_ms must be >= 1".into()));
        }
        Ok(())
    }
}

/// The scheduling engine: leases batches of PENDING jobs, dispatches them
/// to the remote executor with bounded concurrency, records terminal
/// states, sweeps stalls, and sleeps between iterations unless a
/// `new_job` notification arrives first.
///
/// Clones share one engine; a worker runs until [`Worker::stop`].
pub struct Worker<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Worker<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<E> {
    pool: PgPool,
    jobs: JobsRepo,
    queues: QueuesRepo,
    executor: E,
    opts: WorkerOptions,
    events: broadcast::Sender<WorkerEvent>,
    /// Signal-and-forget wake-up: any number of notifications between
    /// loop iterations collapse into a single permit.
    wake: Notify,
    running: AtomicBool,
    active: AtomicUsize,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: RemoteExecutor + 'static> Worker<E> {
    pub fn new(pool: PgPool, executor: E, opts: WorkerOptions) -> Result<Self> {
        opts.validate()?;
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            inner: Arc::new(Inner {
                jobs: JobsRepo::new(pool.clone()),
                queues: QueuesRepo::new(pool.clone()),
                pool,
                executor,
                opts,
                events,
                wake: Notify::new(),
                running: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Connect and verify the remote host, requeue jobs stalled by prior
    /// crashes, then launch the listener and the scheduling loop. A
    /// failing SSH handshake or connection test refuses the start.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.try_start().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn try_start(&self) -> Result<()> {
        let inner = &self.inner;

        inner.executor.connect().await?;
        if !inner.executor.test_connection().await? {
            return Err(Error::Unreachable);
        }
        let info = inner.executor.server_info().await?;
        info!(
            queue = %inner.opts.queue_name,
            hostname = %info.hostname,
            uptime = %info.uptime,
            "worker connected to remote host"
        );

        inner.queues.ensure(&inner.opts.queue_name, None).await?;

        let requeued = inner.queues.retry_stalled_jobs(&inner.opts.queue_name).await?;
        if requeued > 0 {
            info!(requeued, "requeued stalled jobs from a previous run");
        }

        let listener = tokio::spawn(listen_for_jobs(Arc::clone(&self.inner)));
        let scheduler = tokio::spawn(run_loop(Arc::clone(&self.inner)));

        let mut tasks = lock_tasks(&inner.tasks);
        tasks.push(listener);
        tasks.push(scheduler);

        Ok(())
    }

    /// Stop leasing, cancel in-flight executions, wait for dispatched
    /// jobs to settle, disconnect. Jobs interrupted mid-flight are left
    /// RUNNING for stall recovery.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if !inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        inner.shutdown.cancel();
        inner.wake.notify_one();

        let handles: Vec<_> = lock_tasks(&inner.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        while inner.active.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        if let Err(e) = inner.executor.disconnect().await {
            warn!(error = %e, "ssh disconnect failed");
        }
        info!(queue = %inner.opts.queue_name, "worker stopped");
    }

    pub async fn pause(&self) -> Result<()> {
        self.inner.queues.pause(&self.inner.opts.queue_name).await?;
        let _ = self.inner.events.send(WorkerEvent::Paused);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.inner.queues.resume(&self.inner.opts.queue_name).await?;
        let _ = self.inner.events.send(WorkerEvent::Resumed);
        Ok(())
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }
}

fn lock_tasks(tasks: &Mutex<Vec<JoinHandle<()>>>) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Dedicated LISTEN connection. Channels are connection-scoped, so this
/// lives outside the transactional pool; on error it backs off and
/// resubscribes rather than taking the worker down.
async fn listen_for_jobs<E: RemoteExecutor + 'static>(inner: Arc<Inner<E>>) {
    while inner.running.load(Ordering::SeqCst) {
        match PgListener::connect_with(&inner.pool).await {
            Ok(mut listener) => match listener.listen(NEW_JOB_CHANNEL).await {
                Ok(()) => loop {
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => return,
                        message = listener.recv() => match message {
                            Ok(_) => {
                                inner.wake.notify_one();
                            }
                            Err(e) => {
                                warn!(error = %e, "notification connection dropped, resubscribing");
                                break;
                            }
                        }
                    }
                },
                Err(e) => warn!(error = %e, "LISTEN failed"),
            },
            Err(e) => warn!(error = %e, "could not open notification connection"),
        }

        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
    }
}

async fn run_loop<E: RemoteExecutor + 'static>(inner: Arc<Inner<E>>) {
    while inner.running.load(Ordering::SeqCst) {
        sweep_stalled(&inner).await;
        fill_slots(&inner).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(inner.opts.poll_interval_ms)) => {}
            _ = inner.wake.notified() => {}
            _ = inner.shutdown.cancelled() => {}
        }
    }
}

async fn sweep_stalled<E: RemoteExecutor + 'static>(inner: &Arc<Inner<E>>) {
    match inner
        .queues
        .mark_stalled_jobs(&inner.opts.queue_name, inner.opts.stalled_timeout_ms)
        .await
    {
        Ok(stalled) if !stalled.is_empty() => {
            warn!(count = stalled.len(), "marked stalled jobs");
            let _ = inner.events.send(WorkerEvent::JobStalled(stalled));
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "stall sweep failed"),
    }
}

/// Lease up to the number of free concurrency slots and dispatch each
/// leased job on its own task. The in-memory slot count is best-effort;
/// correctness rests on the lease statement itself.
async fn fill_slots<E: RemoteExecutor + 'static>(inner: &Arc<Inner<E>>) {
    let slots = inner
        .opts
        .concurrency
        .saturating_sub(inner.active.load(Ordering::SeqCst));
    if slots == 0 {
        return;
    }

    let lock_token = Uuid::new_v4().to_string();
    match inner
        .jobs
        .lease_jobs(&inner.opts.queue_name, &lock_token, slots as i64)
        .await
    {
        Ok(leased) => {
            for job in leased {
                inner.active.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(dispatch(Arc::clone(inner), job));
            }
        }
        Err(e) => warn!(error = %e, "lease query failed"),
    }
}

async fn dispatch<E: RemoteExecutor + 'static>(inner: Arc<Inner<E>>, job: Job) {
    info!(
        job_id = job.id,
        name = %job.name,
        attempt = job.attempts_made,
        "job started"
    );
    let _ = inner.events.send(WorkerEvent::JobStarted(job.clone()));

    let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
    let log_writer = {
        let jobs = inner.jobs.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let line = match chunk {
                    OutputChunk::Stdout(text) => format!("[stdout] {text}"),
                    OutputChunk::Stderr(text) => format!("[stderr] {text}"),
                };
                if let Err(e) = jobs.add_log(job_id, &line).await {
                    warn!(job_id, error = %e, "failed to append job log");
                }
            }
        })
    };

    let cancel = inner.shutdown.child_token();
    let result = inner
        .executor
        .execute_with_timeout(&job, chunk_tx, cancel)
        .await;
    // The executor dropped its sender; drain remaining chunks before the
    // terminal transition so logs never trail a finished job.
    let _ = log_writer.await;

    if let Err(e) = record_outcome(&inner, &job, result).await {
        error!(job_id = job.id, error = %e, "failed to record job outcome");
    }

    inner.active.fetch_sub(1, Ordering::SeqCst);
    inner.wake.notify_one();
}

async fn record_outcome<E: RemoteExecutor + 'static>(
    inner: &Arc<Inner<E>>,
    job: &Job,
    result: Result<crate::ssh::ExecResult>,
) -> Result<()> {
    match result {
        Ok(exec) if exec.exit_code == 0 => {
            let updated = inner
                .jobs
                .move_to_completed(job.id, exec.exit_code, &exec.stdout, &exec.stderr)
                .await?;
            info!(job_id = job.id, duration_ms = exec.duration_ms, "job completed");
            let _ = inner.events.send(WorkerEvent::JobCompleted(updated));
        }
        Ok(exec) => {
            let reason = format!("command exited with code {}", exec.exit_code);
            let updated = inner
                .jobs
                .move_to_failed(
                    job.id,
                    &reason,
                    None,
                    Some(exec.exit_code),
                    Some(&exec.stdout),
                    Some(&exec.stderr),
                )
                .await?;
            warn!(job_id = job.id, exit_code = exec.exit_code, "job failed");
            let _ = inner.events.send(WorkerEvent::JobFailed {
                job: updated,
                error: reason,
            });
        }
        Err(Error::Cancelled) => {
            // Worker shutdown, not a job fault: leave the row RUNNING so
            // the stall sweep of a live worker reclaims it.
            warn!(job_id = job.id, "job abandoned to stall recovery");
        }
        Err(e) => {
            let reason = e.to_string();
            let updated = inner
                .jobs
                .move_to_failed(job.id, &reason, None, None, None, None)
                .await?;
            warn!(job_id = job.id, error = %reason, "job failed");
            let _ = inner.events.send(WorkerEvent::JobFailed {
                job: updated,
                error: reason,
            });
        }
    }

    Ok(())
}
