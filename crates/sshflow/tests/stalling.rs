mod common;

use common::{add_job, create_queue, fetch_job, setup_db};
use serial_test::serial;
use sqlx::PgPool;
use sshflow::{JobsRepo, QueuesRepo};

async fn rewind_processed_on(pool: &PgPool, id: i64, seconds: i64) {
    sqlx::query("UPDATE job SET processed_on = now() - ($2::bigint * interval '1 second') WHERE id = $1")
        .bind(id)
        .bind(seconds)
        .execute(pool)
        .await
        .expect("failed to rewind processed_on");
}

#[tokio::test]
#[serial]
async fn stalled_jobs_are_marked_then_retried() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job(&pool, "default", "lost", "sleep").await;

    let jobs = JobsRepo::new(pool.clone());
    let queues = QueuesRepo::new(pool.clone());

    jobs.move_to_running(job.id, "token-a").await.unwrap();
    rewind_processed_on(&pool, job.id, 100).await;

    let stalled = queues.mark_stalled_jobs("default", 5_000).await.unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, job.id);
    assert_eq!(stalled[0].status, "STALLED");
    assert_eq!(stalled[0].lock_token, None);

    let requeued = queues.retry_stalled_jobs("default").await.unwrap();
    assert_eq!(requeued, 1);

    let pending = fetch_job(&pool, job.id).await;
    assert_eq!(pending.status, "PENDING");
    assert_eq!(pending.processed_on, None);
    assert_eq!(pending.attempts_made, 1);

    // The row is leasable again; the second lease counts a second attempt.
    let leased = jobs.lease_jobs("default", "token-b", 1).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].attempts_made, 2);
}

#[tokio::test]
#[serial]
async fn fresh_running_jobs_survive_the_sweep() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job(&pool, "default", "busy", "sleep").await;

    JobsRepo::new(pool.clone())
        .move_to_running(job.id, "token-a")
        .await
        .unwrap();

    let stalled = QueuesRepo::new(pool.clone())
        .mark_stalled_jobs("default", 60_000)
        .await
        .unwrap();
    assert!(stalled.is_empty());

    let untouched = fetch_job(&pool, job.id).await;
    assert_eq!(untouched.status, "RUNNING");
    assert_eq!(untouched.lock_token.as_deref(), Some("token-a"));
}

#[tokio::test]
#[serial]
async fn retrying_an_empty_stalled_set_is_a_noop() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    add_job(&pool, "default", "calm", "true").await;

    let requeued = QueuesRepo::new(pool.clone())
        .retry_stalled_jobs("default")
        .await
        .unwrap();
    assert_eq!(requeued, 0);
}

#[tokio::test]
#[serial]
async fn the_sweep_is_scoped_to_one_queue() {
    let pool = setup_db().await;
    create_queue(&pool, "queue-a").await;
    create_queue(&pool, "queue-b").await;
    let in_a = add_job(&pool, "queue-a", "a1", "sleep").await;
    let in_b = add_job(&pool, "queue-b", "b1", "sleep").await;

    let jobs = JobsRepo::new(pool.clone());
    jobs.move_to_running(in_a.id, "token-a").await.unwrap();
    jobs.move_to_running(in_b.id, "token-b").await.unwrap();
    rewind_processed_on(&pool, in_a.id, 100).await;
    rewind_processed_on(&pool, in_b.id, 100).await;

    let stalled = QueuesRepo::new(pool.clone())
        .mark_stalled_jobs("queue-a", 5_000)
        .await
        .unwrap();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].id, in_a.id);

    let other = fetch_job(&pool, in_b.id).await;
    assert_eq!(other.status, "RUNNING");
}
