mod common;

use std::collections::HashSet;

use common::{add_job, add_job_with, create_queue, setup_db};
use serde_json::json;
use serial_test::serial;
use sshflow::JobsRepo;

#[tokio::test]
#[serial]
async fn two_workers_never_lease_the_same_job() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    add_job(&pool, "default", "solo", "echo").await;

    let repo = JobsRepo::new(pool.clone());

    let (a, b) = tokio::join!(
        repo.lease_jobs("default", "token-a", 1),
        repo.lease_jobs("default", "token-b", 1),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    // XOR: exactly one worker wins the row.
    assert!(
        (a.len() == 1) ^ (b.len() == 1),
        "expected exactly one lease, got a={} b={}",
        a.len(),
        b.len()
    );

    let winner = a.into_iter().chain(b).next().unwrap();
    assert_eq!(winner.status, "RUNNING");
    assert!(
        winner.lock_token.as_deref() == Some("token-a")
            || winner.lock_token.as_deref() == Some("token-b")
    );
}

#[tokio::test]
#[serial]
async fn lease_sets_running_fields_and_counts_the_attempt() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job(&pool, "default", "build", "make").await;

    assert_eq!(job.status, "PENDING");
    assert_eq!(job.attempts_made, 0);

    let repo = JobsRepo::new(pool.clone());
    let leased = repo.lease_jobs("default", "token-a", 5).await.unwrap();

    assert_eq!(leased.len(), 1);
    let leased = &leased[0];
    assert_eq!(leased.id, job.id);
    assert_eq!(leased.status, "RUNNING");
    assert_eq!(leased.lock_token.as_deref(), Some("token-a"));
    assert!(leased.processed_on.is_some());
    assert_eq!(leased.attempts_made, 1);
}

#[tokio::test]
#[serial]
async fn lease_batch_is_ordered_by_priority_then_age() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;

    let low = add_job_with(&pool, "default", "low", "true", json!({ "priority": 10 })).await;
    let high = add_job_with(&pool, "default", "high", "true", json!({ "priority": -5 })).await;
    let mid_old = add_job_with(&pool, "default", "mid-old", "true", json!({ "priority": 0 })).await;
    let mid_new = add_job_with(&pool, "default", "mid-new", "true", json!({ "priority": 0 })).await;

    let repo = JobsRepo::new(pool.clone());
    let leased = repo.lease_jobs("default", "token-a", 10).await.unwrap();

    let ids: Vec<i64> = leased.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![high.id, mid_old.id, mid_new.id, low.id]);
}

#[tokio::test]
#[serial]
async fn lease_batches_are_disjoint() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    for i in 0..5 {
        add_job(&pool, "default", &format!("job-{i}"), "true").await;
    }

    let repo = JobsRepo::new(pool.clone());

    let first = repo.lease_jobs("default", "token-1", 3).await.unwrap();
    assert_eq!(first.len(), 3);

    let second = repo.lease_jobs("default", "token-2", 3).await.unwrap();
    assert_eq!(second.len(), 2);

    let first_ids: HashSet<i64> = first.iter().map(|j| j.id).collect();
    let second_ids: HashSet<i64> = second.iter().map(|j| j.id).collect();
    assert!(
        first_ids.is_disjoint(&second_ids),
        "a job was leased in two batches"
    );
}

#[tokio::test]
#[serial]
async fn lease_only_touches_the_requested_queue() {
    let pool = setup_db().await;
    create_queue(&pool, "queue-a").await;
    create_queue(&pool, "queue-b").await;
    let in_a = add_job(&pool, "queue-a", "a1", "true").await;
    let in_b = add_job(&pool, "queue-b", "b1", "true").await;

    let repo = JobsRepo::new(pool.clone());

    let leased = repo.lease_jobs("queue-a", "token-a", 10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, in_a.id);

    let other = repo.get_job(in_b.id).await.unwrap().unwrap();
    assert_eq!(other.status, "PENDING");
    assert_eq!(other.lock_token, None);
}

#[tokio::test]
#[serial]
async fn zero_slots_lease_nothing() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    add_job(&pool, "default", "idle", "true").await;

    let repo = JobsRepo::new(pool.clone());
    let leased = repo.lease_jobs("default", "token-a", 0).await.unwrap();
    assert!(leased.is_empty());
}
