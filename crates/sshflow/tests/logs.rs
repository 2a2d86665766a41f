mod common;

use common::{add_job, add_job_with, create_queue, setup_db};
use serde_json::json;
use serial_test::serial;
use sshflow::JobsRepo;

#[tokio::test]
#[serial]
async fn retention_keeps_only_the_newest_rows() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job_with(&pool, "default", "chatty", "true", json!({ "keepLogs": 3 })).await;

    let repo = JobsRepo::new(pool.clone());
    for i in 1..=5 {
        repo.add_log(job.id, &format!("log {i}")).await.unwrap();
    }

    let logs = repo.get_logs(job.id, None).await.unwrap();

    let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["log 3", "log 4", "log 5"]);

    // The survivors are the largest sequences, still consecutive.
    let sequences: Vec<i32> = logs.iter().map(|l| l.sequence).collect();
    assert_eq!(sequences, vec![3, 4, 5]);
}

#[tokio::test]
#[serial]
async fn logs_come_back_in_sequence_order_with_optional_limit() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job(&pool, "default", "ordered", "true").await;

    let repo = JobsRepo::new(pool.clone());
    for message in ["first", "second", "third", "fourth"] {
        repo.add_log(job.id, message).await.unwrap();
    }

    let truncated = repo.get_logs(job.id, Some(2)).await.unwrap();
    let messages: Vec<&str> = truncated.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["first", "second"]);
    assert_eq!(truncated[0].sequence, 1);
    assert_eq!(truncated[1].sequence, 2);
}

#[tokio::test]
#[serial]
async fn concurrent_appends_stay_dense() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job(&pool, "default", "streamy", "true").await;

    // Two writers racing, the way stdout and stderr callbacks do.
    let out = JobsRepo::new(pool.clone());
    let err = JobsRepo::new(pool.clone());
    let job_id = job.id;

    let (a, b) = tokio::join!(
        async {
            for i in 0..10 {
                out.add_log(job_id, &format!("[stdout] chunk {i}")).await?;
            }
            Ok::<_, sshflow::Error>(())
        },
        async {
            for i in 0..10 {
                err.add_log(job_id, &format!("[stderr] chunk {i}")).await?;
            }
            Ok::<_, sshflow::Error>(())
        },
    );
    a.unwrap();
    b.unwrap();

    let logs = JobsRepo::new(pool.clone()).get_logs(job_id, None).await.unwrap();
    assert_eq!(logs.len(), 20);

    let sequences: Vec<i32> = logs.iter().map(|l| l.sequence).collect();
    assert_eq!(sequences, (1..=20).collect::<Vec<i32>>());
}

#[tokio::test]
#[serial]
async fn each_append_trims_beyond_keep_logs() {
    let pool = setup_db().await;
    create_queue(&pool, "default").await;
    let job = add_job_with(&pool, "default", "bounded", "true", json!({ "keepLogs": 1 })).await;

    let repo = JobsRepo::new(pool.clone());
    repo.add_log(job.id, "one").await.unwrap();
    repo.add_log(job.id, "two").await.unwrap();

    let logs = repo.get_logs(job.id, None).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].message, "two");
    assert_eq!(logs[0].sequence, 2);
}
