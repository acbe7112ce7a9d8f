
use std::sync::Arc;
use std::time::Duration;

use jobconductor::board::{Board, BoardEvent, JobState};
use jobconductor::coordination::{Coordinator, MemoryNamespace};
use test_harness::{app_details, assert_eventually, per_queue_board, session, ROOT};

#[tokio::test]
async fn test_queue_subtree_created_on_first_post() {
    let namespace = MemoryNamespace::new();
    let client = session(&namespace);
    let board = per_queue_board(Arc::clone(&client)).await;

    let job = board.post("J1", None, app_details("app1")).await.unwrap();

    assert_eq!(
        job.path(),
        format!("{}/app1/job0000000000", ROOT),
        "jobs live under their queue's subtree"
    );
    assert_eq!(board.queue_path("app1"), format!("{}/app1", ROOT));
    assert_eq!(
        client.children(ROOT).await.unwrap(),
        vec!["app1".to_string()]
    );
    assert_eventually(
        || async { board.watched_queues() == vec!["app1".to_string()] },
        Duration::from_secs(2),
        "board should watch the new queue",
    )
    .await;
}

#[tokio::test]
async fn test_queues_created_after_connect_are_discovered() {
    let namespace = MemoryNamespace::new();
    let watcher = per_queue_board(session(&namespace)).await;
    let poster = per_queue_board(session(&namespace)).await;

    assert!(watcher.watched_queues().is_empty());

    poster.post("J1", None, app_details("app1")).await.unwrap();
    poster.post("K1", None, app_details("app2")).await.unwrap();

    assert_eventually(
        || async { watcher.watched_queues() == vec!["app1".to_string(), "app2".to_string()] },
        Duration::from_secs(2),
        "watching board should attach to both queues",
    )
    .await;
    assert_eventually(
        || async { watcher.job_count().await == 2 },
        Duration::from_secs(2),
        "watching board should learn both jobs without re-listing",
    )
    .await;

    // A later post into an already watched queue arrives through its watch.
    poster.post("J2", None, app_details("app1")).await.unwrap();
    assert_eventually(
        || async { watcher.job_count().await == 3 },
        Duration::from_secs(2),
        "watching board should see later posts",
    )
    .await;
}

#[tokio::test]
async fn test_watch_yields_jobs_in_sequence_order() {
    let namespace = MemoryNamespace::new();
    let watcher = per_queue_board(session(&namespace)).await;
    let poster = per_queue_board(session(&namespace)).await;
    let mut events = watcher.subscribe();

    let mut posted = Vec::new();
    for i in 0..5 {
        posted.push(
            poster
                .post(&format!("J{}", i), None, app_details("app1"))
                .await
                .unwrap(),
        );
    }

    let mut seen = Vec::new();
    while seen.len() < posted.len() {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Ok(BoardEvent::Posted(job))) => seen.push(job.sequence()),
            Ok(Ok(BoardEvent::Removed(_))) => {}
            other => panic!("expected Posted events, got {:?}", other),
        }
    }
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "discovered jobs must not go backwards");

    let listed: Vec<u64> = watcher
        .iterjobs(false, false)
        .collect()
        .await
        .unwrap()
        .iter()
        .map(|job| job.sequence())
        .collect();
    assert_eq!(listed, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_watches_rearm_after_session_loss() {
    let namespace = MemoryNamespace::new();
    let watcher_session = session(&namespace);
    let watcher = per_queue_board(Arc::clone(&watcher_session)).await;
    let poster = per_queue_board(session(&namespace)).await;

    poster.post("J1", None, app_details("app1")).await.unwrap();
    assert_eventually(
        || async { watcher.job_count().await == 1 },
        Duration::from_secs(2),
        "job should be known before the session loss",
    )
    .await;

    watcher_session.expire_session();

    // Both an existing queue and a brand new one keep being observed.
    poster.post("J2", None, app_details("app1")).await.unwrap();
    poster.post("K1", None, app_details("app2")).await.unwrap();
    assert_eventually(
        || async { watcher.job_count().await == 3 },
        Duration::from_secs(2),
        "watches should re-arm after the session is restored",
    )
    .await;
    assert_eq!(
        watcher.watched_queues(),
        vec!["app1".to_string(), "app2".to_string()]
    );
}

#[tokio::test]
async fn test_session_loss_releases_claims_not_jobs() {
    let namespace = MemoryNamespace::new();
    let owner_session = session(&namespace);
    let owner = per_queue_board(Arc::clone(&owner_session)).await;
    let job = owner.post("J1", None, app_details("app1")).await.unwrap();
    owner.claim(&job, "conductor-a").await.unwrap();

    owner_session.expire_session();

    assert_eq!(owner.state(&job).await.unwrap(), JobState::Unclaimed);
    let pass = owner.iterjobs(true, true).collect().await.unwrap();
    assert_eq!(pass.len(), 1);
    assert_eq!(pass[0].path(), job.path());
}

#[tokio::test]
async fn test_removed_queue_is_forgotten() {
    let namespace = MemoryNamespace::new();
    let client = session(&namespace);
    let board = per_queue_board(Arc::clone(&client)).await;

    let job = board.post("J1", None, app_details("app1")).await.unwrap();
    board.post("K1", None, app_details("app2")).await.unwrap();
    assert_eventually(
        || async { board.watched_queues().len() == 2 },
        Duration::from_secs(2),
        "both queues should be watched",
    )
    .await;

    board.claim(&job, "conductor-a").await.unwrap();
    board.consume(&job, "conductor-a").await.unwrap();
    client.delete(&board.queue_path("app1"), None).await.unwrap();

    assert_eventually(
        || async { board.watched_queues() == vec!["app2".to_string()] },
        Duration::from_secs(2),
        "watch on the removed queue should be dropped",
    )
    .await;
    assert_eq!(board.job_count().await, 1);
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let namespace = MemoryNamespace::new();
    let board = per_queue_board(session(&namespace)).await;
    board.post("J1", None, app_details("app1")).await.unwrap();

    board.connect().await.unwrap();
    board.connect().await.unwrap();

    assert_eventually(
        || async { board.watched_queues() == vec!["app1".to_string()] },
        Duration::from_secs(2),
        "reconnecting must not duplicate queue watches",
    )
    .await;
    assert_eq!(board.iterjobs(false, true).collect().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_close_stops_watching() {
    let namespace = MemoryNamespace::new();
    let watcher = per_queue_board(session(&namespace)).await;
    let poster = per_queue_board(session(&namespace)).await;
    poster.post("J1", None, app_details("app1")).await.unwrap();
    assert_eventually(
        || async { watcher.job_count().await == 1 },
        Duration::from_secs(2),
        "job should be discovered before close",
    )
    .await;

    watcher.close().await;
    assert!(watcher.watched_queues().is_empty());

    poster.post("J2", None, app_details("app1")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(watcher.job_count().await, 1);
}

#[tokio::test]
async fn test_reconnect_after_close_resumes_watching() {
    let namespace = MemoryNamespace::new();
    let watcher = per_queue_board(session(&namespace)).await;
    let poster = per_queue_board(session(&namespace)).await;

    watcher.close().await;
    watcher.connect().await.unwrap();

    poster.post("J1", None, app_details("app1")).await.unwrap();
    assert_eventually(
        || async { watcher.watched_queues() == vec!["app1".to_string()] },
        Duration::from_secs(2),
        "reconnected board should discover new queues",
    )
    .await;
    assert_eventually(
        || async { watcher.job_count().await == 1 },
        Duration::from_secs(2),
        "reconnected board should learn about posted jobs",
    )
    .await;
}
