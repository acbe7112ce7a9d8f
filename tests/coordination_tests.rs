use std::time::Duration;

use jobconductor::coordination::{
    CoordinationError, Coordinator, CreateMode, MemoryNamespace, Op, WatchEvent,
};

async fn next_event(watch: &mut jobconductor::coordination::ChildrenWatch) -> Option<WatchEvent> {
    tokio::time::timeout(Duration::from_secs(1), watch.recv())
        .await
        .expect("watch event should arrive")
}

#[tokio::test]
async fn test_sequential_nodes_are_numbered_per_parent() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();

    let a0 = client
        .create("/board/a/job", Vec::new(), CreateMode::PersistentSequential, true)
        .await
        .unwrap();
    let a1 = client
        .create("/board/a/job", Vec::new(), CreateMode::PersistentSequential, true)
        .await
        .unwrap();
    let b0 = client
        .create("/board/b/job", Vec::new(), CreateMode::PersistentSequential, true)
        .await
        .unwrap();

    assert_eq!(a0, "/board/a/job0000000000");
    assert_eq!(a1, "/board/a/job0000000001");
    assert_eq!(b0, "/board/b/job0000000000");
    assert_eq!(
        client.children("/board").await.unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
}

#[tokio::test]
async fn test_create_without_parents_fails() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();

    let result = client
        .create("/missing/node", Vec::new(), CreateMode::Persistent, false)
        .await;
    assert_eq!(result, Err(CoordinationError::NoNode("/missing".to_string())));

    client.ensure_path("/present").await.unwrap();
    client
        .create("/present/node", b"x".to_vec(), CreateMode::Persistent, false)
        .await
        .unwrap();
    let duplicate = client
        .create("/present/node", Vec::new(), CreateMode::Persistent, false)
        .await;
    assert!(matches!(duplicate, Err(CoordinationError::NodeExists(_))));
}

#[tokio::test]
async fn test_delete_checks_version_and_children() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.ensure_path("/a/b").await.unwrap();

    assert!(matches!(
        client.delete("/a", None).await,
        Err(CoordinationError::NotEmpty(_))
    ));

    client
        .multi(vec![Op::SetData {
            path: "/a/b".to_string(),
            data: b"v1".to_vec(),
            version: Some(0),
        }])
        .await
        .unwrap();
    assert!(matches!(
        client.delete("/a/b", Some(0)).await,
        Err(CoordinationError::BadVersion { actual: 1, .. })
    ));
    client.delete("/a/b", Some(1)).await.unwrap();
    assert!(client.exists("/a/b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_multi_is_all_or_nothing() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.ensure_path("/jobs/job1").await.unwrap();
    let before = namespace.node_count();

    // Second op fails, so the lock created by the first must not survive.
    let result = client
        .multi(vec![
            Op::Create {
                path: "/jobs/job1.lock".to_string(),
                data: Vec::new(),
                mode: CreateMode::Ephemeral,
            },
            Op::Check {
                path: "/jobs/job2".to_string(),
                version: None,
            },
        ])
        .await;

    assert_eq!(result, Err(CoordinationError::NoNode("/jobs/job2".to_string())));
    assert_eq!(namespace.node_count(), before);
    assert!(client.exists("/jobs/job1.lock").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ephemeral_nodes_die_with_session() {
    let namespace = MemoryNamespace::new();
    let owner = namespace.connect();
    let observer = namespace.connect();
    owner.ensure_path("/jobs").await.unwrap();

    owner
        .create("/jobs/lock", Vec::new(), CreateMode::Ephemeral, false)
        .await
        .unwrap();
    let stat = observer.exists("/jobs/lock").await.unwrap().unwrap();
    assert_eq!(stat.ephemeral_owner, Some(owner.session_id()));

    let old_session = owner.session_id();
    owner.expire_session();
    assert_ne!(owner.session_id(), old_session);
    assert!(observer.exists("/jobs/lock").await.unwrap().is_none());

    // The reconnected session can create ephemerals again.
    owner
        .create("/jobs/lock", Vec::new(), CreateMode::Ephemeral, false)
        .await
        .unwrap();
    drop(owner);
    assert!(observer.exists("/jobs/lock").await.unwrap().is_none());
}

#[tokio::test]
async fn test_closed_session_rejects_operations() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.close();

    assert!(matches!(
        client.ensure_path("/x").await,
        Err(CoordinationError::SessionExpired(_))
    ));
}

#[tokio::test]
async fn test_watch_delivers_listing_and_rearms() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.ensure_path("/queues").await.unwrap();

    let mut watch = client.watch_children("/queues").await.unwrap();
    assert_eq!(next_event(&mut watch).await, Some(WatchEvent::Children(vec![])));

    client.ensure_path("/queues/app1").await.unwrap();
    assert_eq!(
        next_event(&mut watch).await,
        Some(WatchEvent::Children(vec!["app1".to_string()]))
    );

    client.ensure_path("/queues/app2").await.unwrap();
    assert_eq!(
        next_event(&mut watch).await,
        Some(WatchEvent::Children(vec![
            "app1".to_string(),
            "app2".to_string()
        ]))
    );
}

#[tokio::test]
async fn test_watch_survives_session_loss() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.ensure_path("/queues/app1").await.unwrap();

    let mut watch = client.watch_children("/queues").await.unwrap();
    next_event(&mut watch).await;

    client.expire_session();
    assert_eq!(next_event(&mut watch).await, Some(WatchEvent::SessionLost));
    assert_eq!(next_event(&mut watch).await, Some(WatchEvent::SessionRestored));
    assert_eq!(
        next_event(&mut watch).await,
        Some(WatchEvent::Children(vec!["app1".to_string()]))
    );

    // Still armed after the restore.
    client.ensure_path("/queues/app2").await.unwrap();
    assert_eq!(
        next_event(&mut watch).await,
        Some(WatchEvent::Children(vec![
            "app1".to_string(),
            "app2".to_string()
        ]))
    );
}

#[tokio::test]
async fn test_watch_ends_when_node_deleted() {
    let namespace = MemoryNamespace::new();
    let client = namespace.connect();
    client.ensure_path("/queues/app1").await.unwrap();

    let mut watch = client.watch_children("/queues/app1").await.unwrap();
    next_event(&mut watch).await;

    client.delete("/queues/app1", None).await.unwrap();
    assert_eq!(next_event(&mut watch).await, None);
    assert!(matches!(
        client.watch_children("/queues/app1").await,
        Err(CoordinationError::NoNode(_))
    ));
}
