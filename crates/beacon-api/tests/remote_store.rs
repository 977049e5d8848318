//! RemoteStore against a live loopback server.

use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use beacon_api::{RemoteStore, build_router};
use beacon_state::{CacheStore, CoordinationStore, EventKind, LeaseId, StateError, StateStore};

async fn spawn_server() -> (RemoteStore, StateStore) {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store.clone(), Duration::from_millis(500));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let remote = RemoteStore::new(&format!("http://{addr}"), Duration::from_secs(2))
        .with_watch_timeout(Duration::from_millis(500));
    (remote, store)
}

#[tokio::test]
async fn healthz_responds() {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store, Duration::from_secs(1));
    let req = Request::builder()
        .uri("/healthz")
        .body(Body::empty())
        .unwrap();
    let resp = router.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn lease_put_and_prefix_read() {
    let (remote, local) = spawn_server().await;

    let lease = remote.grant(10).await.unwrap();
    assert_eq!(lease.ttl_secs, 10);
    remote
        .put("/services/user/10.0.0.1:50051", "10.0.0.1:50051", Some(lease.id))
        .await
        .unwrap();
    remote.put("/services/order/h:1", "h:1", None).await.unwrap();

    let entries = remote.get_prefix("/services/user/").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].value, "10.0.0.1:50051");
    assert_eq!(entries[0].lease, Some(lease.id));

    // The server-side store sees the same data.
    assert_eq!(local.list_prefix("/services/").unwrap().len(), 2);

    remote.keep_alive(lease.id).await.unwrap();
    assert!(remote.revoke(lease.id).await.unwrap());
    assert!(remote.get_prefix("/services/user/").await.unwrap().is_empty());
}

#[tokio::test]
async fn typed_errors_cross_the_wire() {
    let (remote, _local) = spawn_server().await;

    let err = remote.keep_alive(LeaseId(42)).await.unwrap_err();
    assert!(matches!(err, StateError::LeaseNotFound(LeaseId(42))));

    let first = remote.grant(10).await.unwrap();
    let second = remote.grant(10).await.unwrap();
    remote.put("/svc/a/h:1", "h:1", Some(first.id)).await.unwrap();
    let err = remote
        .put("/svc/a/h:1", "h:1", Some(second.id))
        .await
        .unwrap_err();
    match err {
        StateError::KeyLeased { key, lease } => {
            assert_eq!(key, "/svc/a/h:1");
            assert_eq!(lease, first.id);
        }
        other => panic!("unexpected error: {other}"),
    }

    let err = remote.grant(0).await.unwrap_err();
    assert!(matches!(err, StateError::Invalid(_)));
}

#[tokio::test]
async fn cache_operations() {
    let (remote, _local) = spawn_server().await;

    assert_eq!(remote.get("user:1").await.unwrap(), None);
    remote.set("user:1", b"alice", None).await.unwrap();
    assert_eq!(remote.get("user:1").await.unwrap(), Some(b"alice".to_vec()));
    assert!(remote.exists("user:1").await.unwrap());

    // Empty payloads are values, not absence.
    remote.set("user:2", b"", None).await.unwrap();
    assert_eq!(remote.get("user:2").await.unwrap(), Some(Vec::new()));

    let ttl = Duration::from_secs(3);
    assert!(remote.set_if_absent("lock:user:3", b"t1", ttl).await.unwrap());
    assert!(!remote.set_if_absent("lock:user:3", b"t2", ttl).await.unwrap());
    assert!(!remote.compare_and_delete("lock:user:3", b"t2").await.unwrap());
    assert!(remote.compare_and_delete("lock:user:3", b"t1").await.unwrap());

    assert!(remote.delete("user:1").await.unwrap());
    assert!(!remote.exists("user:1").await.unwrap());
}

#[tokio::test]
async fn watch_delivers_remote_changes() {
    let (remote, local) = spawn_server().await;
    let mut rx = remote.watch("/svc/user/").await.unwrap();

    // Keep writing until the long-poll is in place and picks one up.
    let event = tokio::time::timeout(Duration::from_secs(5), async {
        let mut n = 0u32;
        loop {
            local
                .put_key(&format!("/svc/user/h:{n}"), "h:1", None)
                .unwrap();
            n += 1;
            tokio::select! {
                event = rx.recv() => break event,
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(event.kind, EventKind::Put);
    assert!(event.key.starts_with("/svc/user/"));
}
