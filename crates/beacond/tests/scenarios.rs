//! End-to-end scenarios across the store, API, discovery and cache crates.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use beacon_api::{RemoteStore, build_router};
use beacon_cache::{CacheConfig, GuardedCache};
use beacon_core::{AddressSet, ServiceAddress};
use beacon_discovery::{AddressStream, Balancer, Registrar, RegistrarConfig, Resolver, ResolverConfig};
use beacon_state::{StateStore, Sweeper};

async fn spawn_server() -> RemoteStore {
    let store = StateStore::open_in_memory().unwrap();
    let router = build_router(store, Duration::from_millis(500));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    RemoteStore::new(&format!("http://{addr}"), Duration::from_secs(2))
        .with_watch_timeout(Duration::from_millis(500))
}

/// Poll `stream` until its current set satisfies `pred` or `within` passes.
async fn wait_for(stream: &AddressStream, within: Duration, pred: impl Fn(&AddressSet) -> bool) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if stream.current().is_some_and(|set| pred(&set)) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test(start_paused = true)]
async fn abandoned_registration_leaves_resolver_within_twenty_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::open(&dir.path().join("beacon.redb")).unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(store.clone(), Duration::from_secs(1));
    let sweeper_task = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    let shared = Arc::new(store);
    let registrar = Registrar::new(shared.clone(), RegistrarConfig::default());
    let addr = ServiceAddress::new("10.0.0.1", 50051);
    let handle = registrar.start("user", &addr).await.unwrap();

    let resolver = Resolver::new(shared.clone(), ResolverConfig::default());
    let mut resolved = resolver.watch("user").await;
    let stream = resolved.stream();
    assert!(wait_for(&stream, Duration::from_secs(1), |set| set.contains_address(&addr)).await);

    // Renewal keeps it visible long past the 10s TTL.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(stream.current().unwrap().contains_address(&addr));

    drop(handle);
    assert!(wait_for(&stream, Duration::from_secs(20), AddressSet::is_empty).await);

    resolved.close().await;
    shutdown_tx.send(true).unwrap();
    sweeper_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn polling_alone_drops_expired_instance_within_twenty_seconds() {
    // No sweeper and no change events: only the 10s poll sees the lapse.
    let store = Arc::new(StateStore::open_in_memory().unwrap());
    let registrar = Registrar::new(store.clone(), RegistrarConfig::default());
    let addr = ServiceAddress::new("10.0.0.1", 50051);
    let handle = registrar.start("user", &addr).await.unwrap();

    let resolver = Resolver::new(
        store.clone(),
        ResolverConfig {
            use_watch: false,
            ..ResolverConfig::default()
        },
    );
    let mut resolved = resolver.watch("user").await;
    let stream = resolved.stream();
    assert!(wait_for(&stream, Duration::from_secs(1), |set| set.contains_address(&addr)).await);

    // Last renewal lands at 60s.
    tokio::time::sleep(Duration::from_secs(62)).await;
    assert!(stream.current().unwrap().contains_address(&addr));

    drop(handle);
    let dropped = Instant::now();
    assert!(wait_for(&stream, Duration::from_secs(20), AddressSet::is_empty).await);
    assert!(dropped.elapsed() <= Duration::from_secs(20));

    resolved.close().await;
}

#[tokio::test]
async fn register_and_resolve_over_http() {
    let remote = Arc::new(spawn_server().await);

    let registrar = Registrar::new(
        remote.clone(),
        RegistrarConfig {
            ttl: Duration::from_secs(2),
            ..RegistrarConfig::default()
        },
    );
    let resolver = Resolver::new(
        remote.clone(),
        ResolverConfig {
            poll_interval: Duration::from_millis(200),
            ..ResolverConfig::default()
        },
    );

    let mut resolved = resolver.watch("user").await;
    let stream = resolved.stream();
    assert!(wait_for(&stream, Duration::from_secs(5), AddressSet::is_empty).await);

    let addr = ServiceAddress::new("127.0.0.1", 50051);
    let handle = registrar.start("user", &addr).await.unwrap();
    assert_eq!(handle.key(), "/services/user/127.0.0.1:50051");
    assert!(wait_for(&stream, Duration::from_secs(5), |set| set.contains_address(&addr)).await);

    // A graceful stop revokes the lease instead of waiting for expiry.
    handle.stop().await;
    assert!(wait_for(&stream, Duration::from_secs(5), AddressSet::is_empty).await);

    resolved.close().await;
}

#[tokio::test]
async fn balancer_rotates_over_registered_instances() {
    let remote = Arc::new(spawn_server().await);
    let registrar = Registrar::new(remote.clone(), RegistrarConfig::default());

    let a = ServiceAddress::new("10.0.0.1", 50051);
    let b = ServiceAddress::new("10.0.0.2", 50051);
    let handle_a = registrar.start("order", &a).await.unwrap();
    let handle_b = registrar.start("order", &b).await.unwrap();

    let resolver = Resolver::new(
        remote.clone(),
        ResolverConfig {
            poll_interval: Duration::from_millis(200),
            ..ResolverConfig::default()
        },
    );
    let mut resolved = resolver.watch("order").await;
    let lb = Arc::new(Balancer::new());
    let follower = lb.follow(resolved.stream());

    let deadline = Instant::now() + Duration::from_secs(5);
    while lb.len() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(lb.len(), 2);

    let picks: Vec<ServiceAddress> = (0..4).map(|_| lb.next().unwrap()).collect();
    assert_ne!(picks[0], picks[1]);
    assert_eq!(picks[0], picks[2]);
    assert_eq!(picks[1], picks[3]);

    handle_a.stop().await;
    handle_b.stop().await;
    resolved.close().await;
    follower.await.unwrap();
}

#[tokio::test]
async fn concurrent_misses_over_http_load_once() {
    let remote = Arc::new(spawn_server().await);
    let cache = Arc::new(GuardedCache::new(
        remote,
        CacheConfig {
            retry_interval: Duration::from_millis(20),
            ..CacheConfig::default()
        },
    ));
    let loads = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cache = cache.clone();
        let loads = loads.clone();
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_load("user:1", Some(Duration::from_secs(60)), Duration::from_secs(5), || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Some(b"alice".to_vec()))
                })
                .await
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), Some(b"alice".to_vec()));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(cache.exists("user:1").await.unwrap());
}

#[tokio::test]
async fn absent_rows_are_cached_over_http() {
    let remote = Arc::new(spawn_server().await);
    let cache = GuardedCache::new(remote, CacheConfig::default());

    let first = cache
        .get_or_load("user:404", None, Duration::from_secs(30), || async { Ok(None) })
        .await
        .unwrap();
    assert_eq!(first, None);

    // The absent marker answers; the loader is not consulted again.
    let second = cache
        .get_or_load("user:404", None, Duration::from_secs(30), || async {
            Err(anyhow::anyhow!("loader should not run"))
        })
        .await
        .unwrap();
    assert_eq!(second, None);

    assert!(cache.invalidate("user:404").await.unwrap());
    assert!(!cache.exists("user:404").await.unwrap());
}
