use std::{path::PathBuf, time::Duration};

use assert_matches::assert_matches;
use store_api::{
    unlink_region, AofOpts, FsyncPolicy, Handle, ObjectStore, ObjectStoreExt,
    PortSpec, RemoteStore, ShmStore, StoreError, StoreEvent, StoreService,
    StoreServiceOpts,
};

fn region_name(test: &str) -> String {
    format!("/store-api-{}-{}", test, std::process::id())
}

fn aof_dir(test: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/store-api-{}-{}", test, std::process::id()))
}

fn service_opts(port: PortSpec, budget: u64) -> StoreServiceOpts {
    StoreServiceOpts {
        port,
        budget,
        aof: None,
    }
}

#[tokio::test]
async fn arena_round_trip() {
    let region = region_name("roundtrip");
    let mut store = ShmStore::create(&region, 1024 * 1024).unwrap();

    let handle = store.put(b"payload", Some("frame0")).await.unwrap();
    assert_eq!(handle.name(), Some("frame0"));
    assert_eq!(store.get(&handle).await.unwrap(), b"payload");

    // a second mapping of the same region sees the same bytes
    let mut reader = ShmStore::open(&region).unwrap();
    assert_eq!(reader.get(&handle).await.unwrap(), b"payload");

    unlink_region(&region).unwrap();
}

#[tokio::test]
async fn arena_rejects_handles_it_never_minted() {
    let region = region_name("notfound");
    let other_region = region_name("notfound-other");
    let mut store = ShmStore::create(&region, 1024 * 1024).unwrap();
    let mut other = ShmStore::create(&other_region, 1024 * 1024).unwrap();

    let real = store.put(b"real", None).await.unwrap();
    // same offset as `real` but a different payload length
    let forged_len = other.put(b"other-bytes", None).await.unwrap();
    // an offset `store` never allocated, so its id word is still zero
    other.put(b"fill", None).await.unwrap();
    let forged_loc = other.put(b"astray", None).await.unwrap();

    assert_eq!(store.get(&real).await.unwrap(), b"real");
    assert_matches!(
        store.get(&forged_len).await,
        Err(StoreError::NotFound { .. })
    );
    assert_matches!(
        store.get(&forged_loc).await,
        Err(StoreError::NotFound { .. })
    );

    unlink_region(&region).unwrap();
    unlink_region(&other_region).unwrap();
}

#[tokio::test]
async fn arena_runs_out_of_budget() {
    let region = region_name("budget");
    let mut store = ShmStore::create(&region, 4096).unwrap();

    let mut last: Result<Handle, StoreError> = store.put(&[0u8; 512], None).await;
    for _ in 0..16 {
        if last.is_err() {
            break;
        }
        last = store.put(&[0u8; 512], None).await;
    }
    assert_matches!(last, Err(StoreError::StoreFull { .. }));

    unlink_region(&region).unwrap();
}

#[tokio::test]
async fn arena_round_trips_typed_values() {
    let region = region_name("typed");
    let mut store = ShmStore::create(&region, 1024 * 1024).unwrap();

    let frame = vec![1u64, 2, 3, 5, 8];
    let handle = store.put_obj(&frame, Some("fib")).await.unwrap();
    let back: Vec<u64> = store.get_obj(&handle).await.unwrap();
    assert_eq!(back, frame);

    unlink_region(&region).unwrap();
}

#[tokio::test]
async fn service_round_trip_and_get_list() {
    let service = StoreService::start(service_opts(PortSpec::Any, 10_000_000))
        .await
        .unwrap();
    let mut store = RemoteStore::connect(service.port()).await.unwrap();

    let a = store.put(b"alpha", Some("a")).await.unwrap();
    let b = store.put(b"beta", None).await.unwrap();
    assert_ne!(a, b);

    assert_eq!(store.get(&a).await.unwrap(), b"alpha");
    let both = store.get_list(&[a.clone(), b.clone()]).await.unwrap();
    assert_eq!(both, vec![b"alpha".to_vec(), b"beta".to_vec()]);

    store.free(&a).await.unwrap();
    assert_matches!(store.get(&a).await, Err(StoreError::NotFound { .. }));
    assert_matches!(
        store.get_list(&[a, b]).await,
        Err(StoreError::NotFound { .. })
    );

    service.stop().await;
}

#[tokio::test]
async fn service_enforces_the_budget() {
    let service = StoreService::start(service_opts(PortSpec::Any, 1024))
        .await
        .unwrap();
    let mut store = RemoteStore::connect(service.port()).await.unwrap();

    store.put(&[0u8; 800], None).await.unwrap();
    assert_matches!(
        store.put(&[0u8; 800], None).await,
        Err(StoreError::StoreFull { .. })
    );

    service.stop().await;
}

#[tokio::test]
async fn service_expires_payloads() {
    let service = StoreService::start(service_opts(PortSpec::Any, 10_000_000))
        .await
        .unwrap();
    let mut store = RemoteStore::connect(service.port()).await.unwrap();
    let mut events = store.subscribe().await.unwrap();

    let handle = store.put(b"ephemeral", None).await.unwrap();
    store
        .expire(&handle, Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_matches!(store.get(&handle).await, Err(StoreError::NotFound { .. }));

    assert_matches!(events.next().await, Some(StoreEvent::Added { .. }));
    assert_matches!(events.next().await, Some(StoreEvent::Evicted { .. }));

    service.stop().await;
}

#[tokio::test]
async fn service_probes_past_a_busy_port() {
    let first = StoreService::start(service_opts(PortSpec::Probe {
        from: 16390,
    }, 1024))
    .await
    .unwrap();
    let second = StoreService::start(service_opts(PortSpec::Probe {
        from: 16390,
    }, 1024))
    .await
    .unwrap();

    assert!(second.port() > first.port());

    let busy =
        StoreService::start(service_opts(PortSpec::Explicit(first.port()), 1024)).await;
    assert_matches!(busy, Err(StoreError::Bind { .. }));

    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn warm_restart_replays_the_append_only_log() {
    let dir = aof_dir("replay");
    let _ = std::fs::remove_dir_all(&dir);

    let opts = StoreServiceOpts {
        port: PortSpec::Any,
        budget: 10_000_000,
        aof: Some(AofOpts {
            dir: dir.clone(),
            fsync: FsyncPolicy::EveryWrite,
        }),
    };

    let service = StoreService::start(opts.clone()).await.unwrap();
    let mut store = RemoteStore::connect(service.port()).await.unwrap();
    let kept = store.put(b"durable", Some("keep")).await.unwrap();
    let freed = store.put(b"gone", None).await.unwrap();
    store.free(&freed).await.unwrap();
    service.stop().await;

    // a new service over the same directory serves the same handle
    let service = StoreService::start(opts).await.unwrap();
    let mut store = RemoteStore::connect(service.port()).await.unwrap();
    assert_eq!(store.get(&kept).await.unwrap(), b"durable");
    assert_matches!(store.get(&freed).await, Err(StoreError::NotFound { .. }));

    // minting resumes past replayed ids
    let fresh = store.put(b"new", None).await.unwrap();
    assert!(fresh.id() > kept.id());

    service.stop().await;
    std::fs::remove_dir_all(&dir).unwrap();
}
