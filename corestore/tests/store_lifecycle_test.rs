mod common;

use common::{eventually, make_store, make_store_opts};
use corestore::{
    Alias, AuditOptions, Corestore, EngineError, GetOptions, Namespace, SessionOptions,
    StoreError, StoreOptions, Storage,
};
use corestore_mockengine::MemBackend;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_concurrent_opens_share_one_core() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let (a, b) = tokio::join!(
        store.get(GetOptions::name("test")),
        store.get(GetOptions::name("test"))
    );
    let a = a.unwrap();
    let b = b.unwrap();

    assert_eq!(a.key(), b.key());
    assert_eq!(a.discovery_key(), b.discovery_key());
    assert_eq!(store.cores().len(), 1);

    a.close().await;
    b.close().await;

    // Both sessions closed: the idle GC evicts the core.
    assert!(eventually(|| store.cores().is_empty()).await);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_primary_key_persists_across_reopen() {
    let backend = MemBackend::new();
    let primary_key = [1u8; 32];
    let store = make_store_opts(
        &backend,
        StoreOptions::default().primary_key(primary_key),
    );

    let session = store.get(GetOptions::name("test")).await.unwrap();
    let key = session.key();
    session.close().await;
    store.close().await.unwrap();

    // Reopen the same storage without supplying a primary key.
    let reopened = make_store(&backend.reopen());
    reopened.ready().await.unwrap();
    assert_eq!(reopened.primary_key(), Some(primary_key));

    let session = reopened.get(GetOptions::name("test")).await.unwrap();
    assert_eq!(session.key(), key);
    session.close().await;
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_conflicting_primary_key_fails() {
    let backend = MemBackend::new();
    let store = make_store_opts(&backend, StoreOptions::default().primary_key([1u8; 32]));
    store.ready().await.unwrap();
    store.close().await.unwrap();

    let conflicting = make_store_opts(
        &backend.reopen(),
        StoreOptions::default().primary_key([2u8; 32]),
    );
    assert_eq!(conflicting.ready().await, Err(StoreError::ConflictingSeed));
}

#[tokio::test]
async fn test_namespace_separation_and_determinism() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let ns1 = store.namespace("ns1");
    let ns2 = store.namespace("ns2");
    let ns3 = store.namespace("ns1");

    let a = ns1.get(GetOptions::name("main")).await.unwrap();
    let b = ns2.get(GetOptions::name("main")).await.unwrap();
    let c = ns3.get(GetOptions::name("main")).await.unwrap();

    assert_ne!(a.key(), b.key());
    assert_eq!(a.key(), c.key());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_namespaces_chain() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let nested = store.namespace("a").namespace("b");
    let flat = store.namespace("b");

    let nested_session = nested.get(GetOptions::name("main")).await.unwrap();
    let flat_session = flat.get(GetOptions::name("main")).await.unwrap();
    assert_ne!(nested_session.key(), flat_session.key());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_bootstrap_namespace_roundtrip() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let ns1 = store.namespace("ns1");
    let bootstrap = ns1.get(GetOptions::name("bootstrap")).await.unwrap();

    // A child built from the core recovers the persisted namespace.
    let recovered = store.namespace_from(&bootstrap);
    let session = recovered.get(GetOptions::name("bootstrap")).await.unwrap();
    assert_eq!(session.key(), bootstrap.key());
    assert_eq!(recovered.namespace_key(), ns1.namespace_key());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_alias_persisted_for_named_cores() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store.get(GetOptions::name("test")).await.unwrap();
    let discovery_key = session.discovery_key();
    session.close().await;
    store.close().await.unwrap();

    let backend = backend.reopen();
    let alias = Alias {
        name: "test".to_string(),
        namespace: Namespace::DEFAULT,
    };
    assert_eq!(backend.get_alias(&alias).await.unwrap(), Some(discovery_key));
}

#[tokio::test]
async fn test_reopen_by_name_and_key_roundtrip() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store.get(GetOptions::name("log")).await.unwrap();
    session
        .append(vec![b"b0".to_vec(), b"b1".to_vec()])
        .await
        .unwrap();
    let key = session.key();
    session.close().await;
    store.close().await.unwrap();

    // Reopen by name.
    let store = make_store(&backend.reopen());
    let session = store.get(GetOptions::name("log")).await.unwrap();
    assert_eq!(session.key(), key);
    assert_eq!(session.get(0).await.unwrap(), Some(b"b0".to_vec()));
    assert_eq!(session.get(1).await.unwrap(), Some(b"b1".to_vec()));
    assert!(session.writable());
    session.close().await;

    // Reopen by key on the same storage.
    let by_key = store.get(GetOptions::key(key)).await.unwrap();
    assert_eq!(by_key.get(0).await.unwrap(), Some(b"b0".to_vec()));
    by_key.close().await;

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_get_rejects_missing_identity() {
    let backend = MemBackend::new();
    let store = make_store(&backend);
    assert_eq!(
        store.get(GetOptions::default()).await.unwrap_err(),
        StoreError::MissingIdentity
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_get_rejects_name_with_secret_key() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let key_pair = corestore::keys::create_key_pair(&[3u8; 32], &Namespace::DEFAULT, b"x");
    let opts = GetOptions {
        key_pair: Some(key_pair),
        ..GetOptions::name("x")
    };
    assert!(matches!(
        store.get(opts).await.unwrap_err(),
        StoreError::InvalidInput(_)
    ));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_discovery_key_only_open_requires_storage() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let missing = corestore::DiscoveryKey([9u8; 32]);
    assert_eq!(
        store
            .get(GetOptions::discovery_key(missing))
            .await
            .unwrap_err(),
        StoreError::StorageEmpty
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_create_if_missing_false_fails_on_absent_core() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    assert_eq!(
        store
            .get(GetOptions::name("absent").create_if_missing(false))
            .await
            .unwrap_err(),
        StoreError::StorageEmpty
    );
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_stored_key_mismatch_is_fatal_for_core() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store.get(GetOptions::name("damaged")).await.unwrap();
    let discovery_key = session.discovery_key();
    session.close().await;
    store.close().await.unwrap();

    let backend = backend.reopen();
    backend.corrupt_core_key(&discovery_key, corestore::CoreKey([0xee; 32]));

    let store = make_store(&backend);
    assert!(matches!(
        store.get(GetOptions::name("damaged")).await.unwrap_err(),
        StoreError::StoredKeyMismatch { .. }
    ));
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_close_rejects_new_operations() {
    let backend = MemBackend::new();
    let store = make_store(&backend);
    let child = store.namespace("ns");
    let session = child.get(GetOptions::name("main")).await.unwrap();

    store.close().await.unwrap();

    assert!(store.is_closed());
    assert!(child.is_closed());
    assert!(session.is_closed());
    assert!(store.cores().is_empty());
    assert_eq!(
        store.get(GetOptions::name("late")).await.unwrap_err(),
        StoreError::StoreClosed
    );

    // A second close returns cleanly.
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_child_close_leaves_root_open() {
    let backend = MemBackend::new();
    let store = make_store(&backend);
    let child = store.namespace("ns");

    let child_session = child.get(GetOptions::name("a")).await.unwrap();
    let root_session = store.get(GetOptions::name("b")).await.unwrap();

    child.close().await.unwrap();
    assert!(child.is_closed());
    assert!(child_session.is_closed());
    assert!(!store.is_closed());
    assert!(!root_session.is_closed());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_session_close_fires_exactly_once() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store.get(GetOptions::name("once")).await.unwrap();
    let closed = session.closed();
    session.close().await;
    session.close().await;
    closed.await;
    assert!(session.is_closed());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_sees_opens_in_order() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = store.watch(move |core| {
        sink.lock().unwrap().push(core.discovery_key().to_string());
    });

    let a = store.get(GetOptions::name("a")).await.unwrap();
    let b = store.get(GetOptions::name("b")).await.unwrap();
    let c = store.get(GetOptions::name("c")).await.unwrap();

    let order = seen.lock().unwrap().clone();
    assert_eq!(
        order,
        vec![
            a.discovery_key().to_string(),
            b.discovery_key().to_string(),
            c.discovery_key().to_string()
        ]
    );

    // No callbacks after unwatch.
    store.unwatch(&handle);
    let d = store.get(GetOptions::name("d")).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 3);
    drop(d);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_does_not_replay_earlier_opens() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let _early = store.get(GetOptions::name("early")).await.unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.watch(move |core| {
        sink.lock().unwrap().push(core.discovery_key().to_string());
    });

    let late = store.get(GetOptions::name("late")).await.unwrap();
    let order = seen.lock().unwrap().clone();
    assert_eq!(order, vec![late.discovery_key().to_string()]);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_finding_peers_gates_reads_until_release() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let handle = store.finding_peers();
    let session = store
        .get(GetOptions::name("gated").wait(false))
        .await
        .unwrap();

    // The read waits out the discovery window.
    let get = session.get(0);
    tokio::pin!(get);
    assert!(tokio::time::timeout(Duration::from_millis(50), &mut get)
        .await
        .is_err());

    handle.release();
    // Release is idempotent.
    handle.release();

    assert_eq!(get.await.unwrap(), None);
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_read_timeout() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store
        .get(GetOptions::name("slow").timeout(Duration::from_millis(50)))
        .await
        .unwrap();
    // Block 0 does not exist and there are no peers to fetch it from.
    assert_eq!(
        session.get(0).await.unwrap_err(),
        StoreError::Engine(EngineError::Timeout)
    );

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_idle_gc_strikes_and_resume_reset() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let session = store.get(GetOptions::name("idle")).await.unwrap();
    session.close().await;

    // Re-opening before eviction cancels the pending GC.
    let session = store.get(GetOptions::name("idle")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(store.cores().len(), 1);

    session.close().await;
    assert!(eventually(|| store.cores().is_empty()).await);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_list_filters_by_namespace() {
    let backend = MemBackend::new();
    let store = make_store(&backend);
    let ns1 = store.namespace("ns1");

    let in_default = store.get(GetOptions::name("a")).await.unwrap();
    let in_ns1 = ns1.get(GetOptions::name("b")).await.unwrap();
    ns1.ready().await.unwrap();

    let mut all: Vec<String> = Vec::new();
    let mut stream = store.list(None).await.unwrap();
    while let Some(discovery_key) = stream.next().await {
        all.push(discovery_key.to_string());
    }
    all.sort();
    let mut expected = vec![
        in_default.discovery_key().to_string(),
        in_ns1.discovery_key().to_string(),
    ];
    expected.sort();
    assert_eq!(all, expected);

    let mut filtered: Vec<String> = Vec::new();
    let mut stream = store.list(ns1.namespace_key()).await.unwrap();
    while let Some(discovery_key) = stream.next().await {
        filtered.push(discovery_key.to_string());
    }
    assert_eq!(filtered, vec![in_ns1.discovery_key().to_string()]);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_create_key_pair_matches_named_get() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let key_pair = store.create_key_pair("main", None).await.unwrap();
    let session = store.get(GetOptions::name("main")).await.unwrap();
    assert_eq!(
        session.key_pair().map(|kp| kp.public_key),
        Some(key_pair.public_key)
    );

    // Two stores over the same seed derive the same pair.
    let other_backend = MemBackend::new();
    let other = make_store_opts(
        &other_backend,
        StoreOptions::default().primary_key(store.primary_key().unwrap()),
    );
    let other_pair = other.create_key_pair("main", None).await.unwrap();
    assert_eq!(other_pair.public_key, key_pair.public_key);

    store.close().await.unwrap();
    other.close().await.unwrap();
}

#[tokio::test]
async fn test_session_store_writability_inheritance() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let read_only = store.session(SessionOptions::default().writable(false));
    let session = read_only.get(GetOptions::name("doc")).await.unwrap();
    assert!(!session.writable());
    assert!(matches!(
        session.append(vec![b"x".to_vec()]).await.unwrap_err(),
        StoreError::InvalidInput(_)
    ));

    // Same core through the writable root works.
    let writable = store.get(GetOptions::name("doc")).await.unwrap();
    assert_eq!(writable.key(), session.key());
    writable.append(vec![b"x".to_vec()]).await.unwrap();

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_audit_reports_every_persisted_core() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let a = store.get(GetOptions::name("a")).await.unwrap();
    a.append(vec![b"1".to_vec(), b"2".to_vec()]).await.unwrap();
    let b = store.get(GetOptions::name("b")).await.unwrap();
    b.append(vec![b"3".to_vec()]).await.unwrap();

    let reports = store.audit(AuditOptions { dry_run: true }).await.unwrap();
    assert_eq!(reports.len(), 2);
    let mut checked: Vec<u64> = reports
        .iter()
        .map(|report| report.result.clone().unwrap().blocks_checked)
        .collect();
    checked.sort();
    assert_eq!(checked, vec![1, 2]);
    assert!(reports.iter().all(|report| report.key.is_some()));

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_suspend_and_resume() {
    let backend = MemBackend::new();
    let store = make_store(&backend);
    store.ready().await.unwrap();

    store.suspend().await.unwrap();
    assert!(store.get(GetOptions::name("x")).await.is_err());

    store.resume().await.unwrap();
    let session = store.get(GetOptions::name("x")).await.unwrap();
    assert!(session.writable());

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_independent_roots_coexist() {
    let backend_a = MemBackend::new();
    let backend_b = MemBackend::new();
    let a = make_store(&backend_a);
    let b = make_store(&backend_b);

    let sa = a.get(GetOptions::name("same-name")).await.unwrap();
    let sb = b.get(GetOptions::name("same-name")).await.unwrap();
    // Different seeds, different keys.
    assert_ne!(sa.key(), sb.key());

    a.close().await.unwrap();
    // Closing one root leaves the other usable.
    sb.append(vec![b"still alive".to_vec()]).await.unwrap();
    assert_eq!(sb.get(0).await.unwrap(), Some(b"still alive".to_vec()));

    b.close().await.unwrap();
}

#[tokio::test]
async fn test_preload_supplies_identity() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let named = store.get(GetOptions::name("preloaded")).await.unwrap();
    let key = named.key();
    named.close().await;

    let preload = Box::pin(async move {
        corestore::PreloadOptions {
            key: Some(key),
            ..corestore::PreloadOptions::default()
        }
    });
    let session = store.get(GetOptions::preload(preload)).await.unwrap();
    assert_eq!(session.key(), key);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_passive_store_construction() {
    let backend = MemBackend::new();
    let store = make_store_opts(&backend, StoreOptions::default().passive(true));
    let session = store.get(GetOptions::name("quiet")).await.unwrap();
    assert!(session.writable());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_independent_stores_same_seed_derive_same_keys() {
    let seed = Corestore::create_token();
    let a = make_store_opts(&MemBackend::new(), StoreOptions::default().primary_key(seed));
    let b = make_store_opts(&MemBackend::new(), StoreOptions::default().primary_key(seed));

    let sa = a.get(GetOptions::name("doc")).await.unwrap();
    let sb = b.get(GetOptions::name("doc")).await.unwrap();
    assert_eq!(sa.key(), sb.key());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_sessions_by_key_pair_and_manifest_agree_with_name() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let named = store.get(GetOptions::name("doc")).await.unwrap();
    let manifest = named.manifest().unwrap();

    let by_manifest = store.get(GetOptions::manifest(manifest)).await.unwrap();
    assert_eq!(by_manifest.key(), named.key());

    let pair = store.create_key_pair("doc", None).await.unwrap();
    let by_pair = store
        .get(GetOptions::key_pair(corestore::KeyPair::public(
            pair.public_key,
        )))
        .await
        .unwrap();
    assert_eq!(by_pair.key(), named.key());

    store.close().await.unwrap();
}
