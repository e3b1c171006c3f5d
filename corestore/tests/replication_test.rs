mod common;

use common::{eventually, make_store};
use corestore::{GetOptions, ProtocolStream, ReplicationRole};
use corestore_mockengine::{pipe, MemBackend, SimStream};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_basic_replication() {
    let backend_a = MemBackend::new();
    let backend_b = MemBackend::new();
    let a = make_store(&backend_a);
    let b = make_store(&backend_b);

    // A writes a block and drops its session; the core stays attached.
    let writer = a.get(GetOptions::name("foo")).await.unwrap();
    writer.append(vec![b"hello".to_vec()]).await.unwrap();
    let key = writer.key();
    writer.close().await;

    let stream_a = a.replicate(false).await.unwrap();
    let stream_b = b.replicate(true).await.unwrap();
    assert!(pipe(&stream_a, &stream_b));

    // B opens the same core by key and reads over the wire.
    let reader = b.get(GetOptions::key(key)).await.unwrap();
    assert_eq!(reader.get(0).await.unwrap(), Some(b"hello".to_vec()));
    assert!(!reader.writable());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_on_demand_open_via_discovery_key() {
    let backend_a = MemBackend::new();

    // Write the core, then close the store so it only lives on disk.
    let key = {
        let store = make_store(&backend_a);
        let writer = store.get(GetOptions::name("cold")).await.unwrap();
        writer.append(vec![b"from disk".to_vec()]).await.unwrap();
        let key = writer.key();
        store.close().await.unwrap();
        key
    };

    let a = make_store(&backend_a.reopen());
    let b = make_store(&MemBackend::new());
    assert!(a.cores().is_empty());

    let stream_a = a.replicate(false).await.unwrap();
    let stream_b = b.replicate(true).await.unwrap();
    assert!(pipe(&stream_a, &stream_b));

    // B announces the discovery key; A transiently opens the core from
    // storage and serves the block.
    let reader = b.get(GetOptions::key(key)).await.unwrap();
    assert_eq!(reader.get(0).await.unwrap(), Some(b"from disk".to_vec()));

    // The attachment keeps the on-demand core registered on A.
    assert_eq!(a.cores().len(), 1);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_replication_after_attach_of_late_writer() {
    let backend_a = MemBackend::new();
    let backend_b = MemBackend::new();
    let a = make_store(&backend_a);
    let b = make_store(&backend_b);

    let stream_a = a.replicate(false).await.unwrap();
    let stream_b = b.replicate(true).await.unwrap();
    assert!(pipe(&stream_a, &stream_b));

    // The reader asks first; the writer appears afterwards.
    let writer = a.get(GetOptions::name("late")).await.unwrap();
    let key = writer.key();
    let reader = b.get(GetOptions::key(key)).await.unwrap();

    let pending = tokio::spawn(async move {
        let block = reader.get(0).await.unwrap();
        (reader, block)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    writer.append(vec![b"late block".to_vec()]).await.unwrap();

    let (_reader, block) = pending.await.unwrap();
    assert_eq!(block, Some(b"late block".to_vec()));

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_owned_streams_destroyed_on_close_external_spared() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let owned = store.replicate(true).await.unwrap();
    let external: Arc<dyn ProtocolStream> = Arc::new(SimStream::new(true));
    store
        .replicate(ReplicationRole::Stream(external.clone()))
        .await
        .unwrap();
    assert_eq!(store.streams().len(), 2);

    store.close().await.unwrap();

    assert!(owned.is_destroyed());
    // Caller-owned streams are left alone.
    assert!(!external.is_destroyed());
}

#[tokio::test]
async fn test_stream_removed_from_tracker_on_destroy() {
    let backend = MemBackend::new();
    let store = make_store(&backend);

    let stream = store.replicate(true).await.unwrap();
    assert_eq!(store.streams().len(), 1);

    stream.destroy().await;
    assert!(eventually(|| store.streams().is_empty()).await);

    store.close().await.unwrap();
}

#[tokio::test]
async fn test_peer_disconnect_tears_down_both_sides() {
    let a = make_store(&MemBackend::new());
    let b = make_store(&MemBackend::new());

    let stream_a = a.replicate(false).await.unwrap();
    let stream_b = b.replicate(true).await.unwrap();
    assert!(pipe(&stream_a, &stream_b));

    stream_a.destroy().await;
    assert!(eventually(|| stream_b.is_destroyed()).await);
    assert!(eventually(|| a.streams().is_empty() && b.streams().is_empty()).await);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_replication_both_directions_same_pipe() {
    let a = make_store(&MemBackend::new());
    let b = make_store(&MemBackend::new());

    let sa = a.get(GetOptions::name("from-a")).await.unwrap();
    sa.append(vec![b"a0".to_vec()]).await.unwrap();
    let sb = b.get(GetOptions::name("from-b")).await.unwrap();
    sb.append(vec![b"b0".to_vec()]).await.unwrap();

    let stream_a = a.replicate(true).await.unwrap();
    let stream_b = b.replicate(false).await.unwrap();
    assert!(pipe(&stream_a, &stream_b));

    let b_reads_a = b.get(GetOptions::key(sa.key())).await.unwrap();
    let a_reads_b = a.get(GetOptions::key(sb.key())).await.unwrap();
    assert_eq!(b_reads_a.get(0).await.unwrap(), Some(b"a0".to_vec()));
    assert_eq!(a_reads_b.get(0).await.unwrap(), Some(b"b0".to_vec()));

    a.close().await.unwrap();
    b.close().await.unwrap();
}
