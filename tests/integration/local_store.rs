// tests/integration/local_store.rs

use crate::common::{TestResult, init_tracing, o, with_timeout};

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;

use taskgov::protocol::DataSource;
use taskgov::types::WorkerId;
use taskgov::worker::LocalStore;
use taskgov::worker::data_server;

#[tokio::test]
async fn objects_stay_in_memory_below_the_threshold() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = LocalStore::new(dir.path(), 1024);

    let stored = store.put(o(1), Bytes::from_static(b"hello")).await?;

    assert_eq!(stored.size, 5);
    assert!(stored.spilled.is_empty());
    assert_eq!(store.memory_used().await, 5);
    assert_eq!(store.get(o(1)).await?, Some(Bytes::from_static(b"hello")));
    assert!(!dir.path().join("data").exists());
    Ok(())
}

#[tokio::test]
async fn largest_objects_spill_to_disk_first() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = LocalStore::new(dir.path(), 10);

    store.put(o(1), Bytes::from(vec![1u8; 8])).await?;
    let stored = store.put(o(2), Bytes::from(vec![2u8; 6])).await?;

    assert_eq!(stored.spilled, vec![o(1)]);
    assert_eq!(store.memory_used().await, 6);
    let spill_file = dir.path().join("data").join("o1.bin");
    assert!(spill_file.exists());

    // Spilled objects read back transparently.
    assert_eq!(store.get(o(1)).await?, Some(Bytes::from(vec![1u8; 8])));
    assert_eq!(store.len().await, 2);

    store.remove(&[o(1), o(2)]).await;
    assert!(!spill_file.exists());
    assert!(store.is_empty().await);
    assert_eq!(store.memory_used().await, 0);
    Ok(())
}

#[tokio::test]
async fn replacing_an_object_does_not_leak_accounting() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = LocalStore::new(dir.path(), 1024);

    store.put(o(1), Bytes::from_static(b"12345")).await?;
    store.put(o(1), Bytes::from_static(b"12")).await?;

    assert_eq!(store.memory_used().await, 2);
    assert_eq!(store.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn fetch_reads_local_and_inline_sources() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = LocalStore::new(dir.path(), 1024);

    assert!(store.fetch(o(1), &DataSource::Local).await.is_err());

    let (bytes, stored) = store
        .fetch(o(1), &DataSource::Inline(b"abc".to_vec()))
        .await?;
    assert_eq!(bytes, Bytes::from_static(b"abc"));
    assert_eq!(stored.size, 3);
    assert!(store.contains(o(1)).await);

    let (bytes, _) = store.fetch(o(1), &DataSource::Local).await?;
    assert_eq!(bytes, Bytes::from_static(b"abc"));
    Ok(())
}

#[tokio::test]
async fn objects_are_pulled_from_a_peer_data_server() -> TestResult {
    init_tracing();
    let peer_dir = tempfile::tempdir()?;
    let peer = Arc::new(LocalStore::new(peer_dir.path(), 1024));
    peer.put(o(7), Bytes::from_static(b"remote")).await?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    let server = tokio::spawn(data_server::serve(listener, Arc::clone(&peer)));

    let dir = tempfile::tempdir()?;
    let store = Arc::new(LocalStore::new(dir.path(), 1024));
    let source = DataSource::Worker {
        worker: WorkerId(9),
        address: address.clone(),
    };

    let (first, second) = with_timeout(async {
        tokio::join!(store.fetch(o(7), &source), store.fetch(o(7), &source))
    })
    .await;
    assert_eq!(first?.0, Bytes::from_static(b"remote"));
    assert_eq!(second?.0, Bytes::from_static(b"remote"));
    assert!(store.contains(o(7)).await);

    assert_eq!(data_server::pull(&address, o(8)).await?, None);
    assert!(store.fetch(o(8), &source).await.is_err());

    server.abort();
    Ok(())
}
