//! Data-port protocol tests against a single node.

use std::time::Duration;

use archivist_node::client::{ClientError, PushOutcome};
use archivist_protocol::{Checksum, RequestTag, ACCEPT_TOKEN, STATUS_ERROR, STATUS_SENDING};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::harness::{client_record, TestNodeBuilder};

/// Open a raw connection and complete the handshake as a plain client.
async fn raw_connection(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut token = [0u8; 8];
    stream.read_exact(&mut token).await.unwrap();
    assert_eq!(token, ACCEPT_TOKEN);
    stream.write_all(&[0]).await.unwrap();
    stream
}

#[tokio::test]
async fn test_client_upload_is_stamped_and_pullable() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let data = b"field notes, day one".to_vec();
    let record = client_record("notes.txt", &data);

    let mut client = node.client().await.unwrap();
    assert_eq!(client.push_file(&record, &data).await.unwrap(), PushOutcome::Transferred);

    // Same connection, so the push has been processed before the pull.
    assert_eq!(client.pull_file(&record.id).await.unwrap(), Some(data.clone()));
    assert_eq!(client.pull_file(&uuid::Uuid::new_v4()).await.unwrap(), None);

    let saved = node.archive().lookup(&record.id).unwrap().unwrap();
    assert_eq!(saved.sender_ip, "127.0.0.1");
    assert_eq!(saved.sender, node.id());
    assert_eq!(saved.server_locations.len(), 1);
    assert!(saved.is_located_at(&node.id()));
    assert_eq!(saved.checksum, record.checksum);

    client.close().await.unwrap();
    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_push_moves_no_bytes() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let data = b"the same bytes twice".to_vec();
    let record = client_record("twice.bin", &data);

    let mut client = node.client().await.unwrap();
    assert_eq!(client.push_file(&record, &data).await.unwrap(), PushOutcome::Transferred);
    assert_eq!(client.push_file(&record, &data).await.unwrap(), PushOutcome::Duplicate);

    // Differing checksum transfers and fully replaces, even when shorter.
    let shorter = b"short".to_vec();
    let mut replacement = record.clone();
    replacement.checksum = Checksum::of(&shorter);
    assert_eq!(
        client.push_file(&replacement, &shorter).await.unwrap(),
        PushOutcome::Transferred
    );
    assert_eq!(client.pull_file(&record.id).await.unwrap(), Some(shorter));
    assert_eq!(node.archive().list_all().unwrap().len(), 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_delete_twice() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let data = b"short-lived".to_vec();
    let record = client_record("tmp.txt", &data);

    let mut client = node.client().await.unwrap();
    client.push_file(&record, &data).await.unwrap();
    assert!(client.delete_file(&record.id).await.unwrap());
    assert!(!client.delete_file(&record.id).await.unwrap());

    assert!(node.archive().lookup(&record.id).unwrap().is_none());
    assert!(!node.archive().blob_exists(&record.id));
    assert!(!node.node.context().queue.contains(&record.id));

    node.shutdown().await;
}

#[tokio::test]
async fn test_meta_update_then_download() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let record = client_record("catalogue.json", b"{}").with_sender_ip("10.0.0.9");

    let mut client = node.client().await.unwrap();
    client.update_meta(&record).await.unwrap();
    let records = client.download_meta().await.unwrap();
    assert_eq!(records, vec![record.clone()]);

    let mut changed = record.clone();
    changed.description = "second edition".into();
    client.update_meta(&changed).await.unwrap();
    let records = client.download_meta().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].description, "second edition");

    node.shutdown().await;
}

#[tokio::test]
async fn test_checksum_mismatch_is_not_stored() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let record = client_record("claimed.txt", b"what the record claims");

    let mut client = node.client().await.unwrap();
    assert_eq!(
        client.push_file(&record, b"what actually arrives").await.unwrap(),
        PushOutcome::Transferred
    );
    assert!(client.download_meta().await.unwrap().is_empty());
    assert!(!node.archive().blob_exists(&record.id));

    node.shutdown().await;
}

#[tokio::test]
async fn test_full_node_refuses_push() {
    let node = TestNodeBuilder::new().capacity(16).build().await.unwrap();
    let first = vec![7u8; 32];
    let record = client_record("big.bin", &first);

    let mut client = node.client().await.unwrap();
    assert_eq!(client.push_file(&record, &first).await.unwrap(), PushOutcome::Transferred);
    client.download_meta().await.unwrap();
    assert_eq!(node.archive().free_space(), 0);

    let second = client_record("more.bin", b"more");
    assert_eq!(
        client.push_file(&second, b"more").await.unwrap(),
        PushOutcome::NoFreeSpace
    );
    // A duplicate is still recognised when full
    assert_eq!(client.push_file(&record, &first).await.unwrap(), PushOutcome::Duplicate);

    node.shutdown().await;
}

#[tokio::test]
async fn test_busy_when_every_slot_is_taken() {
    let node = TestNodeBuilder::new().max_connections(1).build().await.unwrap();

    let held = node.client().await.unwrap();
    let refused = node.client().await.err().expect("second connection should be refused");
    assert!(matches!(refused.downcast_ref::<ClientError>(), Some(ClientError::Busy)));

    // The slot comes back once the first connection ends.
    held.close().await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match node.client().await {
            Ok(client) => {
                client.close().await.unwrap();
                break;
            }
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => panic!("slot never released: {e}"),
        }
    }

    node.shutdown().await;
}

#[tokio::test]
async fn test_unknown_tag_gets_error_and_close() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let mut stream = raw_connection(node.addr()).await;

    stream.write_all(b"FILE_XXX").await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), STATUS_ERROR);
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    node.shutdown().await;
}

#[tokio::test]
async fn test_bad_id_answered_and_connection_survives() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let mut stream = raw_connection(node.addr()).await;

    stream.write_all(&RequestTag::FilePull.wire()).await.unwrap();
    stream.write_all(&[b'x'; 36]).await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), STATUS_ERROR);

    stream.write_all(&RequestTag::MetaDownload.wire()).await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), STATUS_SENDING);
    let len = stream.read_i64().await.unwrap();
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body, b"[]");

    node.shutdown().await;
}

/// Keep trying to connect until a slot is free again.
async fn wait_for_slot(node: &crate::harness::TestNode, within: Duration) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match node.client().await {
            Ok(client) => {
                client.close().await.unwrap();
                return;
            }
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => panic!("slot never released: {e}"),
        }
    }
}

#[tokio::test]
async fn test_stalled_push_releases_slot() {
    let node = TestNodeBuilder::new()
        .max_connections(1)
        .idle_timeout_secs(1)
        .build()
        .await
        .unwrap();
    let mut stream = raw_connection(node.addr()).await;

    // Announce 100 bytes of metadata, send three, then go quiet.
    stream.write_all(&RequestTag::FilePush.wire()).await.unwrap();
    stream.write_i64(100).await.unwrap();
    stream.write_all(b"{\"i").await.unwrap();
    stream.flush().await.unwrap();

    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server kept the stalled connection open")
        .unwrap();
    assert!(rest.is_empty());

    wait_for_slot(&node, Duration::from_secs(5)).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_stalled_blob_releases_slot() {
    let node = TestNodeBuilder::new()
        .max_connections(1)
        .idle_timeout_secs(1)
        .build()
        .await
        .unwrap();
    let record = client_record("half.bin", &[5u8; 1000]);
    let mut stream = raw_connection(node.addr()).await;

    stream.write_all(&RequestTag::FilePush.wire()).await.unwrap();
    let body = serde_json::to_vec(&record).unwrap();
    stream.write_i64(body.len() as i64).await.unwrap();
    stream.write_all(&body).await.unwrap();
    assert_eq!(stream.read_u8().await.unwrap(), archivist_protocol::STATUS_ACCEPT);
    stream.write_i64(1000).await.unwrap();
    stream.write_all(&[5u8; 10]).await.unwrap();
    stream.flush().await.unwrap();

    wait_for_slot(&node, Duration::from_secs(5)).await;
    assert!(!node.archive().blob_exists(&record.id));
    drop(stream);
    node.shutdown().await;
}

#[tokio::test]
async fn test_silent_handshake_releases_slot() {
    let node = TestNodeBuilder::new()
        .max_connections(1)
        .idle_timeout_secs(1)
        .build()
        .await
        .unwrap();
    let mut stream = TcpStream::connect(node.addr()).await.unwrap();
    let mut token = [0u8; 8];
    stream.read_exact(&mut token).await.unwrap();
    assert_eq!(token, ACCEPT_TOKEN);

    // No role byte ever arrives.
    wait_for_slot(&node, Duration::from_secs(5)).await;
    drop(stream);
    node.shutdown().await;
}

#[tokio::test]
async fn test_oversized_length_closes_connection() {
    let node = TestNodeBuilder::new().build().await.unwrap();
    let mut stream = raw_connection(node.addr()).await;

    stream.write_all(&RequestTag::MetaUpdate.wire()).await.unwrap();
    stream.write_i64(i32::MAX as i64 + 1).await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());

    node.shutdown().await;
}
