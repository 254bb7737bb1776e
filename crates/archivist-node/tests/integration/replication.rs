//! Multi-node replication and cascade tests.

use std::collections::BTreeSet;
use std::time::Duration;

use archivist_node::client::PushOutcome;

use crate::harness::{client_record, PeerRegistry, TestNodeBuilder};

const WAIT: Duration = Duration::from_secs(20);

/// X holds a file alone until Y shows up, then both hold it with {X, Y}.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicates_once_a_peer_appears() {
    let registry = PeerRegistry::new();
    let x = TestNodeBuilder::new().registry(&registry).build().await.unwrap();

    let data: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
    let record = client_record("survey.dat", &data);
    let mut client = x.client().await.unwrap();
    assert_eq!(client.push_file(&record, &data).await.unwrap(), PushOutcome::Transferred);
    // Ordered on the connection: the upload is saved once this returns.
    client.download_meta().await.unwrap();
    client.close().await.unwrap();

    let alone = x.archive().lookup(&record.id).unwrap().unwrap();
    assert_eq!(alone.server_locations, BTreeSet::from([x.id()]));

    let y = TestNodeBuilder::new().registry(&registry).build().await.unwrap();
    let expected = BTreeSet::from([x.id(), y.id()]);

    let on_y = y
        .wait_record(&record.id, WAIT, |r| r.server_locations == expected)
        .await
        .unwrap();
    assert_eq!(y.archive().read_blob(&record.id).unwrap(), Some(data));
    assert_eq!(on_y.sender_ip, "127.0.0.1");

    let on_x = x
        .wait_record(&record.id, WAIT, |r| r.server_locations == expected)
        .await
        .unwrap();
    assert_eq!(on_x, on_y);

    // Two copies is the default target; nothing left to do.
    let deadline = tokio::time::Instant::now() + WAIT;
    while x.node.context().queue.contains(&record.id) {
        assert!(tokio::time::Instant::now() < deadline, "file never left the queue");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    y.shutdown().await;
    x.shutdown().await;
}

/// The copy goes to the peer advertising the most free space.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_copy_goes_to_emptiest_peer() {
    let registry = PeerRegistry::new();
    let small = TestNodeBuilder::new().capacity(10_000).registry(&registry).build().await.unwrap();
    let large = TestNodeBuilder::new().capacity(1_000_000).registry(&registry).build().await.unwrap();
    let origin = TestNodeBuilder::new().registry(&registry).build().await.unwrap();

    // Arrives as a replication push, so only the replicator moves it on.
    let data = b"goes to the roomiest node".to_vec();
    let record = client_record("roomy.txt", &data).with_sender_ip("10.0.0.4");
    let mut peer = origin.connect(archivist_protocol::PeerRole::Server).await.unwrap();
    peer.push_file(&record, &data).await.unwrap();
    peer.close().await.unwrap();

    origin
        .wait_record(&record.id, WAIT, |r| r.is_located_at(&large.id()))
        .await
        .unwrap();
    assert!(large.archive().blob_exists(&record.id));
    assert!(!small.archive().blob_exists(&record.id));

    origin.shutdown().await;
    large.shutdown().await;
    small.shutdown().await;
}

/// A client upload is pushed on to every other node, bytes included.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_push_cascades() {
    let registry = PeerRegistry::new();
    let a = TestNodeBuilder::new().target_copies(1).registry(&registry).build().await.unwrap();
    let b = TestNodeBuilder::new().target_copies(1).registry(&registry).build().await.unwrap();
    let c = TestNodeBuilder::new().target_copies(1).registry(&registry).build().await.unwrap();

    let data = b"spread the word".to_vec();
    let record = client_record("word.txt", &data);
    let mut client = a.client().await.unwrap();
    client.push_file(&record, &data).await.unwrap();
    client.close().await.unwrap();

    for node in [&b, &c] {
        let seen = node
            .wait_record(&record.id, WAIT, |r| r.is_located_at(&node.id()))
            .await
            .unwrap();
        assert!(seen.is_located_at(&a.id()));
        assert_eq!(seen.sender, a.id());
        assert_eq!(node.archive().read_blob(&record.id).unwrap(), Some(data.clone()));
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// A meta-update from a plain client reaches every other node.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_meta_update_cascades() {
    let registry = PeerRegistry::new();
    let a = TestNodeBuilder::new().registry(&registry).build().await.unwrap();
    let b = TestNodeBuilder::new().registry(&registry).build().await.unwrap();
    let c = TestNodeBuilder::new().registry(&registry).build().await.unwrap();

    let mut record = client_record("index.md", b"# index").with_sender_ip("10.0.0.4");
    record.description = "table of contents".into();
    let mut client = a.client().await.unwrap();
    client.update_meta(&record).await.unwrap();
    client.close().await.unwrap();

    for node in [&b, &c] {
        let seen = node
            .wait_record(&record.id, WAIT, |r| r.description == "table of contents")
            .await
            .unwrap();
        assert_eq!(seen, record);
    }

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

/// A meta-update between servers is not forwarded again.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_server_meta_update_does_not_cascade() {
    let registry = PeerRegistry::new();
    let a = TestNodeBuilder::new().registry(&registry).build().await.unwrap();
    let b = TestNodeBuilder::new().registry(&registry).build().await.unwrap();

    let record = client_record("local.txt", b"local").with_sender_ip("10.0.0.4");
    let mut peer = a.connect(archivist_protocol::PeerRole::Server).await.unwrap();
    peer.update_meta(&record).await.unwrap();
    // Ordered on the connection: the update is applied once this returns.
    peer.download_meta().await.unwrap();
    peer.close().await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(a.archive().lookup(&record.id).unwrap().is_some());
    assert!(b.archive().lookup(&record.id).unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

/// A client delete removes the file from every node holding it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_client_delete_cascades() {
    let registry = PeerRegistry::new();
    let a = TestNodeBuilder::new().registry(&registry).build().await.unwrap();
    let b = TestNodeBuilder::new().registry(&registry).build().await.unwrap();

    let data = b"to be withdrawn".to_vec();
    let record = client_record("withdrawn.txt", &data);
    let mut client = a.client().await.unwrap();
    client.push_file(&record, &data).await.unwrap();

    b.wait_record(&record.id, WAIT, |r| r.is_located_at(&b.id()))
        .await
        .unwrap();
    assert!(b.archive().blob_exists(&record.id));

    assert!(client.delete_file(&record.id).await.unwrap());
    client.close().await.unwrap();

    a.wait_gone(&record.id, WAIT).await.unwrap();
    b.wait_gone(&record.id, WAIT).await.unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// A stale meta-update racing a replication push never drops the receiver
/// from the record it just stored.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stale_meta_update_racing_push_keeps_receiver() {
    let node = TestNodeBuilder::new().target_copies(1).build().await.unwrap();
    let origin = uuid::Uuid::new_v4();

    for round in 0..20 {
        let data = format!("round {round}").into_bytes();
        let stale = client_record("raced.txt", &data)
            .with_sender_ip("10.0.0.7")
            .with_location(origin);
        let pushed = stale.with_location(node.id());

        let mut pusher = node.connect(archivist_protocol::PeerRole::Server).await.unwrap();
        let mut updater = node.connect(archivist_protocol::PeerRole::Server).await.unwrap();
        let (push, update) = tokio::join!(
            async {
                let outcome = pusher.push_file(&pushed, &data).await?;
                pusher.download_meta().await?;
                Ok::<_, archivist_node::client::ClientError>(outcome)
            },
            async {
                updater.update_meta(&stale).await?;
                updater.download_meta().await?;
                Ok::<_, archivist_node::client::ClientError>(())
            },
        );
        assert_eq!(push.unwrap(), PushOutcome::Transferred);
        update.unwrap();
        pusher.close().await.unwrap();
        updater.close().await.unwrap();

        let saved = node.archive().lookup(&stale.id).unwrap().unwrap();
        assert!(saved.is_located_at(&node.id()), "round {round}: {saved:?}");
        assert!(saved.is_located_at(&origin));
        assert!(node.archive().blob_exists(&stale.id));
    }

    node.shutdown().await;
}
