//! Optimistic locking: WATCH-based compare-and-set under contention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use shoal_cluster::{cmd, Cluster, ClusterError, Frame};

use crate::helpers::TestCluster;

async fn connect(cluster: &TestCluster, name: &str) -> Arc<Cluster> {
    Cluster::connect(cluster.config(name)).await
}

/// Parses a counter value out of a GET reply, treating a missing key as
/// zero.
fn counter_of(value: &Frame) -> i64 {
    match value {
        Frame::Null => 0,
        Frame::Bulk(data) => std::str::from_utf8(data)
            .expect("counter is utf-8")
            .parse()
            .expect("counter is an integer"),
        other => panic!("unexpected counter value: {other:?}"),
    }
}

fn encode(n: i64) -> Bytes {
    Bytes::from(n.to_string().into_bytes())
}

#[tokio::test]
async fn update_key_increments_through_cas() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "cas-basic").await;

    cluster.q(&cmd(&["SET", "n", "41"])).await.unwrap();

    let written = cluster
        .update_key(b"n", |value| encode(counter_of(&value) + 1))
        .await
        .unwrap();
    assert_eq!(written, Bytes::from_static(b"42"));

    let reply = cluster.q(&cmd(&["GET", "n"])).await.unwrap();
    assert_eq!(reply, Frame::Bulk(Bytes::from_static(b"42")));
}

#[tokio::test]
async fn update_key_starts_missing_keys_at_zero() {
    let mock = TestCluster::start(1).await;
    let cluster = connect(&mock, "cas-missing").await;

    let written = cluster
        .update_key(b"fresh", |value| encode(counter_of(&value) + 1))
        .await
        .unwrap();
    assert_eq!(written, Bytes::from_static(b"1"));
}

#[tokio::test]
async fn contended_round_is_retried_and_succeeds() {
    let mock = TestCluster::start(1).await;
    let cluster = connect(&mock, "cas-contended").await;

    cluster.q(&cmd(&["SET", "n", "10"])).await.unwrap();

    // a competing write lands between WATCH and EXEC on the first round
    // only; the second round commits
    let rounds = AtomicUsize::new(0);
    let written = cluster
        .update_key(b"n", |value| {
            if rounds.fetch_add(1, Ordering::SeqCst) == 0 {
                mock.touch(b"n");
            }
            encode(counter_of(&value) + 1)
        })
        .await
        .unwrap();

    assert_eq!(written, Bytes::from_static(b"11"));
    assert_eq!(rounds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn perpetual_contention_surfaces_resource_busy() {
    let mock = TestCluster::start(1).await;
    let mut config = mock.config("cas-busy");
    config.cas_attempts = 3;
    let cluster = Cluster::connect(config).await;

    cluster.q(&cmd(&["SET", "n", "0"])).await.unwrap();

    let err = cluster
        .update_key(b"n", |value| {
            // every round loses the race
            mock.touch(b"n");
            encode(counter_of(&value) + 1)
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::ResourceBusy));
    // one WATCH per round, bounded by the CAS budget
    assert_eq!(mock.hits(0, "WATCH"), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_increments_all_land() {
    let mock = TestCluster::start(2).await;
    let mut config = mock.config("cas-concurrent");
    // generous budget: 8 contenders on one key lose rounds to each other
    config.cas_attempts = 64;
    let cluster = Cluster::connect(config).await;

    cluster.q(&cmd(&["SET", "shared", "0"])).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cluster = Arc::clone(&cluster);
        tasks.push(tokio::spawn(async move {
            cluster
                .update_key(b"shared", |value| encode(counter_of(&value) + 1))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let reply = cluster.q(&cmd(&["GET", "shared"])).await.unwrap();
    assert_eq!(reply, Frame::Bulk(Bytes::from_static(b"8")));
}

#[tokio::test]
async fn optimistic_locking_carries_the_extra_value() {
    let mock = TestCluster::start(1).await;
    let cluster = connect(&mock, "cas-extra").await;

    cluster.q(&cmd(&["SET", "doc", "v1"])).await.unwrap();

    let read = cmd(&["GET", "doc"]);
    let (exec, previous) = cluster
        .optimistic_locking(b"doc", &read, |value| {
            let write = vec![cmd(&["SET", "doc", "v2"])];
            (write, value)
        })
        .await
        .unwrap();

    // EXEC reply carries the per-command results of the write pipeline
    assert_eq!(exec, Frame::Array(vec![Frame::Simple("OK".into())]));
    assert_eq!(previous, Frame::Bulk(Bytes::from_static(b"v1")));
}

#[tokio::test]
async fn update_hash_field_round_trips() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "cas-hash").await;

    cluster
        .q(&cmd(&["HSET", "obj", "count", "5"]))
        .await
        .unwrap();

    let written = cluster
        .update_hash_field(b"obj", b"count", |value| encode(counter_of(&value) + 1))
        .await
        .unwrap();
    assert_eq!(written, Bytes::from_static(b"6"));

    let reply = cluster.q(&cmd(&["HGET", "obj", "count"])).await.unwrap();
    assert_eq!(reply, Frame::Bulk(Bytes::from_static(b"6")));
}
