//! Script evaluation: EVALSHA fast path and NOSCRIPT fallback.

use bytes::Bytes;

use shoal_cluster::{cmd, Cluster, Frame};

use crate::helpers::TestCluster;

async fn connect(cluster: &TestCluster, name: &str) -> std::sync::Arc<Cluster> {
    Cluster::connect(cluster.config(name)).await
}

const SCRIPT: &[u8] = b"return redis.call('GET', KEYS[1])";

#[tokio::test]
async fn noscript_falls_back_to_load_then_eval() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "scripts").await;

    let keys = vec![Bytes::from_static(b"doc")];
    let reply = cluster.eval(SCRIPT, &keys, &[]).await.unwrap();
    assert_eq!(reply, Frame::Integer(1));

    let owner = mock.owner_of(b"doc");
    // first EVALSHA got NOSCRIPT, then the fallback pipelined
    // SCRIPT LOAD + EVALSHA to the same node
    assert_eq!(mock.hits(owner, "EVALSHA"), 2);
    assert_eq!(mock.hits(owner, "SCRIPT"), 1);
}

#[tokio::test]
async fn second_eval_takes_the_fast_path() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "scripts-cached").await;

    let keys = vec![Bytes::from_static(b"doc")];
    cluster.eval(SCRIPT, &keys, &[]).await.unwrap();

    let owner = mock.owner_of(b"doc");
    let loads_before = mock.hits(owner, "SCRIPT");

    let reply = cluster.eval(SCRIPT, &keys, &[]).await.unwrap();
    assert_eq!(reply, Frame::Integer(1));
    // no further SCRIPT LOAD: the digest was already cached
    assert_eq!(mock.hits(owner, "SCRIPT"), loads_before);
}

#[tokio::test]
async fn keyless_scripts_route_by_the_stand_in_key() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "scripts-keyless").await;

    let reply = cluster.eval(b"return 1", &[], &[]).await.unwrap();
    assert_eq!(reply, Frame::Integer(1));

    // keyless scripts consistently land where the stand-in key hashes
    let owner = mock.owner_of(b"A");
    assert!(mock.hits(owner, "EVALSHA") >= 1);
}

#[tokio::test]
async fn eval_routes_by_its_first_key() {
    let mock = TestCluster::start(2).await;
    let cluster = connect(&mock, "scripts-routing").await;

    cluster.q(&cmd(&["SET", "foo", "x"])).await.unwrap();

    let keys = vec![Bytes::from_static(b"foo")];
    cluster.eval(SCRIPT, &keys, &[]).await.unwrap();

    let owner = mock.owner_of(b"foo");
    assert!(mock.hits(owner, "EVALSHA") >= 1);
    let other = (owner + 1) % 2;
    assert_eq!(mock.hits(other, "EVALSHA"), 0);
}
