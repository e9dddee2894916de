//! Cluster router behavior against scripted fake nodes: MOVED and ASK
//! redirects, and the cross-slot transaction fast-fail that never touches
//! the network at all.

mod common;

use bytes::Bytes;
use valkey_client_core::cluster::{ClusterRouter, Topology};
use valkey_client_core::error::RoutingError;
use valkey_client_core::resp::encode_command;
use valkey_client_core::{hash_slot, ClientError, ClusterConfig, Command};

use common::{reply, spawn_fake_server};

fn keyed(name: &str, args: &[&[u8]], key: &[u8]) -> Command {
    Command::new(encode_command(name, args)).with_keys(vec![Bytes::copy_from_slice(key)])
}

#[tokio::test]
async fn moved_redirect_retargets_and_completes_on_the_new_owner() {
    let slot = hash_slot(b"foo");
    let addr_b = spawn_fake_server(vec![vec![reply(b"+OK\r\n")]]).await;
    let moved = format!("-MOVED {slot} {addr_b}\r\n");
    let addr_a = spawn_fake_server(vec![vec![reply(moved.as_bytes())]]).await;

    let topology = Topology::single_shard(addr_a, vec![(0, 16383)]);
    let router = ClusterRouter::from_topology(ClusterConfig::new(vec![]), topology);

    let result = router.execute(keyed("SET", &[b"foo", b"bar"], b"foo")).await.unwrap();
    assert_eq!(result.as_bytes().unwrap().as_ref(), b"OK");
}

#[tokio::test]
async fn ask_redirect_sends_asking_before_the_command_on_the_target() {
    let slot = hash_slot(b"foo");
    // ASKING ack, then the real command's reply: both from the ASK target.
    let addr_b = spawn_fake_server(vec![vec![reply(b"+OK\r\n"), reply(b"+OK\r\n")]]).await;
    let ask = format!("-ASK {slot} {addr_b}\r\n");
    let addr_a = spawn_fake_server(vec![vec![reply(ask.as_bytes())]]).await;

    let topology = Topology::single_shard(addr_a, vec![(0, 16383)]);
    let router = ClusterRouter::from_topology(ClusterConfig::new(vec![]), topology);

    let result = router.execute(keyed("SET", &[b"foo", b"bar"], b"foo")).await.unwrap();
    assert_eq!(result.as_bytes().unwrap().as_ref(), b"OK");
}

#[tokio::test]
async fn transaction_spanning_slots_fails_before_contacting_any_node() {
    // The configured address is never dialed: no fake server is started.
    let topology = Topology::single_shard("127.0.0.1:1", vec![(0, 16383)]);
    let router = ClusterRouter::from_topology(ClusterConfig::new(vec![]), topology);

    let commands = vec![keyed("SET", &[b"foo", b"1"], b"foo"), keyed("SET", &[b"bar", b"2"], b"bar")];
    let err = router.transaction(commands).await.unwrap_err();
    assert!(matches!(err, ClientError::Routing(RoutingError::CrossSlot)));
}
