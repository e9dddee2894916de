//! Single-node wire-level scenarios against a scripted fake server:
//! a plain command, a pipelined batch, and a subscribe/publish/unsubscribe
//! cycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_stream::StreamExt;
use valkey_client_core::resp::encode_command;
use valkey_client_core::{ClientConfig, Command, NodeClient, RespToken, Role, SubscriptionFilter};

use common::{push, reply, spawn_fake_server};

fn keyed(name: &str, args: &[&[u8]], key: &[u8]) -> Command {
    Command::new(encode_command(name, args)).with_keys(vec![Bytes::copy_from_slice(key)])
}

#[tokio::test]
async fn get_reads_a_bulk_string_reply() {
    let addr = spawn_fake_server(vec![vec![reply(b"$3\r\nBar\r\n")]]).await;
    let node = NodeClient::new(addr, Role::Primary, ClientConfig::default());

    let result = node.execute(&keyed("GET", &[b"foo"], b"foo")).await.unwrap();
    assert_eq!(result.as_bytes().unwrap().as_ref(), b"Bar");
}

#[tokio::test]
async fn pipeline_returns_one_result_per_command_in_order() {
    let addr = spawn_fake_server(vec![vec![reply(b"+OK\r\n"), reply(b":101\r\n"), reply(b"$3\r\n101\r\n")]]).await;
    let node = NodeClient::new(addr, Role::Primary, ClientConfig::default());

    let commands = vec![keyed("SET", &[b"k", b"100"], b"k"), keyed("INCR", &[b"k"], b"k"), keyed("GET", &[b"k"], b"k")];
    let results = node.pipeline(&commands).await;

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert_eq!(results[1].as_ref().unwrap(), &RespToken::Integer(101));
    assert_eq!(results[2].as_ref().unwrap().as_bytes().unwrap().as_ref(), b"101");
}

#[tokio::test]
async fn subscribe_delivers_a_message_then_unsubscribes() {
    let addr = spawn_fake_server(vec![vec![
        reply(b">3\r\n$9\r\nsubscribe\r\n$3\r\nch1\r\n:1\r\n"),
        push(b">3\r\n$7\r\nmessage\r\n$3\r\nch1\r\n$5\r\nhello\r\n"),
        reply(b">3\r\n$11\r\nunsubscribe\r\n$3\r\nch1\r\n:0\r\n"),
    ]])
    .await;
    let node = Arc::new(NodeClient::new(addr, Role::Primary, ClientConfig::default()));

    let mut subscription = node.subscribe(vec![SubscriptionFilter::Channel(Bytes::from_static(b"ch1"))]).await.unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(2), subscription.messages.next())
        .await
        .expect("message arrives before the timeout")
        .expect("stream stays open");
    assert_eq!(delivered.channel.as_ref(), b"ch1");
    assert_eq!(delivered.message.as_ref(), b"hello");

    node.unsubscribe(subscription);
}
