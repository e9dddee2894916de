//! A scripted fake Valkey server for integration tests: accepts one TCP
//! connection per script, answers the handshake (`HELLO`, two `CLIENT
//! SETINFO`) with `+OK`, then walks a fixed list of steps.
//!
//! This stands in for the teacher's process-spawned test fixtures: rather
//! than driving a real node binary, each test scripts exactly the bytes a
//! node would send back, which is enough to exercise the wire layer and
//! the cluster redirect state machine without a real server.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// One step in a fake connection's script: either wait for the client to
/// write a frame and answer it, or push bytes unprompted (a pub/sub
/// message, say).
pub enum Step {
    Reply(Vec<u8>),
    Push(Vec<u8>),
}

pub fn reply(bytes: &[u8]) -> Step {
    Step::Reply(bytes.to_vec())
}

pub fn push(bytes: &[u8]) -> Step {
    Step::Push(bytes.to_vec())
}

/// Starts a listener on an ephemeral port and spawns one task per entry in
/// `scripts`, each driving one accepted connection. Returns the address to
/// connect to. The handshake's three replies are canned here so callers
/// only script what comes after it.
pub async fn spawn_fake_server(scripts: Vec<Vec<Step>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr").to_string();

    tokio::spawn(async move {
        for script in scripts {
            let (socket, _) = listener.accept().await.expect("accept");
            tokio::spawn(run_connection(socket, script));
        }
    });

    addr
}

async fn run_connection(mut socket: tokio::net::TcpStream, script: Vec<Step>) {
    let mut buf = vec![0u8; 8192];
    for _ in 0..3 {
        let _ = socket.read(&mut buf).await;
        let _ = socket.write_all(b"+OK\r\n").await;
    }
    for step in script {
        match step {
            Step::Reply(bytes) => {
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(&bytes).await;
            }
            Step::Push(bytes) => {
                let _ = socket.write_all(&bytes).await;
            }
        }
    }
    // Keep the socket open a little so a client read in flight doesn't
    // race the task exiting and dropping it.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
}
