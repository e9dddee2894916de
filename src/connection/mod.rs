//! Connection establishment and the per-connection state machine (§4.3).

pub mod actor;
pub mod handshake;
pub mod pending;

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

pub use actor::{ConnectionHandle, SendRequest, SubscribeRequest, UnsubscribeRequest};
pub use handshake::HandshakeOptions;

use crate::error::{ClientError, ClientResult, TimingError, TransportError};

/// Opens a TCP connection to `addr`, runs the handshake within
/// `handshake_timeout`, and spawns its actor task. The connection is not
/// usable by a pool's `lease()` until this returns (§4.5).
pub async fn connect(
    addr: &str,
    opts: &HandshakeOptions,
    handshake_timeout: Duration,
) -> ClientResult<ConnectionHandle> {
    let mut stream = TcpStream::connect(addr).await.map_err(|source| TransportError::ConnectFailed {
        addr: addr.to_string(),
        source,
    })?;
    stream.set_nodelay(true).ok();

    match timeout(handshake_timeout, handshake::perform_handshake(&mut stream, opts)).await {
        Ok(Ok(())) => Ok(actor::spawn(stream)),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(ClientError::Timing(TimingError::HandshakeTimeout)),
    }
}
