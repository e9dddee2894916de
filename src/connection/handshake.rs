//! Connection handshake (§4.3, §6): `HELLO 3`, best-effort `CLIENT
//! SETINFO`, and configuration-dependent follow-ups, run before a
//! connection is handed to its owner.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{ClientError, ClientResult, TransportError};
use crate::resp::{encode_command, RespToken};

/// Handshake-time configuration, a subset of [`crate::config::ClientConfig`]
/// (kept separate so the handshake module doesn't depend on the whole
/// config surface).
#[derive(Clone, Debug, Default)]
pub struct HandshakeOptions {
    pub auth: Option<(String, String)>,
    pub lib_name: String,
    pub lib_version: String,
    pub no_evict: bool,
    pub tracking_redirect: Option<i64>,
    /// Send `READONLY` once per connection; required when the pool's
    /// configured read policy targets replicas (§9 open question).
    pub readonly: bool,
}

async fn write_command<S>(stream: &mut S, name: &str, args: &[&[u8]]) -> ClientResult<()>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode_command(name, args);
    stream.write_all(&frame).await.map_err(TransportError::from)?;
    Ok(())
}

async fn read_one_frame<S>(stream: &mut S, buf: &mut BytesMut) -> ClientResult<RespToken>
where
    S: tokio::io::AsyncRead + Unpin,
{
    loop {
        if let Some(token) = crate::resp::decode(buf)? {
            return Ok(token);
        }
        buf.reserve(4096);
        let n = stream.read_buf(buf).await.map_err(TransportError::from)?;
        if n == 0 {
            return Err(ClientError::Transport(TransportError::ConnectionClosed));
        }
    }
}

fn is_error(token: &RespToken) -> bool {
    matches!(token, RespToken::SimpleError(_) | RespToken::BulkError(_))
}

/// Runs the full handshake. Order matters: `HELLO 3` must land first since
/// the server only hands out a client id (needed for `CLIENT TRACKING
/// REDIRECT`) once RESP3 is negotiated (§9 open question).
pub async fn perform_handshake<S>(stream: &mut S, opts: &HandshakeOptions) -> ClientResult<()>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);
    tracing::debug!(lib_name = %opts.lib_name, readonly = opts.readonly, "starting handshake");

    match &opts.auth {
        Some((user, pass)) => {
            write_command(stream, "HELLO", &[b"3", b"AUTH", user.as_bytes(), pass.as_bytes()]).await?
        }
        None => write_command(stream, "HELLO", &[b"3"]).await?,
    }
    let hello_reply = read_one_frame(stream, &mut buf).await?;
    if is_error(&hello_reply) {
        return Err(ClientError::Server(crate::error::ServerError::new(
            crate::error::ServerErrorKind::Generic,
            hello_reply.as_bytes().cloned().unwrap_or_default(),
        )));
    }

    // Best-effort: errors here are swallowed per §4.3.
    write_command(stream, "CLIENT", &[b"SETINFO", b"LIB-NAME", opts.lib_name.as_bytes()]).await?;
    let _ = read_one_frame(stream, &mut buf).await;
    write_command(stream, "CLIENT", &[b"SETINFO", b"LIB-VER", opts.lib_version.as_bytes()]).await?;
    let _ = read_one_frame(stream, &mut buf).await;

    if opts.no_evict {
        write_command(stream, "CLIENT", &[b"NO-EVICT", b"ON"]).await?;
        let _ = read_one_frame(stream, &mut buf).await;
    }

    if let Some(id) = opts.tracking_redirect {
        write_command(stream, "CLIENT", &[b"TRACKING", b"REDIRECT", id.to_string().as_bytes()]).await?;
        let _ = read_one_frame(stream, &mut buf).await;
    }

    if opts.readonly {
        write_command(stream, "READONLY", &[]).await?;
        let reply = read_one_frame(stream, &mut buf).await?;
        if is_error(&reply) {
            return Err(ClientError::Server(crate::error::ServerError::new(
                crate::error::ServerErrorKind::Generic,
                reply.as_bytes().cloned().unwrap_or_default(),
            )));
        }
    }

    tracing::debug!("handshake complete");
    Ok(())
}
