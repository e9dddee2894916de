//! Error taxonomy for the client core: protocol, transport, timing, server,
//! routing and subscription errors, unified under [`ClientError`].

use std::ops::Range;

use bytes::Bytes;

/// A RESP3 structural parse failure, carrying the byte range that produced it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind:?} at {range:?}")]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub range: Range<usize>,
}

impl ParseError {
    pub fn new(kind: ParseErrorKind, range: Range<usize>) -> Self {
        ParseError { kind, range }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    InvalidLeadingByte,
    InvalidData,
    TooDeeplyNested,
    MissingColonInVerbatim,
    CannotParseInteger,
    CannotParseDouble,
    CannotParseBigNumber,
    UnexpectedType,
    InvalidElementCount,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection closed during cancellation")]
    ConnectionClosedDuringCancellation,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TimingError {
    #[error("command timed out")]
    CommandTimeout,
    #[error("blocking command timed out")]
    BlockingCommandTimeout,
    #[error("handshake timed out")]
    HandshakeTimeout,
}

/// Server-reported error kinds, per §7 of the taxonomy this crate tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    Moved { slot: u16, addr: String },
    Ask { slot: u16, addr: String },
    TryAgain,
    CrossSlot,
    ClusterDown,
    Loading,
    ReadOnly,
    NoAuth,
    WrongPass,
    Generic,
}

/// A `-ERR ...`-style reply from the server, with the original message bytes
/// preserved for callers that want to inspect vendor-specific text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server error {kind:?}: {}", String::from_utf8_lossy(message))]
pub struct ServerError {
    pub kind: ServerErrorKind,
    pub message: Bytes,
}

impl ServerError {
    pub fn new(kind: ServerErrorKind, message: Bytes) -> Self {
        ServerError { kind, message }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("keys in command span more than one slot")]
    CrossSlot,
    #[error("keys across a pipeline group span more than one slot")]
    CrossSlotInPipelineGroup,
    #[error("maximum redirects exceeded")]
    MaxRedirectsExceeded,
    #[error("no known owner for slot {0}")]
    UnknownSlotOwner(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("malformed subscription push message")]
    SubscribeError,
    #[error("transaction aborted, a watched key changed")]
    TransactionAborted,
}

/// Top-level error type returned by every public operation.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Timing(#[from] TimingError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Routing(#[from] RoutingError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
}

impl From<std::io::Error> for ClientError {
    fn from(err: std::io::Error) -> Self {
        ClientError::Transport(TransportError::Io(err))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
