//! RESP3 token representation (§3, §4.1). A token is an immutable view over
//! a validated byte range; aggregates hold their element count plus the raw
//! bytes of their children, materialized lazily on [`Aggregate::elements`].

use bytes::Bytes;

use crate::error::ParseError;
use crate::resp::decode;

#[derive(Clone, Debug, PartialEq)]
pub enum RespToken {
    SimpleString(Bytes),
    SimpleError(Bytes),
    BulkString(Bytes),
    BulkError(Bytes),
    VerbatimString { format: [u8; 3], content: Bytes },
    Integer(i64),
    Double(f64),
    Boolean(bool),
    Null,
    BigNumber(Bytes),
    Array(Aggregate),
    Map(Aggregate),
    Set(Aggregate),
    Attribute(Aggregate),
    Push(Aggregate),
}

impl RespToken {
    /// True for a leading `>` push frame, the only frames that bypass the
    /// pending-request FIFO (§4.3).
    pub fn is_push(&self) -> bool {
        matches!(self, RespToken::Push(_))
    }

    /// Best-effort view of a scalar token as bytes, for callers that just
    /// want the payload (e.g. reading a bulk string reply).
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RespToken::SimpleString(b)
            | RespToken::SimpleError(b)
            | RespToken::BulkString(b)
            | RespToken::BulkError(b)
            | RespToken::BigNumber(b) => Some(b),
            RespToken::VerbatimString { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// A decoded aggregate: logical element count (pair count for `map`/
/// `attribute`) plus the raw bytes of its children, re-parsed on demand.
#[derive(Clone, Debug, PartialEq)]
pub struct Aggregate {
    count: usize,
    child_tokens: usize,
    payload: Bytes,
}

impl Aggregate {
    pub(crate) fn new(count: usize, child_tokens: usize, payload: Bytes) -> Self {
        Aggregate { count, child_tokens, payload }
    }

    /// Logical element count: item count for array/set/push, pair count for
    /// map/attribute.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Materializes the child tokens by re-parsing the aggregate's payload.
    /// For `map`/`attribute` this yields `2 * len()` tokens, alternating
    /// key and value.
    pub fn elements(&self) -> Result<Vec<RespToken>, ParseError> {
        let mut pos = 0usize;
        let mut out = Vec::with_capacity(self.child_tokens);
        for _ in 0..self.child_tokens {
            let (token, consumed) = decode::parse_frame(&self.payload, pos, 0)?;
            out.push(token);
            pos += consumed;
        }
        Ok(out)
    }
}
