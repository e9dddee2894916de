//! Command representation and routing metadata (§9 "replacing dynamic
//! dispatch on commands"). The command catalogue itself — the generated
//! per-command records — is an external collaborator; the core only
//! consumes the shape here: an encoded byte payload plus routing data. It
//! never calls into command-specific virtual methods.

use std::time::Duration;

use bytes::Bytes;

use crate::subscription::filter::SubscriptionFilter;

/// What kind of accounting a pending request needs at the connection layer
/// (§3 "pending request").
#[derive(Clone, Debug)]
pub enum CommandKind {
    Normal,
    Subscribe(Vec<SubscriptionFilter>),
    Unsubscribe(Vec<SubscriptionFilter>),
    Transaction,
    Blocking,
}

impl CommandKind {
    pub fn is_blocking(&self) -> bool {
        matches!(self, CommandKind::Blocking)
    }
}

/// A single command ready to be written to a connection: already RESP3
/// encoded, plus enough routing metadata for the cluster router and
/// connection actor to do their jobs without understanding the command's
/// semantics.
#[derive(Clone, Debug)]
pub struct Command {
    pub payload: Bytes,
    pub keys: Vec<Bytes>,
    pub read_only: bool,
    pub kind: CommandKind,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(payload: Bytes) -> Self {
        Command {
            payload,
            keys: Vec::new(),
            read_only: false,
            kind: CommandKind::Normal,
            timeout: None,
        }
    }

    pub fn with_keys(mut self, keys: Vec<Bytes>) -> Self {
        self.keys = keys;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_kind(mut self, kind: CommandKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn is_keyless(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Replica-read selection strategy (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReadPolicy {
    #[default]
    Primary,
    CycleReplicas,
    RandomReplica,
}
