//! Subscription filters and the per-filter state machine (§4.4).

use bytes::Bytes;

/// A tagged subscription target. `Invalidate` is the special channel used
/// for client-side-cache invalidation pushes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubscriptionFilter {
    Channel(Bytes),
    Pattern(Bytes),
    ShardChannel(Bytes),
    Invalidate,
}

impl SubscriptionFilter {
    pub fn subscribe_command_name(&self) -> &'static str {
        match self {
            SubscriptionFilter::Channel(_) | SubscriptionFilter::Invalidate => "SUBSCRIBE",
            SubscriptionFilter::Pattern(_) => "PSUBSCRIBE",
            SubscriptionFilter::ShardChannel(_) => "SSUBSCRIBE",
        }
    }

    pub fn unsubscribe_command_name(&self) -> &'static str {
        match self {
            SubscriptionFilter::Channel(_) | SubscriptionFilter::Invalidate => "UNSUBSCRIBE",
            SubscriptionFilter::Pattern(_) => "PUNSUBSCRIBE",
            SubscriptionFilter::ShardChannel(_) => "SUNSUBSCRIBE",
        }
    }

    pub fn wire_name(&self) -> &Bytes {
        static INVALIDATE: Bytes = Bytes::from_static(b"__redis__:invalidate");
        match self {
            SubscriptionFilter::Channel(name)
            | SubscriptionFilter::Pattern(name)
            | SubscriptionFilter::ShardChannel(name) => name,
            SubscriptionFilter::Invalidate => &INVALIDATE,
        }
    }
}

/// The state machine a single filter moves through on a connection
/// (§4.4). `uninitialized` isn't represented: a filter only gets an entry
/// in the connection's table once the first subscriber calls `add`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterState {
    Opening,
    Active,
    Closing,
}

/// Tracks the subscribers sharing one filter on one connection, and the
/// filter's state-machine position.
#[derive(Debug)]
pub struct FilterEntry {
    pub state: FilterState,
    subscriber_ids: Vec<u64>,
}

impl FilterEntry {
    /// A brand-new filter: the caller is expected to have just emitted the
    /// subscribe command.
    pub fn opening(first_subscriber: u64) -> Self {
        FilterEntry { state: FilterState::Opening, subscriber_ids: vec![first_subscriber] }
    }

    /// `add(sub)` in opening/active: attach to the set, no command emitted.
    pub fn attach(&mut self, subscriber_id: u64) {
        self.subscriber_ids.push(subscriber_id);
    }

    /// `added` push: opening -> active, unless the set was already
    /// emptied by a cancellation that arrived before the ack (then it
    /// downgrades straight to closing and the caller must emit the
    /// unsubscribe command that was deferred).
    pub fn mark_active(&mut self) -> bool {
        if self.state != FilterState::Opening {
            return false;
        }
        if self.is_empty() {
            self.state = FilterState::Closing;
            true
        } else {
            self.state = FilterState::Active;
            false
        }
    }

    /// `close(sub)` removes `subscriber_id`. Returns true if the caller
    /// should emit an unsubscribe command now (the set became empty while
    /// active). If it became empty while still opening, the unsubscribe is
    /// deferred until `mark_active` observes the empty set.
    pub fn detach(&mut self, subscriber_id: u64) -> bool {
        self.subscriber_ids.retain(|id| *id != subscriber_id);
        if !self.subscriber_ids.is_empty() {
            return false;
        }
        if self.state == FilterState::Active {
            self.state = FilterState::Closing;
            true
        } else {
            false
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriber_ids.is_empty()
    }

    pub fn contains(&self, subscriber_id: u64) -> bool {
        self.subscriber_ids.contains(&subscriber_id)
    }
}
