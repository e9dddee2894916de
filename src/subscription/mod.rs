//! Subscription/invalidation machinery (§3, §4.4): per-filter state
//! machines living on a connection, and the pool-level shared connection
//! used for client-side-cache invalidation.

pub mod filter;
pub mod shared;

use std::sync::Arc;

use bytes::Bytes;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connection::ConnectionHandle;
use crate::node_client::NodeClient;

pub use filter::SubscriptionFilter;

pub type SubscriptionId = u64;

/// One delivered push message (§8 scenario 6: `{channel, message}`).
#[derive(Clone, Debug)]
pub struct SubscriptionMessage {
    pub channel: Bytes,
    pub message: Bytes,
    pub pattern: Option<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    UnsubscribedByUser,
    ConnectionClosed,
}

/// An active subscription: a stable id, the filters it attached, and the
/// stream of messages delivered to it. Dropping the stream (or explicitly
/// unsubscribing) detaches from the filters and may emit an unsubscribe
/// command if this was the last subscriber on a filter (§8 scenario 6).
pub struct Subscription {
    pub id: SubscriptionId,
    pub filters: Vec<SubscriptionFilter>,
    pub messages: UnboundedReceiverStream<SubscriptionMessage>,
    pub(crate) conn: ConnectionHandle,
    /// The node this subscription's connection belongs to, kept so a
    /// top-level `unsubscribe` can route the unsubscribe/release without
    /// the caller tracking which node it came from.
    pub(crate) node: Arc<NodeClient>,
}

impl Subscription {
    pub fn new(
        id: SubscriptionId,
        filters: Vec<SubscriptionFilter>,
        messages: UnboundedReceiverStream<SubscriptionMessage>,
        conn: ConnectionHandle,
        node: Arc<NodeClient>,
    ) -> Self {
        Subscription { id, filters, messages, conn, node }
    }
}
