//! Node client (§2): wraps a connection pool for a single server endpoint,
//! exposing `execute`/`pipeline`/`subscribe` and distinguishing primary
//! from replica role.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::command::Command;
use crate::config::ClientConfig;
use crate::connection::{HandshakeOptions, SendRequest, SubscribeRequest, UnsubscribeRequest};
use crate::error::{ClientError, ClientResult, TransportError};
use crate::pool::ConnectionPool;
use crate::resp::RespToken;
use crate::subscription::filter::SubscriptionFilter;
use crate::subscription::shared::SharedSubscriptionConnection;
use crate::subscription::{Subscription, SubscriptionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Primary,
    Replica,
}

static NEXT_SUBSCRIBER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

/// A pool plus the shared subscription connection for one endpoint.
#[derive(Clone)]
pub struct NodeClient {
    pub role: Role,
    pool: ConnectionPool,
    shared_sub: Arc<SharedSubscriptionConnection<crate::pool::Leased>>,
}

impl NodeClient {
    pub fn new(addr: impl Into<String>, role: Role, config: ClientConfig) -> Self {
        let readonly = role == Role::Replica;
        let opts = config.handshake_options(readonly, None);
        NodeClient {
            role,
            pool: ConnectionPool::new(addr, config, opts),
            shared_sub: Arc::new(SharedSubscriptionConnection::new()),
        }
    }

    pub fn addr(&self) -> &str {
        self.pool.addr()
    }

    pub async fn execute(&self, command: &Command) -> ClientResult<RespToken> {
        let leased = self.pool.lease().await?;
        leased.handle().send(to_send_request(command)).await
    }

    /// Sends an ordered batch on a single leased connection as one on-wire
    /// pipeline, returning one result per command in input order (§4.6
    /// pipeline step 3). Driving the per-command futures concurrently
    /// (rather than awaiting each before sending the next) is what makes
    /// this an actual pipeline: every write reaches the connection actor's
    /// queue before any reply comes back, instead of one round trip per
    /// command.
    pub async fn pipeline(&self, commands: &[Command]) -> Vec<ClientResult<RespToken>> {
        let leased = match self.pool.lease().await {
            Ok(leased) => leased,
            Err(err) => return commands.iter().map(|_| Err(clone_err(&err))).collect(),
        };
        let handle = leased.handle();
        let sends = commands.iter().map(|command| handle.send(to_send_request(command)));
        futures::future::join_all(sends).await
    }

    pub async fn subscribe(self: &Arc<Self>, filters: Vec<SubscriptionFilter>) -> ClientResult<Subscription> {
        let pool = self.pool.clone();
        let conn = self
            .shared_sub
            .acquire(|| async move {
                let leased = pool.lease().await?;
                // The shared subscription connection outlives any single
                // lease; its lifetime is tracked by `shared_sub`'s own
                // refcount, which holds onto this `Leased` guard until the
                // last subscriber detaches instead of returning it to the
                // pool's idle rotation right away.
                let handle = leased.handle().clone();
                Ok((handle, leased))
            })
            .await?;

        let subscriber_id = NEXT_SUBSCRIBER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        conn.subscribe(SubscribeRequest { filters: filters.clone(), subscriber_id, msg_tx: tx })
            .await?;
        Ok(Subscription::new(
            subscriber_id as SubscriptionId,
            filters,
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            conn,
            self.clone(),
        ))
    }

    /// Detaches from every filter the subscription attached; emits
    /// `UNSUBSCRIBE` only for filters this was the last subscriber on
    /// (§8 scenario 6), then releases the shared connection reference.
    pub fn unsubscribe(&self, subscription: Subscription) {
        subscription.conn.unsubscribe(UnsubscribeRequest {
            filters: subscription.filters,
            subscriber_id: subscription.id,
        });
        self.shared_sub.release();
    }
}

fn to_send_request(command: &Command) -> SendRequest {
    SendRequest {
        payload: command.payload.clone(),
        kind: command.kind.clone(),
        timeout: command.timeout,
    }
}

fn clone_err(err: &ClientError) -> ClientError {
    match err {
        ClientError::Protocol(p) => ClientError::Protocol(p.clone()),
        _ => ClientError::Transport(TransportError::ConnectionClosed),
    }
}
