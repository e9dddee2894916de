//! The top-level public API (§6): a single entry point over either a
//! standalone node or a cluster, so application code does not need to
//! know which it is talking to beyond how it was constructed.

use std::future::Future;
use std::sync::Arc;

use crate::cluster::ClusterRouter;
use crate::command::Command;
use crate::config::{ClientConfig, ClusterConfig};
use crate::connection::actor::classify_reply;
use crate::error::{ClientError, ClientResult, RoutingError, SubscriptionError};
use crate::node_client::{NodeClient, Role};
use crate::resp::{encode_command, RespToken};
use crate::subscription::filter::SubscriptionFilter;
use crate::subscription::Subscription;

enum Mode {
    Standalone(Arc<NodeClient>),
    Cluster(ClusterRouter),
}

/// The transport-independent client surface: `execute`, `pipeline`,
/// `transaction`, `subscribe`/`unsubscribe`, and `with_connection` for
/// pinning a node across a sequence of calls.
pub struct Client {
    mode: Mode,
}

impl Client {
    pub fn standalone(addr: impl Into<String>, config: ClientConfig) -> Self {
        Client { mode: Mode::Standalone(Arc::new(NodeClient::new(addr, Role::Primary, config))) }
    }

    pub async fn cluster(config: ClusterConfig) -> ClientResult<Self> {
        Ok(Client { mode: Mode::Cluster(ClusterRouter::connect(config).await?) })
    }

    pub async fn execute(&self, command: Command) -> ClientResult<RespToken> {
        match &self.mode {
            Mode::Standalone(node) => node.execute(&command).await,
            Mode::Cluster(router) => router.execute(command).await,
        }
    }

    pub async fn pipeline(&self, commands: Vec<Command>) -> Vec<ClientResult<RespToken>> {
        match &self.mode {
            Mode::Standalone(node) => node.pipeline(&commands).await,
            Mode::Cluster(router) => router.pipeline(commands).await,
        }
    }

    pub async fn transaction(&self, commands: Vec<Command>) -> ClientResult<Vec<ClientResult<RespToken>>> {
        match &self.mode {
            Mode::Standalone(node) => standalone_transaction(node, commands).await,
            Mode::Cluster(router) => router.transaction(commands).await,
        }
    }

    pub async fn subscribe(&self, filters: Vec<SubscriptionFilter>) -> ClientResult<Subscription> {
        match &self.mode {
            Mode::Standalone(node) => node.subscribe(filters).await,
            Mode::Cluster(router) => router.subscribe(filters).await,
        }
    }

    /// Detaches a subscription from whichever node it was opened against.
    /// The subscription carries its own node reference, so this works the
    /// same whether the client is standalone or clustered.
    pub fn unsubscribe(&self, subscription: Subscription) {
        let node = subscription.node.clone();
        node.unsubscribe(subscription);
    }

    /// Pins a single node connection across `body`, routed the same way a
    /// lone command with `keys`/`read_only` would be, then runs `body`
    /// against that node (§6 `with_connection`).
    pub async fn with_connection<F, Fut, T>(&self, keys: &[bytes::Bytes], read_only: bool, body: F) -> ClientResult<T>
    where
        F: FnOnce(&NodeClient) -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        match &self.mode {
            Mode::Standalone(node) => body(node.as_ref()).await,
            Mode::Cluster(router) => {
                let node = router.node_for_keys(keys, read_only)?;
                body(node.as_ref()).await
            }
        }
    }
}

async fn standalone_transaction(node: &NodeClient, commands: Vec<Command>) -> ClientResult<Vec<ClientResult<RespToken>>> {
    let mut batch = Vec::with_capacity(commands.len() + 2);
    batch.push(Command::new(encode_command("MULTI", &[])));
    batch.extend(commands.iter().cloned());
    batch.push(Command::new(encode_command("EXEC", &[])));

    let mut group = node.pipeline(&batch).await;
    let exec_result = group.pop().expect("EXEC reply present");
    if let Some(Err(err)) = group.into_iter().next() {
        return Err(err);
    }

    match exec_result {
        Ok(RespToken::Array(elements)) => {
            let elements = elements.elements()?;
            Ok(elements.into_iter().map(resp_or_server_err).collect())
        }
        Ok(RespToken::Null) => Err(ClientError::Subscription(SubscriptionError::TransactionAborted)),
        Ok(_) => Err(ClientError::Routing(RoutingError::MaxRedirectsExceeded)),
        Err(err) => Err(err),
    }
}

fn resp_or_server_err(token: RespToken) -> ClientResult<RespToken> {
    match classify_reply(&token) {
        Some(server_err) => Err(ClientError::Server(server_err)),
        None => Ok(token),
    }
}
