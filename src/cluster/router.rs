//! Cluster router (§4.6): the slot map plus MOVED/ASK/TRYAGAIN handling,
//! pipeline splitting by node, and cross-slot transaction fast-fail.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use rand::Rng;

use crate::cluster::discovery;
use crate::cluster::topology::Topology;
use crate::command::{Command, ReadPolicy};
use crate::config::ClusterConfig;
use crate::connection::actor::classify_reply;
use crate::error::{ClientError, ClientResult, RoutingError, ServerError, ServerErrorKind, SubscriptionError};
use crate::node_client::{NodeClient, Role};
use crate::resp::encode_command;
use crate::resp::RespToken;
use crate::slot::hash_slot;
use crate::subscription::filter::SubscriptionFilter;
use crate::subscription::Subscription;

/// How many consecutive transport failures against the same endpoint
/// trigger an eager topology refresh, independent of the periodic one.
const TRANSPORT_FAILURE_REFRESH_THRESHOLD: u32 = 3;

struct Inner {
    topology: ArcSwap<Topology>,
    nodes: parking_lot::RwLock<HashMap<String, Arc<NodeClient>>>,
    config: ClusterConfig,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Consecutive transport failures per endpoint since its last success
    /// or refresh, counted towards `TRANSPORT_FAILURE_REFRESH_THRESHOLD`.
    transport_failures: parking_lot::Mutex<HashMap<String, u32>>,
}

/// Routes commands across a Valkey/Redis cluster. Holds the topology
/// behind a single-writer, many-reader `ArcSwap` (§5) and a per-endpoint
/// table of node clients, created lazily as the topology is discovered or
/// patched by redirects. Cheaply `Clone`-able; a background task holds a
/// weak reference for periodic refreshes without keeping the router alive
/// past its last real owner.
#[derive(Clone)]
pub struct ClusterRouter {
    inner: Arc<Inner>,
}

impl ClusterRouter {
    pub async fn connect(config: ClusterConfig) -> ClientResult<Self> {
        let topology = discovery::discover(&config.discovery_endpoints, &config.client).await?;
        Ok(Self::from_topology(config, topology))
    }

    /// Builds a router around an already-known topology, skipping
    /// discovery entirely. Used for statically-pinned deployments and by
    /// tests that seed a topology directly. Spawns the periodic topology
    /// refresh task (§4.6) unless `topology_refresh_interval` is zero.
    pub fn from_topology(config: ClusterConfig, topology: Topology) -> Self {
        let inner = Arc::new(Inner {
            topology: ArcSwap::from_pointee(topology),
            nodes: parking_lot::RwLock::new(HashMap::new()),
            config,
            refresh_lock: tokio::sync::Mutex::new(()),
            transport_failures: parking_lot::Mutex::new(HashMap::new()),
        });
        let router = ClusterRouter { inner };
        router.ensure_nodes_for_current_topology();
        router.spawn_periodic_refresh();
        router
    }

    /// Spawns a background task that calls `refresh()` every
    /// `topology_refresh_interval`, holding only a `Weak` reference so it
    /// exits once every `ClusterRouter` handle has been dropped.
    fn spawn_periodic_refresh(&self) {
        let interval = self.inner.config.topology_refresh_interval;
        if interval.is_zero() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; nothing to refresh yet
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let router = ClusterRouter { inner };
                if let Err(err) = router.refresh().await {
                    tracing::warn!(error = %err, "periodic topology refresh failed");
                }
            }
        });
    }

    fn ensure_nodes_for_current_topology(&self) {
        let topology = self.inner.topology.load();
        for shard in &topology.shards {
            self.node(&shard.primary, Role::Primary);
            for replica in &shard.replicas {
                self.node(replica, Role::Replica);
            }
        }
    }

    fn node(&self, addr: &str, role: Role) -> Arc<NodeClient> {
        if let Some(existing) = self.inner.nodes.read().get(addr) {
            return existing.clone();
        }
        let mut nodes = self.inner.nodes.write();
        nodes
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(NodeClient::new(addr, role, self.inner.config.client.clone())))
            .clone()
    }

    /// Refreshes the topology against a currently-known node, falling back
    /// to other known nodes and then the original discovery endpoints.
    /// Concurrent callers coalesce onto a single in-flight refresh.
    pub async fn refresh(&self) -> ClientResult<()> {
        let _guard = self.inner.refresh_lock.lock().await;
        let current = self.inner.topology.load();
        let mut candidates: Vec<String> =
            current.shards.iter().flat_map(|s| std::iter::once(s.primary.clone()).chain(s.replicas.clone())).collect();
        candidates.extend(self.inner.config.discovery_endpoints.iter().cloned());
        drop(current);

        let topology = discovery::discover(&candidates, &self.inner.config.client).await?;
        tracing::info!(shards = topology.shards.len(), "topology refreshed");
        self.inner.topology.store(Arc::new(topology));
        self.inner.transport_failures.lock().clear();
        self.ensure_nodes_for_current_topology();
        Ok(())
    }

    /// Records a transport failure against `addr`; returns `true` (and
    /// resets the counter) once `TRANSPORT_FAILURE_REFRESH_THRESHOLD`
    /// consecutive failures have piled up, signaling an eager refresh.
    fn record_transport_failure(&self, addr: &str) -> bool {
        let mut failures = self.inner.transport_failures.lock();
        let count = failures.entry(addr.to_string()).or_insert(0);
        *count += 1;
        if *count >= TRANSPORT_FAILURE_REFRESH_THRESHOLD {
            *count = 0;
            true
        } else {
            false
        }
    }

    fn record_transport_success(&self, addr: &str) {
        self.inner.transport_failures.lock().remove(addr);
    }

    fn slot_for_keys(keys: &[Bytes]) -> Result<Option<u16>, RoutingError> {
        let mut slots = keys.iter().map(|k| hash_slot(k));
        let Some(first) = slots.next() else { return Ok(None) };
        if slots.all(|s| s == first) {
            Ok(Some(first))
        } else {
            Err(RoutingError::CrossSlot)
        }
    }

    /// Picks the target endpoint for a keyed command: primary for writes,
    /// the configured read policy's pick for reads.
    fn select_addr(&self, topology: &Topology, command: &Command) -> Result<(String, Role), RoutingError> {
        match Self::slot_for_keys(&command.keys)? {
            Some(slot) => {
                let shard = topology.shard_for_slot(slot).ok_or(RoutingError::UnknownSlotOwner(slot))?;
                if !command.read_only {
                    return Ok((shard.primary.clone(), Role::Primary));
                }
                match self.inner.config.read_policy {
                    ReadPolicy::Primary => Ok((shard.primary.clone(), Role::Primary)),
                    ReadPolicy::CycleReplicas => {
                        if shard.replicas.is_empty() {
                            Ok((shard.primary.clone(), Role::Primary))
                        } else {
                            Ok((shard.next_replica().to_string(), Role::Replica))
                        }
                    }
                    ReadPolicy::RandomReplica => {
                        if shard.replicas.is_empty() {
                            Ok((shard.primary.clone(), Role::Primary))
                        } else {
                            let idx = rand::rng().random_range(0..shard.replicas.len());
                            Ok((shard.replicas[idx].clone(), Role::Replica))
                        }
                    }
                }
            }
            None => topology
                .shards
                .first()
                .map(|s| (s.primary.clone(), Role::Primary))
                .ok_or(RoutingError::UnknownSlotOwner(0)),
        }
    }

    fn apply_moved(&self, slot: u16, addr: &str) {
        let current = self.inner.topology.load_full();
        self.inner.topology.store(Arc::new(current.with_slot_owner(slot, addr)));
        self.node(addr, Role::Primary);
    }

    /// Routes and sends a single command, following MOVED/ASK/TRYAGAIN up
    /// to `maximum_redirects` times (§4.6).
    pub async fn execute(&self, command: Command) -> ClientResult<RespToken> {
        let mut override_target: Option<(String, bool)> = None;
        for _ in 0..self.inner.config.maximum_redirects.max(1) {
            let addr_asking = match &override_target {
                Some((addr, asking)) => (addr.clone(), *asking),
                None => {
                    let topology = self.inner.topology.load();
                    let (addr, _role) = self.select_addr(&topology, &command).map_err(ClientError::Routing)?;
                    (addr, false)
                }
            };
            let (addr, asking) = addr_asking;
            let node = self.node(&addr, Role::Primary);

            let result = if asking {
                let asking_cmd = Command::new(encode_command("ASKING", &[]));
                let mut batch = node.pipeline(&[asking_cmd, command.clone()]).await;
                batch.pop().expect("command reply present")
            } else {
                node.execute(&command).await
            };

            match result {
                Ok(token) => {
                    self.record_transport_success(&addr);
                    return Ok(token);
                }
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::Moved { slot, addr }, .. })) => {
                    tracing::debug!(slot, %addr, "MOVED redirect");
                    self.apply_moved(slot, &addr);
                    override_target = Some((addr, false));
                }
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::Ask { addr, .. }, .. })) => {
                    tracing::debug!(%addr, "ASK redirect");
                    override_target = Some((addr, true));
                }
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::TryAgain, .. })) => {
                    tracing::debug!(backoff = ?self.inner.config.tryagain_backoff, "TRYAGAIN, backing off");
                    tokio::time::sleep(self.inner.config.tryagain_backoff).await;
                    override_target = None;
                }
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::ClusterDown, .. })) => {
                    tracing::warn!("CLUSTERDOWN, refreshing topology");
                    let _ = self.refresh().await;
                    override_target = None;
                }
                Err(err @ ClientError::Transport(_)) => {
                    if self.record_transport_failure(&addr) {
                        tracing::warn!(%addr, "repeated transport failures, refreshing topology");
                        let _ = self.refresh().await;
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::Routing(RoutingError::MaxRedirectsExceeded))
    }

    /// Splits a pipeline by target node, dispatches each group concurrently
    /// as one on-wire pipeline, and places replies back at their original
    /// indices (§4.6 pipeline algorithm).
    pub async fn pipeline(&self, commands: Vec<Command>) -> Vec<ClientResult<RespToken>> {
        let n = commands.len();
        let topology = self.inner.topology.load_full();

        let mut resolved: Vec<Option<Result<(String, Role), RoutingError>>> = vec![None; n];
        for (i, command) in commands.iter().enumerate() {
            if !command.is_keyless() {
                resolved[i] = Some(self.select_addr(&topology, command));
            }
        }
        // Keyless commands adopt the nearest surrounding keyed command's
        // target; scan forward then backward to cover both directions.
        let mut last_ok: Option<(String, Role)> = None;
        for slot in resolved.iter_mut() {
            match slot {
                Some(Ok(target)) => last_ok = Some(target.clone()),
                None => {
                    if let Some(target) = &last_ok {
                        *slot = Some(Ok(target.clone()));
                    }
                }
                Some(Err(_)) => {}
            }
        }
        let mut next_ok: Option<(String, Role)> = None;
        for slot in resolved.iter_mut().rev() {
            match slot {
                Some(Ok(target)) => next_ok = Some(target.clone()),
                None => {
                    if let Some(target) = &next_ok {
                        *slot = Some(Ok(target.clone()));
                    }
                }
                Some(Err(_)) => {}
            }
        }
        if resolved.iter().all(Option::is_none) {
            if let Some((addr, role)) = topology.shards.first().map(|s| (s.primary.clone(), Role::Primary)) {
                for slot in resolved.iter_mut() {
                    *slot = Some(Ok((addr.clone(), role)));
                }
            }
        }

        let mut results: Vec<Option<ClientResult<RespToken>>> = (0..n).map(|_| None).collect();
        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, target) in resolved.into_iter().enumerate() {
            match target {
                Some(Ok((addr, _role))) => groups.entry(addr).or_default().push(i),
                Some(Err(err)) => results[i] = Some(Err(ClientError::Routing(err))),
                None => results[i] = Some(Err(ClientError::Routing(RoutingError::UnknownSlotOwner(0)))),
            }
        }

        let dispatches = groups.into_iter().map(|(addr, indices)| {
            let node = self.node(&addr, Role::Primary);
            let group_commands: Vec<Command> = indices.iter().map(|&i| commands[i].clone()).collect();
            async move {
                let group_results = node.pipeline(&group_commands).await;
                (indices, group_results)
            }
        });
        for (indices, group_results) in futures::future::join_all(dispatches).await {
            for (idx, result) in indices.into_iter().zip(group_results) {
                results[idx] = Some(result);
            }
        }

        let mut finalized = Vec::with_capacity(n);
        for (i, result) in results.into_iter().enumerate() {
            let result = result.expect("every index resolved exactly once");
            let needs_retry = matches!(
                &result,
                Err(ClientError::Server(ServerError {
                    kind: ServerErrorKind::Moved { .. } | ServerErrorKind::Ask { .. } | ServerErrorKind::TryAgain,
                    ..
                }))
            );
            finalized.push(if needs_retry { self.execute(commands[i].clone()).await } else { result });
        }
        finalized
    }

    /// Runs `MULTI`/commands/`EXEC` on the single node owning every key in
    /// the transaction, failing fast without contacting the server if the
    /// keys span more than one slot (§4.6, §8 scenario 5).
    pub async fn transaction(&self, commands: Vec<Command>) -> ClientResult<Vec<ClientResult<RespToken>>> {
        let all_keys: Vec<Bytes> = commands.iter().flat_map(|c| c.keys.iter().cloned()).collect();
        let slot = Self::slot_for_keys(&all_keys).map_err(ClientError::Routing)?;

        let mut override_target: Option<(String, bool)> = None;
        for _ in 0..self.inner.config.maximum_redirects.max(1) {
            let topology = self.inner.topology.load_full();
            let (addr, asking) = match &override_target {
                Some((addr, asking)) => (addr.clone(), *asking),
                None => {
                    let addr = match slot {
                        Some(slot) => topology
                            .shard_for_slot(slot)
                            .map(|s| s.primary.clone())
                            .ok_or(ClientError::Routing(RoutingError::UnknownSlotOwner(slot)))?,
                        None => topology
                            .shards
                            .first()
                            .map(|s| s.primary.clone())
                            .ok_or(ClientError::Routing(RoutingError::UnknownSlotOwner(0)))?,
                    };
                    (addr, false)
                }
            };
            let node = self.node(&addr, Role::Primary);

            let mut batch = Vec::with_capacity(commands.len() + 3);
            if asking {
                batch.push(Command::new(encode_command("ASKING", &[])));
            }
            batch.push(Command::new(encode_command("MULTI", &[])));
            batch.extend(commands.iter().cloned());
            batch.push(Command::new(encode_command("EXEC", &[])));

            let mut group = node.pipeline(&batch).await;
            let exec_result = group.pop().expect("EXEC reply present");
            let preamble_len = if asking { 2 } else { 1 };
            for (idx, ack) in group.into_iter().enumerate() {
                if idx < preamble_len {
                    if let Err(err) = ack {
                        return Err(err);
                    }
                }
            }

            match exec_result {
                Ok(RespToken::Array(elements)) => {
                    let elements = elements.elements()?;
                    if elements.len() != commands.len() {
                        return Err(ClientError::Routing(RoutingError::MaxRedirectsExceeded));
                    }
                    return Ok(elements.into_iter().map(resp_or_server_err).collect());
                }
                Ok(RespToken::Null) => {
                    return Err(ClientError::Subscription(SubscriptionError::TransactionAborted));
                }
                Ok(_) => return Err(ClientError::Routing(RoutingError::MaxRedirectsExceeded)),
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::Moved { slot, addr }, .. })) => {
                    self.apply_moved(slot, &addr);
                    override_target = Some((addr, false));
                }
                Err(ClientError::Server(ServerError { kind: ServerErrorKind::Ask { addr, .. }, .. })) => {
                    override_target = Some((addr, true));
                }
                Err(err) => return Err(err),
            }
        }
        Err(ClientError::Routing(RoutingError::MaxRedirectsExceeded))
    }

    /// Subscribes to the given filters. Channel/pattern filters may land on
    /// any node; shard-channel filters must go to the shard owning the
    /// channel name's slot (§4.6 cluster subscriptions).
    pub async fn subscribe(&self, filters: Vec<SubscriptionFilter>) -> ClientResult<Subscription> {
        let topology = self.inner.topology.load();
        let addr = match filters.iter().find_map(shard_channel_name) {
            Some(name) => {
                let slot = hash_slot(name);
                topology
                    .shard_for_slot(slot)
                    .map(|s| s.primary.clone())
                    .ok_or(ClientError::Routing(RoutingError::UnknownSlotOwner(slot)))?
            }
            None => topology
                .shards
                .first()
                .map(|s| s.primary.clone())
                .ok_or(ClientError::Routing(RoutingError::UnknownSlotOwner(0)))?,
        };
        drop(topology);
        let node = self.node(&addr, Role::Primary);
        node.subscribe(filters).await
    }

    /// Resolves the node a `with_connection(keys, read_only, ...)` call
    /// should pin, using the same selection policy as a lone command.
    pub fn node_for_keys(&self, keys: &[Bytes], read_only: bool) -> ClientResult<Arc<NodeClient>> {
        let topology = self.inner.topology.load();
        let synthetic = Command::new(Bytes::new()).with_keys(keys.to_vec()).read_only(read_only);
        let (addr, role) = self.select_addr(&topology, &synthetic).map_err(ClientError::Routing)?;
        Ok(self.node(&addr, role))
    }
}

fn shard_channel_name(filter: &SubscriptionFilter) -> Option<&Bytes> {
    match filter {
        SubscriptionFilter::ShardChannel(name) => Some(name),
        _ => None,
    }
}

fn resp_or_server_err(token: RespToken) -> ClientResult<RespToken> {
    match classify_reply(&token) {
        Some(server_err) => Err(ClientError::Server(server_err)),
        None => Ok(token),
    }
}
