//! Client configuration. Plain builder-style structs mirroring the
//! teacher's `Config` getters, minus file parsing: this core has no
//! persisted state (§6), so configuration is always supplied by the
//! embedding application.

use std::time::Duration;

use crate::command::ReadPolicy;
use crate::connection::HandshakeOptions;

pub const DEFAULT_LIB_NAME: &str = "valkey-client-core";
pub const DEFAULT_LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Per-endpoint connection settings shared by a single node client and by
/// every shard pool in a cluster client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub auth: Option<(String, String)>,
    pub handshake_timeout: Duration,
    pub command_timeout: Option<Duration>,
    pub blocking_command_timeout: Option<Duration>,
    pub no_evict: bool,
    pub pool_min: usize,
    pub pool_max: usize,
    pub idle_max_age: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            auth: None,
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Some(Duration::from_secs(10)),
            blocking_command_timeout: Some(Duration::from_secs(120)),
            no_evict: false,
            pool_min: 1,
            pool_max: 10,
            idle_max_age: Duration::from_secs(300),
        }
    }
}

impl ClientConfig {
    pub fn with_auth(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.auth = Some((user.into(), pass.into()));
        self
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.pool_min = min;
        self.pool_max = max;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    /// Builds the handshake options for a fresh connection. `readonly`
    /// selects whether `READONLY` is issued as part of the handshake, per
    /// the open question in §9: connections intended for replica reads
    /// must send it once, before first use.
    pub fn handshake_options(&self, readonly: bool, tracking_redirect: Option<i64>) -> HandshakeOptions {
        HandshakeOptions {
            auth: self.auth.clone(),
            lib_name: DEFAULT_LIB_NAME.to_string(),
            lib_version: DEFAULT_LIB_VERSION.to_string(),
            no_evict: self.no_evict,
            tracking_redirect,
            readonly,
        }
    }
}

/// How a cluster client discovers its initial topology, and how it
/// behaves once it has one (§4.6).
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub client: ClientConfig,
    pub discovery_endpoints: Vec<String>,
    pub read_policy: ReadPolicy,
    pub maximum_redirects: u32,
    pub tryagain_backoff: Duration,
    pub topology_refresh_interval: Duration,
}

impl ClusterConfig {
    pub fn new(discovery_endpoints: Vec<String>) -> Self {
        ClusterConfig {
            client: ClientConfig::default(),
            discovery_endpoints,
            read_policy: ReadPolicy::Primary,
            maximum_redirects: 16,
            tryagain_backoff: Duration::from_millis(20),
            topology_refresh_interval: Duration::from_secs(300),
        }
    }

    pub fn with_read_policy(mut self, policy: ReadPolicy) -> Self {
        self.read_policy = policy;
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }
}
