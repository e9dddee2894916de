//! Cluster support (§4.6): topology discovery and caching, and the router
//! that turns a command plus the current topology into a target node.

pub mod discovery;
pub mod router;
pub mod topology;

pub use router::ClusterRouter;
pub use topology::{Shard, Topology};
