//! Cluster topology cache (§3, §4.6): an ordered list of shards plus a
//! dense slot -> shard map, built from `CLUSTER SHARDS` (falling back to
//! `CLUSTER SLOTS` on older servers).

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ClientError, RoutingError};
use crate::resp::RespToken;
use crate::slot::SLOT_COUNT;

#[derive(Debug)]
pub struct Shard {
    pub primary: String,
    pub replicas: Vec<String>,
    pub slot_ranges: Vec<(u16, u16)>,
    replica_cursor: AtomicUsize,
}

impl Shard {
    /// Advances the per-shard round-robin cursor and returns the replica
    /// endpoint it now points at, or the primary if there are none.
    pub fn next_replica(&self) -> &str {
        if self.replicas.is_empty() {
            return &self.primary;
        }
        let i = self.replica_cursor.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        &self.replicas[i]
    }
}

/// The immutable, atomically-swappable topology snapshot (§5: single
/// writer, many readers via `ArcSwap` at the router layer).
#[derive(Debug)]
pub struct Topology {
    pub shards: Vec<Shard>,
    /// `slot_map[slot]` is `Some(shard_index)` for owned slots, `None` for
    /// slots mid-migration on both sides (§3 invariant).
    slot_map: Vec<Option<usize>>,
}

impl Topology {
    /// Builds a topology around a single shard owning `slot_ranges`, with
    /// no replicas. Useful when a topology is known up front and doesn't
    /// need discovery (e.g. a statically pinned single-shard deployment,
    /// or a test harness that wants to skip `CLUSTER SHARDS`).
    pub fn single_shard(primary: impl Into<String>, slot_ranges: Vec<(u16, u16)>) -> Self {
        Topology::from_shards(vec![Shard {
            primary: primary.into(),
            replicas: Vec::new(),
            slot_ranges,
            replica_cursor: AtomicUsize::new(0),
        }])
    }

    fn from_shards(shards: Vec<Shard>) -> Self {
        let mut slot_map = vec![None; SLOT_COUNT as usize];
        for (idx, shard) in shards.iter().enumerate() {
            for (start, end) in &shard.slot_ranges {
                for slot in *start..=*end {
                    slot_map[slot as usize] = Some(idx);
                }
            }
        }
        Topology { shards, slot_map }
    }

    pub fn shard_for_slot(&self, slot: u16) -> Option<&Shard> {
        self.slot_map.get(slot as usize).copied().flatten().map(|idx| &self.shards[idx])
    }

    pub fn shard_for_addr(&self, addr: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.primary == addr || s.replicas.iter().any(|r| r == addr))
    }

    /// Builds a topology with a single, slot-less shard pointed at an
    /// explicit endpoint; used to replace a stale slot owner after MOVED
    /// without discarding the rest of the map (§4.6 MOVED handling).
    pub fn with_slot_owner(&self, slot: u16, addr: &str) -> Topology {
        let mut shards: Vec<Shard> = self
            .shards
            .iter()
            .map(|s| Shard {
                primary: s.primary.clone(),
                replicas: s.replicas.clone(),
                slot_ranges: s
                    .slot_ranges
                    .iter()
                    .flat_map(|(start, end)| split_out(*start, *end, slot))
                    .collect(),
                replica_cursor: AtomicUsize::new(0),
            })
            .collect();
        match shards.iter().position(|s| s.primary == addr) {
            Some(idx) => shards[idx].slot_ranges.push((slot, slot)),
            None => shards.push(Shard {
                primary: addr.to_string(),
                replicas: Vec::new(),
                slot_ranges: vec![(slot, slot)],
                replica_cursor: AtomicUsize::new(0),
            }),
        }
        Topology::from_shards(shards)
    }
}

fn split_out(start: u16, end: u16, slot: u16) -> Vec<(u16, u16)> {
    if slot < start || slot > end {
        return vec![(start, end)];
    }
    let mut out = Vec::new();
    if slot > start {
        out.push((start, slot - 1));
    }
    if slot < end {
        out.push((slot + 1, end));
    }
    out
}

fn as_str(token: &RespToken) -> Option<String> {
    token.as_bytes().map(|b| String::from_utf8_lossy(b).into_owned())
}

fn as_i64(token: &RespToken) -> Option<i64> {
    match token {
        RespToken::Integer(v) => Some(*v),
        other => as_str(other).and_then(|s| s.parse().ok()),
    }
}

/// Parses a `CLUSTER SHARDS` reply: an array of shards, each a flat
/// `["slots", [start, end, ...], "nodes", [node, ...]]` record; each node
/// a flat `["id", id, "port", port, "ip", ip, "role", role, ...]` record.
pub fn parse_cluster_shards(token: &RespToken) -> Result<Topology, ClientError> {
    let RespToken::Array(shards_agg) = token else {
        return Err(routing_err());
    };
    let mut shards = Vec::new();
    for shard_token in shards_agg.elements()? {
        let RespToken::Array(fields) = shard_token else { continue };
        let fields = fields.elements()?;
        let mut slot_ranges = Vec::new();
        let mut primary = None;
        let mut replicas = Vec::new();
        let mut i = 0;
        while i + 1 < fields.len() {
            let key = as_str(&fields[i]).unwrap_or_default();
            match key.as_str() {
                "slots" => {
                    if let RespToken::Array(slots_agg) = &fields[i + 1] {
                        let slots = slots_agg.elements()?;
                        let mut j = 0;
                        while j + 1 < slots.len() {
                            if let (Some(s), Some(e)) = (as_i64(&slots[j]), as_i64(&slots[j + 1])) {
                                slot_ranges.push((s as u16, e as u16));
                            }
                            j += 2;
                        }
                    }
                }
                "nodes" => {
                    if let RespToken::Array(nodes_agg) = &fields[i + 1] {
                        for node_token in nodes_agg.elements()? {
                            if let Some((addr, role)) = parse_node(&node_token)? {
                                if role == "master" || role == "primary" {
                                    primary = Some(addr);
                                } else {
                                    replicas.push(addr);
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
            i += 2;
        }
        if let Some(primary) = primary {
            shards.push(Shard { primary, replicas, slot_ranges, replica_cursor: AtomicUsize::new(0) });
        }
    }
    Ok(Topology::from_shards(shards))
}

fn parse_node(token: &RespToken) -> Result<Option<(String, String)>, ClientError> {
    let RespToken::Array(fields) = token else { return Ok(None) };
    let fields = fields.elements()?;
    let mut ip = None;
    let mut port = None;
    let mut role = None;
    let mut i = 0;
    while i + 1 < fields.len() {
        let key = as_str(&fields[i]).unwrap_or_default();
        match key.as_str() {
            "ip" | "endpoint" if ip.is_none() => ip = as_str(&fields[i + 1]),
            "port" => port = as_i64(&fields[i + 1]),
            "role" => role = as_str(&fields[i + 1]),
            _ => {}
        }
        i += 2;
    }
    match (ip, port, role) {
        (Some(ip), Some(port), Some(role)) => Ok(Some((format!("{ip}:{port}"), role))),
        _ => Ok(None),
    }
}

/// Parses the older `CLUSTER SLOTS` reply: an array of
/// `[start, end, [master_ip, master_port, ...], [replica_ip, ...], ...]`.
pub fn parse_cluster_slots(token: &RespToken) -> Result<Topology, ClientError> {
    let RespToken::Array(rows) = token else {
        return Err(routing_err());
    };
    let mut shards = Vec::new();
    for row_token in rows.elements()? {
        let RespToken::Array(row) = row_token else { continue };
        let row = row.elements()?;
        if row.len() < 3 {
            continue;
        }
        let (Some(start), Some(end)) = (as_i64(&row[0]), as_i64(&row[1])) else { continue };
        let mut endpoints = Vec::new();
        for entry in &row[2..] {
            let RespToken::Array(parts) = entry else { continue };
            let parts = parts.elements()?;
            if parts.len() < 2 {
                continue;
            }
            let (Some(ip), Some(port)) = (as_str(&parts[0]), as_i64(&parts[1])) else { continue };
            endpoints.push(format!("{ip}:{port}"));
        }
        if endpoints.is_empty() {
            continue;
        }
        let primary = endpoints.remove(0);
        shards.push(Shard {
            primary,
            replicas: endpoints,
            slot_ranges: vec![(start as u16, end as u16)],
            replica_cursor: AtomicUsize::new(0),
        });
    }
    Ok(Topology::from_shards(shards))
}

fn routing_err() -> ClientError {
    ClientError::Routing(RoutingError::UnknownSlotOwner(0))
}
