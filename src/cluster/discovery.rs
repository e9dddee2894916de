//! Topology discovery (§4.6): `CLUSTER SHARDS` with a `CLUSTER SLOTS`
//! fallback for older servers, tried against each candidate node in turn.

use crate::cluster::topology::{parse_cluster_shards, parse_cluster_slots, Topology};
use crate::command::CommandKind;
use crate::config::ClientConfig;
use crate::connection::{self, SendRequest};
use crate::error::{ClientError, ClientResult};
use crate::resp::encode_command;

/// Tries every candidate address in order, returning the first topology a
/// node successfully reports. Each attempt opens and tears down its own
/// connection; discovery does not consume pool capacity.
pub async fn discover(candidates: &[String], config: &ClientConfig) -> ClientResult<Topology> {
    let opts = config.handshake_options(false, None);
    let mut last_err = None;
    for addr in candidates {
        tracing::debug!(%addr, "discovering topology");
        let conn = match connection::connect(addr, &opts, config.handshake_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(%addr, error = %err, "discovery candidate unreachable");
                last_err = Some(err);
                continue;
            }
        };

        let shards_reply = conn
            .send(SendRequest {
                payload: encode_command("CLUSTER", &[b"SHARDS"]),
                kind: CommandKind::Normal,
                timeout: Some(config.handshake_timeout),
            })
            .await;

        let topology = match shards_reply {
            Ok(token) => parse_cluster_shards(&token),
            Err(_) => {
                let slots_reply = conn
                    .send(SendRequest {
                        payload: encode_command("CLUSTER", &[b"SLOTS"]),
                        kind: CommandKind::Normal,
                        timeout: Some(config.handshake_timeout),
                    })
                    .await;
                match slots_reply {
                    Ok(token) => parse_cluster_slots(&token),
                    Err(err) => {
                        conn.shutdown();
                        last_err = Some(err);
                        continue;
                    }
                }
            }
        };

        conn.shutdown();
        match topology {
            Ok(topology) if !topology.shards.is_empty() => return Ok(topology),
            Ok(_) => continue,
            Err(err) => {
                last_err = Some(err);
                continue;
            }
        }
    }
    Err(last_err.unwrap_or(ClientError::Transport(crate::error::TransportError::ConnectionClosed)))
}
