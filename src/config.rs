use std::collections::HashMap;
use std::env;

use crate::error::{FabricError, FabricResult};

/// Per-node configuration resolved from the environment.
///
/// `finance-node` reads `.env` (if present, via `dotenvy`) then the process
/// environment; the latter always wins.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub broker_host: String,
    pub monitor_dir: String,
    pub client_id: String,
    pub exchange: String,
    pub result_queue: String,
    pub containment_port: u16,
    pub http_bind: String,
}

impl NodeConfig {
    pub fn from_env() -> FabricResult<Self> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            broker_host: require("BROKER_HOST")?,
            monitor_dir: require("MONITOR_DIR")?,
            client_id: require("CLIENT_ID")?,
            exchange: env::var("EXCHANGE").unwrap_or_else(|_| "regular_snapshot".to_string()),
            result_queue: env::var("RESULT_QUEUE").unwrap_or_else(|_| "snapshot_results".to_string()),
            containment_port: env::var("CONTAINMENT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50051),
            http_bind: env::var("HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }
}

/// Coordinator configuration: the fleet's node addresses and the HTTP client
/// timeouts used for the PREPARE/COMMIT fan-out.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub broker_host: String,
    pub exchange: String,
    pub result_queue: String,
    /// client_id -> node HTTP base URL, used for PREPARE/COMMIT.
    pub node_addrs: HashMap<String, String>,
    /// client_id -> node containment gRPC URL, used for TriggerLockdown.
    pub containment_addrs: HashMap<String, String>,
    pub round_interval_secs: u64,
    /// Path to the JSON-lines mirror of the snapshot audit index.
    pub audit_log_path: String,
}

impl CoordinatorConfig {
    pub fn from_env() -> FabricResult<Self> {
        let _ = dotenvy::dotenv();

        let node_addrs = parse_node_addrs(&require("NODE_ADDRS")?)?;
        let containment_addrs = parse_node_addrs(&require("CONTAINMENT_ADDRS")?)?;

        Ok(Self {
            broker_host: require("BROKER_HOST")?,
            exchange: env::var("EXCHANGE").unwrap_or_else(|_| "regular_snapshot".to_string()),
            result_queue: env::var("RESULT_QUEUE").unwrap_or_else(|_| "snapshot_results".to_string()),
            node_addrs,
            containment_addrs,
            round_interval_secs: env::var("SNAPSHOT_ROUND_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            audit_log_path: env::var("SNAPSHOT_AUDIT_LOG").unwrap_or_else(|_| "snapshots/audit.jsonl".to_string()),
        })
    }
}

fn require(key: &str) -> FabricResult<String> {
    env::var(key).map_err(|_| FabricError::MalformedMessage(format!("missing required env var {key}")))
}

/// Parses `finance1=http://10.0.0.1:8080,finance2=http://10.0.0.2:8080`.
fn parse_node_addrs(raw: &str) -> FabricResult<HashMap<String, String>> {
    let mut map = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (id, addr) = pair.split_once('=').ok_or_else(|| {
            FabricError::MalformedMessage(format!("NODE_ADDRS entry missing '=': {pair}"))
        })?;
        map.insert(id.trim().to_string(), addr.trim().to_string());
    }
    if map.is_empty() {
        return Err(FabricError::MalformedMessage("NODE_ADDRS resolved to zero nodes".into()));
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_node_addrs() {
        let map = parse_node_addrs("finance1=http://a:1,finance2=http://b:2").unwrap();
        assert_eq!(map.get("finance1").unwrap(), "http://a:1");
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn rejects_empty_node_addrs() {
        assert!(parse_node_addrs("").is_err());
    }
}
