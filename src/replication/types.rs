use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type VectorClock = HashMap<String, u64>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Create,
    Write,
    Delete,
}

/// A replicated mutation, broadcast on the `finance_sync` fanout exchange.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationOp {
    pub sender_id: String,
    pub op: OpKind,
    pub filename: String,
    #[serde(default)]
    pub content: String,
    pub correlation_id: String,
    pub vector_clock: VectorClock,
}

/// Reply to a ReplicationOp, routed to the requester's private reply queue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncAck {
    pub sender_id: String,
    pub correlation_id: String,
    pub status: String,
}

impl SyncAck {
    pub fn ack(sender_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            correlation_id: correlation_id.into(),
            status: "ACK".to_string(),
        }
    }
}

/// Fleet size assumed by the quorum wait in broadcast_sync (this node plus
/// three peers).
pub const FLEET_PEER_COUNT: usize = 3;
pub const ACK_QUORUM: usize = 3;
pub const ACK_WAIT: std::time::Duration = std::time::Duration::from_secs(10);
