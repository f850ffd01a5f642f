pub mod types;

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::metrics::{REPLICATION_ACK_LATENCY_SECONDS, REPLICATION_OPS_TOTAL};
use crate::mutator::LocalMutator;
use crate::node_state::NodeState;
use types::{OpKind, ReplicationOp, SyncAck, ACK_QUORUM, ACK_WAIT};

pub const FANOUT_EXCHANGE: &str = "finance_sync";

/// Broadcasts a mutation to the fanout exchange and waits (best-effort) for
/// ACK quorum. The caller's write always proceeds locally regardless of the
/// outcome -- ACK count is observational, not a commit gate (§4.2).
pub async fn broadcast_sync(
    bus: &dyn Bus,
    state: &NodeState,
    op: OpKind,
    filename: &str,
    content: &str,
) -> ReplicationOp {
    let clock = state.increment_and_snapshot_clock();
    let correlation_id = Uuid::new_v4().to_string();

    let replication_op = ReplicationOp {
        sender_id: state.client_id.clone(),
        op,
        filename: filename.to_string(),
        content: content.to_string(),
        correlation_id: correlation_id.clone(),
        vector_clock: clock,
    };

    let reply_queue = match bus.declare_queue("", false, true).await {
        Ok(name) => name,
        Err(e) => {
            warn!("replication: failed to declare reply queue: {e}");
            return replication_op;
        }
    };
    if let Err(e) = bus.bind_queue(&reply_queue, FANOUT_EXCHANGE).await {
        warn!("replication: failed to bind reply queue: {e}");
    }

    let body = match serde_json::to_vec(&replication_op) {
        Ok(b) => b,
        Err(e) => {
            warn!("replication: failed to encode op: {e}");
            return replication_op;
        }
    };

    if let Err(e) = bus
        .publish_to_exchange(FANOUT_EXCHANGE, &body, Some(&reply_queue), Some(&correlation_id))
        .await
    {
        warn!("replication: broadcast failed: {e}");
        return replication_op;
    }

    let start = std::time::Instant::now();
    let acked = await_ack_quorum(bus, &reply_queue, &correlation_id).await;
    REPLICATION_ACK_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
    REPLICATION_OPS_TOTAL
        .with_label_values(&[&state.client_id, op_label(op), if acked >= ACK_QUORUM { "quorum" } else { "partial" }])
        .inc();
    debug!("replication: {correlation_id} collected {acked}/{ACK_QUORUM} acks");

    replication_op
}

async fn await_ack_quorum(bus: &dyn Bus, reply_queue: &str, correlation_id: &str) -> usize {
    let mut consumer = match bus.consume(reply_queue, "replication-ack").await {
        Ok(c) => c,
        Err(e) => {
            warn!("replication: failed to consume reply queue: {e}");
            return 0;
        }
    };

    let mut senders = HashSet::new();
    let deadline = tokio::time::Instant::now() + ACK_WAIT;

    while senders.len() < ACK_QUORUM {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let next = tokio::time::timeout(remaining, consumer.recv()).await;
        match next {
            Ok(Some(delivery)) => {
                if let Ok(ack) = serde_json::from_slice::<SyncAck>(&delivery.data) {
                    if ack.correlation_id == correlation_id {
                        senders.insert(ack.sender_id);
                    }
                }
                delivery.ack().await;
            }
            Ok(None) => break,
            Err(_timeout) => break,
        }
    }
    senders.len()
}

fn op_label(op: OpKind) -> &'static str {
    match op {
        OpKind::Create => "create",
        OpKind::Write => "write",
        OpKind::Delete => "delete",
    }
}

/// Receiver loop: applies peer-originated operations behind the write gate,
/// gated further by the vector clock (I4), and replies with a SyncAck.
pub async fn run_receiver(bus: Arc<dyn Bus>, state: Arc<NodeState>, mutator: Arc<LocalMutator>) {
    let queue = match bus.declare_queue("", false, true).await {
        Ok(name) => name,
        Err(e) => {
            warn!("replication: failed to declare receiver queue: {e}");
            return;
        }
    };
    if let Err(e) = bus.bind_queue(&queue, FANOUT_EXCHANGE).await {
        warn!("replication: failed to bind receiver queue: {e}");
        return;
    }

    let mut consumer = match bus.consume(&queue, "replication-receiver").await {
        Ok(c) => c,
        Err(e) => {
            warn!("replication: failed to consume fanout: {e}");
            return;
        }
    };

    info!("replication: receiver listening on {queue}");

    while let Some(delivery) = consumer.recv().await {
        let Ok(op) = serde_json::from_slice::<ReplicationOp>(&delivery.data) else {
            delivery.ack().await;
            continue;
        };

        if op.sender_id == state.client_id {
            delivery.ack().await; // echo suppression
            continue;
        }

        state.write_gate.wait_open().await;

        if state.should_apply(&op.sender_id, &op.vector_clock) {
            let outcome = apply(&mutator, &state, &op).await;
            REPLICATION_OPS_TOTAL
                .with_label_values(&[&state.client_id, op_label(op.op), if outcome.is_ok() { "applied" } else { "failed" }])
                .inc();
        } else {
            REPLICATION_OPS_TOTAL
                .with_label_values(&[&state.client_id, op_label(op.op), "stale"])
                .inc();
        }

        if let Some(reply_to) = &delivery.reply_to {
            let ack = SyncAck::ack(state.client_id.clone(), op.correlation_id.clone());
            if let Ok(body) = serde_json::to_vec(&ack) {
                let _ = bus
                    .publish_to_queue(reply_to, &body, None, Some(&op.correlation_id))
                    .await;
            }
        }

        delivery.ack().await;
    }
}

async fn apply(mutator: &LocalMutator, state: &NodeState, op: &ReplicationOp) -> crate::error::FabricResult<()> {
    match op.op {
        OpKind::Create => mutator.create(state, &op.filename, &op.content).await,
        OpKind::Write => mutator.write_append(state, &op.filename, &op.content).await,
        OpKind::Delete => mutator.delete(state, &op.filename).await,
    }
}
