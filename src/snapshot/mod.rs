//! Node side of the two-phase snapshot barrier: PREPARE/COMMIT close and
//! reopen the write gate (served over HTTP, see `crate::api`); PERFORM
//! arrives as a bus broadcast and triggers production of a local snapshot.
//!
//! The produced snapshot is an opaque handle from the fabric's point of
//! view -- the actual archival/dedup backend is an external collaborator
//! (see the purpose & scope notes on the recovery-archive log sink).

pub mod coordinator;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use walkdir::WalkDir;

use crate::bus::Bus;
use crate::node_state::NodeState;
use types::{SnapshotCommand, SnapshotResult};

pub const PERFORM_EXCHANGE: &str = "regular_snapshot";
pub const RESULT_QUEUE: &str = "snapshot_results";

/// Consumes PERFORM broadcasts on this node's durable queue, producing a
/// snapshot and publishing the result. Runs for the lifetime of the process.
pub async fn run_perform_consumer(
    bus: Arc<dyn Bus>,
    state: Arc<NodeState>,
    monitor_dir: PathBuf,
    snapshot_root: PathBuf,
) {
    let queue_name = format!("{PERFORM_EXCHANGE}.{}", state.client_id);
    if let Err(e) = bus.declare_queue(&queue_name, true, false).await {
        error!("snapshot: failed to declare perform queue: {e}");
        return;
    }
    if let Err(e) = bus.bind_queue(&queue_name, PERFORM_EXCHANGE).await {
        error!("snapshot: failed to bind perform queue: {e}");
        return;
    }
    if let Err(e) = bus.declare_queue(RESULT_QUEUE, true, false).await {
        error!("snapshot: failed to declare result queue: {e}");
        return;
    }

    let mut consumer = match bus.consume(&queue_name, "snapshot-perform").await {
        Ok(c) => c,
        Err(e) => {
            error!("snapshot: failed to consume perform queue: {e}");
            return;
        }
    };

    info!("snapshot: perform consumer listening on {queue_name}");

    while let Some(delivery) = consumer.recv().await {
        let Ok(command) = serde_json::from_slice::<SnapshotCommand>(&delivery.data) else {
            delivery.ack().await;
            continue;
        };

        if !state.mark_command_seen(&command.command_id) {
            delivery.ack().await;
            continue;
        }

        let result = produce_snapshot(&state, &monitor_dir, &snapshot_root, &command.command_id);

        let body = match serde_json::to_vec(&result) {
            Ok(b) => b,
            Err(e) => {
                error!("snapshot: failed to encode result: {e}");
                delivery.nack_requeue().await;
                continue;
            }
        };

        if bus.publish_to_queue(RESULT_QUEUE, &body, None, None).await.is_ok() {
            delivery.ack().await;
        } else {
            warn!("snapshot: failed to publish result for {}", command.command_id);
            delivery.nack_requeue().await;
        }
    }
}

/// Copies every file under `monitor_dir` into `snapshot_root/<command_id>/`,
/// preserving relative paths. Returns the resulting directory as the
/// snapshot handle.
fn produce_snapshot(state: &NodeState, monitor_dir: &Path, snapshot_root: &Path, command_id: &str) -> SnapshotResult {
    let dest = snapshot_root.join(command_id);
    match copy_tree(monitor_dir, &dest) {
        Ok(()) => SnapshotResult::done(command_id, state.client_id.clone(), dest.to_string_lossy().into_owned()),
        Err(e) => SnapshotResult::failed(command_id, state.client_id.clone(), e.to_string()),
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in WalkDir::new(src).into_iter().filter_map(|e| e.ok()) {
        let rel = entry.path().strip_prefix(src).unwrap();
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
