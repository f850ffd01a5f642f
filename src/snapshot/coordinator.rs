//! Coordinator side of the snapshot barrier: drives PREPARE/PERFORM/COMMIT
//! across the fleet every round and collects results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::Bus;
use crate::config::CoordinatorConfig;
use crate::metrics::{SNAPSHOT_ROUNDS_TOTAL, SNAPSHOT_ROUND_DURATION_SECONDS};

use super::types::{SnapshotCommand, SnapshotPhase, SnapshotResult, SnapshotStatus};
use super::{PERFORM_EXCHANGE, RESULT_QUEUE};

const PREPARE_TIMEOUT: Duration = Duration::from_secs(2);
const COMMIT_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound on how long a single round waits for PERFORM results before
/// issuing COMMIT regardless (bounds divergence, see §4.4 guarantees).
const RESULT_COLLECTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SnapshotCoordinator {
    config: CoordinatorConfig,
    bus: Arc<dyn Bus>,
    http: reqwest::Client,
    /// (command_id, client_id) -> result, the audit trail required by §6.
    audit: DashMap<(String, String), SnapshotResult>,
    /// Append-only mirror of `audit`, one JSON object per line, so the
    /// round history survives a coordinator restart.
    audit_log: AsyncMutex<Option<tokio::fs::File>>,
}

impl SnapshotCoordinator {
    pub fn new(config: CoordinatorConfig, bus: Arc<dyn Bus>) -> Self {
        let audit_log_path = config.audit_log_path.clone();
        Self {
            config,
            bus,
            http: reqwest::Client::new(),
            audit: DashMap::new(),
            audit_log: AsyncMutex::new(open_audit_log(&audit_log_path)),
        }
    }

    pub async fn run(self: Arc<Self>) {
        if let Err(e) = self.bus.declare_fanout(PERFORM_EXCHANGE, true).await {
            warn!("coordinator: failed to declare perform exchange: {e}");
        }
        if let Err(e) = self.bus.declare_queue(RESULT_QUEUE, true, false).await {
            warn!("coordinator: failed to declare result queue: {e}");
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.round_interval_secs));
        loop {
            ticker.tick().await;
            self.run_round().await;
        }
    }

    async fn run_round(&self) {
        let command_id = Uuid::new_v4().to_string();
        let started = std::time::Instant::now();
        info!("coordinator: starting snapshot round {command_id}");

        let prepared = self.fan_out_http(&command_id, SnapshotPhase::Prepare, PREPARE_TIMEOUT).await;
        let all_prepared = prepared.values().all(|ok| *ok);

        if !all_prepared {
            warn!("coordinator: PREPARE failed for round {command_id}, aborting");
            self.commit_prepared(&command_id, &prepared).await;
            SNAPSHOT_ROUNDS_TOTAL.with_label_values(&["prepare_failed"]).inc();
            SNAPSHOT_ROUND_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
            return;
        }

        if let Err(e) = self.publish_perform(&command_id).await {
            warn!("coordinator: failed to publish PERFORM for {command_id}: {e}");
            self.commit_prepared(&command_id, &prepared).await;
            SNAPSHOT_ROUNDS_TOTAL.with_label_values(&["perform_publish_failed"]).inc();
            SNAPSHOT_ROUND_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
            return;
        }

        let outcome = self.collect_results(&command_id).await;
        self.commit_prepared(&command_id, &prepared).await;

        SNAPSHOT_ROUNDS_TOTAL.with_label_values(&[outcome]).inc();
        SNAPSHOT_ROUND_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());
        info!("coordinator: round {command_id} finished: {outcome}");
    }

    /// Sends PREPARE or COMMIT to every configured node in parallel. Returns
    /// which nodes acknowledged.
    async fn fan_out_http(&self, command_id: &str, phase: SnapshotPhase, timeout: Duration) -> HashMap<String, bool> {
        let path = match phase {
            SnapshotPhase::Prepare => "snapshot/prepare",
            SnapshotPhase::Commit => "snapshot/commit",
            SnapshotPhase::Perform => unreachable!("PERFORM travels over the bus, not HTTP"),
        };
        let command = SnapshotCommand::new(command_id, phase);

        let calls = self.config.node_addrs.iter().map(|(client_id, addr)| {
            let url = format!("{addr}/{path}");
            let client = self.http.clone();
            let command = command.clone();
            let client_id = client_id.clone();
            async move {
                let result = client.post(&url).json(&command).timeout(timeout).send().await;
                let ok = matches!(result, Ok(resp) if resp.status().is_success());
                (client_id, ok)
            }
        });

        futures_util::future::join_all(calls).await.into_iter().collect()
    }

    async fn commit_prepared(&self, command_id: &str, prepared: &HashMap<String, bool>) {
        let targets: HashMap<String, bool> = prepared
            .iter()
            .filter(|(_, ok)| **ok)
            .map(|(id, _)| (id.clone(), true))
            .collect();
        if targets.is_empty() {
            return;
        }
        let command = SnapshotCommand::new(command_id, SnapshotPhase::Commit);
        let calls = targets.keys().map(|client_id| {
            let addr = &self.config.node_addrs[client_id];
            let url = format!("{addr}/snapshot/commit");
            let client = self.http.clone();
            let command = command.clone();
            async move {
                let _ = client.post(&url).json(&command).timeout(COMMIT_TIMEOUT).send().await;
            }
        });
        futures_util::future::join_all(calls).await;
    }

    async fn publish_perform(&self, command_id: &str) -> crate::error::FabricResult<()> {
        let command = SnapshotCommand::new(command_id, SnapshotPhase::Perform);
        let body = serde_json::to_vec(&command).map_err(|e| crate::error::FabricError::Other(Box::new(e)))?;
        self.bus.publish_to_exchange(PERFORM_EXCHANGE, &body, None, None).await
    }

    /// Consumes `snapshot_results` until every required node has reported,
    /// any node reports FAILED, or the collection timeout elapses.
    async fn collect_results(&self, command_id: &str) -> &'static str {
        let required: std::collections::HashSet<String> = self.config.node_addrs.keys().cloned().collect();
        let mut seen = std::collections::HashSet::new();

        let mut consumer = match self.bus.consume(RESULT_QUEUE, "coordinator-results").await {
            Ok(c) => c,
            Err(e) => {
                warn!("coordinator: failed to consume results: {e}");
                return "result_consume_failed";
            }
        };

        let deadline = tokio::time::Instant::now() + RESULT_COLLECTION_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return "timeout";
            }
            let next = tokio::time::timeout(remaining, consumer.recv()).await;
            let Ok(Some(delivery)) = next else {
                return "timeout";
            };

            if let Ok(result) = serde_json::from_slice::<SnapshotResult>(&delivery.data) {
                if result.command_id == command_id {
                    let failed = result.status == SnapshotStatus::Failed;
                    seen.insert(result.client_id.clone());
                    self.record_audit(result).await;
                    delivery.ack().await;
                    if failed {
                        return "partial_failure";
                    }
                    if required.is_subset(&seen) {
                        return "done";
                    }
                    continue;
                }
            }
            delivery.ack().await;
        }
    }

    /// Upserts into the in-memory audit index and appends a line to the
    /// JSON-lines audit file, if one is configured.
    async fn record_audit(&self, result: SnapshotResult) {
        let mut line = match serde_json::to_vec(&result) {
            Ok(b) => b,
            Err(e) => {
                error!("coordinator: failed to encode audit record: {e}");
                self.audit.insert((result.command_id.clone(), result.client_id.clone()), result);
                return;
            }
        };
        line.push(b'\n');

        let mut guard = self.audit_log.lock().await;
        if let Some(file) = guard.as_mut() {
            if let Err(e) = file.write_all(&line).await {
                warn!("coordinator: failed to append audit log: {e}");
            }
        }
        drop(guard);

        self.audit.insert((result.command_id.clone(), result.client_id.clone()), result);
    }

    pub fn audit_snapshot(&self) -> Vec<SnapshotResult> {
        self.audit.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Opens the JSON-lines audit file in append mode, creating it (and its
/// parent directory) if missing. Returns `None` (logged) on failure so a
/// misconfigured path degrades to in-memory-only auditing rather than
/// crashing the coordinator.
fn open_audit_log(path: &str) -> Option<tokio::fs::File> {
    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("coordinator: failed to create audit log directory: {e}");
            return None;
        }
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(tokio::fs::File::from_std(file)),
        Err(e) => {
            warn!("coordinator: failed to open audit log {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use super::*;
    use crate::bus::Consumer;
    use crate::error::FabricResult;

    /// A `Bus` that panics if actually called -- these tests only exercise
    /// the audit-log mirror, which never touches the bus.
    struct UnusedBus;

    #[async_trait]
    impl Bus for UnusedBus {
        async fn declare_fanout(&self, _name: &str, _durable: bool) -> FabricResult<()> {
            unreachable!()
        }
        async fn declare_queue(&self, _name: &str, _durable: bool, _exclusive: bool) -> FabricResult<String> {
            unreachable!()
        }
        async fn bind_queue(&self, _queue: &str, _exchange: &str) -> FabricResult<()> {
            unreachable!()
        }
        async fn publish_to_exchange(&self, _exchange: &str, _body: &[u8], _reply_to: Option<&str>, _correlation_id: Option<&str>) -> FabricResult<()> {
            unreachable!()
        }
        async fn publish_to_queue(&self, _queue: &str, _body: &[u8], _reply_to: Option<&str>, _correlation_id: Option<&str>) -> FabricResult<()> {
            unreachable!()
        }
        async fn consume(&self, _queue: &str, _consumer_tag: &str) -> FabricResult<Box<dyn Consumer>> {
            unreachable!()
        }
    }

    use crate::error::FabricResult;

    fn scratch_config(label: &str) -> (CoordinatorConfig, PathBuf) {
        let dir = std::env::temp_dir().join(format!("finance-fabric-coordinator-{label}-{}", uuid::Uuid::new_v4()));
        let audit_log_path = dir.join("audit.jsonl");
        let config = CoordinatorConfig {
            broker_host: "unused".to_string(),
            exchange: "unused".to_string(),
            result_queue: "unused".to_string(),
            node_addrs: HashMap::new(),
            containment_addrs: HashMap::new(),
            round_interval_secs: 3600,
            audit_log_path: audit_log_path.to_string_lossy().into_owned(),
        };
        (config, dir)
    }

    #[tokio::test]
    async fn record_audit_upserts_index_and_appends_jsonl_line() {
        let (config, dir) = scratch_config("record");
        let audit_path = PathBuf::from(&config.audit_log_path);
        let coordinator = SnapshotCoordinator::new(config, Arc::new(UnusedBus));

        let result = SnapshotResult::done("round-1", "finance1", "/snapshots/round-1".to_string());
        coordinator.record_audit(result).await;

        let snapshot = coordinator.audit_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].command_id, "round-1");

        let contents = tokio::fs::read_to_string(&audit_path).await.unwrap();
        assert_eq!(contents.lines().count(), 1);
        let parsed: SnapshotResult = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.client_id, "finance1");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn record_audit_appends_multiple_rounds() {
        let (config, dir) = scratch_config("multi");
        let audit_path = PathBuf::from(&config.audit_log_path);
        let coordinator = SnapshotCoordinator::new(config, Arc::new(UnusedBus));

        coordinator.record_audit(SnapshotResult::done("round-1", "finance1", "/a".to_string())).await;
        coordinator.record_audit(SnapshotResult::failed("round-1", "finance2", "disk full".to_string())).await;

        assert_eq!(coordinator.audit_snapshot().len(), 2);
        let contents = tokio::fs::read_to_string(&audit_path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn open_audit_log_creates_missing_parent_directory() {
        let dir = std::env::temp_dir().join(format!("finance-fabric-coordinator-open-{}", uuid::Uuid::new_v4()));
        let path = dir.join("nested").join("audit.jsonl");
        assert!(open_audit_log(&path.to_string_lossy()).is_some());
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
