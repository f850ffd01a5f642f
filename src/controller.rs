//! Per-node Controller: the only component allowed to mutate `lockdown`,
//! the write gate, and the vector clock (indirectly, through the helpers on
//! `NodeState`). Wires the detector, replication, snapshot, containment,
//! and HTTP surfaces together for one process.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tonic::transport::Server;
use tracing::{info, warn};

use crate::api::{self, ApiState};
use crate::bus::{Bus, EventBus};
use crate::config::NodeConfig;
use crate::containment::ContainmentService;
use crate::detection_engine::FILE_EVENTS_QUEUE;
use crate::detector::types::{EventKind, FileEvent};
use crate::detector::BehaviouralDetector;
use crate::mutator::LocalMutator;
use crate::node_state::NodeState;
use crate::replication;
use crate::snapshot;

/// Legacy lockdown broadcast queue, superseded by the Containment RPC. Kept
/// so a node replaying an old recording against this fleet still locks down
/// instead of wedging, per the deprecation note on this queue.
const LEGACY_COMMANDS_QUEUE: &str = "commands";

pub struct Controller {
    config: NodeConfig,
    state: Arc<NodeState>,
    bus: Arc<dyn Bus>,
    mutator: Arc<LocalMutator>,
}

impl Controller {
    pub async fn bootstrap(config: NodeConfig) -> Self {
        let state = NodeState::new(config.client_id.clone());
        let bus: Arc<dyn Bus> = Arc::new(EventBus::connect(&config.broker_host).await);
        let mutator = Arc::new(LocalMutator::new(config.monitor_dir.clone()));

        if let Err(e) = bus.declare_fanout(replication::FANOUT_EXCHANGE, false).await {
            warn!("controller: failed to declare {}: {e}", replication::FANOUT_EXCHANGE);
        }
        if let Err(e) = bus.declare_queue(FILE_EVENTS_QUEUE, false, false).await {
            warn!("controller: failed to declare {FILE_EVENTS_QUEUE}: {e}");
        }
        if let Err(e) = bus.declare_queue(LEGACY_COMMANDS_QUEUE, false, false).await {
            warn!("controller: failed to declare {LEGACY_COMMANDS_QUEUE}: {e}");
        }

        Self { config, state, bus, mutator }
    }

    pub async fn run(self) {
        let monitor_dir = PathBuf::from(&self.config.monitor_dir);
        std::fs::create_dir_all(&monitor_dir).ok();

        let (event_tx, event_rx) = mpsc::channel::<FileEvent>(256);

        let detector = Arc::new(BehaviouralDetector::new(self.state.clone(), event_tx.clone()));
        if let Err(e) = detector.deploy_bait_files(&monitor_dir) {
            warn!("controller: failed to deploy bait files: {e}");
        }
        let _watcher = match detector.clone().watch(&monitor_dir) {
            Ok(w) => Some(w),
            Err(e) => {
                warn!("controller: failed to start watcher: {e}");
                None
            }
        };

        tokio::spawn(forward_events_to_bus(self.bus.clone(), event_rx));
        tokio::spawn(replication::run_receiver(self.bus.clone(), self.state.clone(), self.mutator.clone()));
        tokio::spawn(run_legacy_commands_consumer(self.bus.clone(), self.state.clone(), event_tx.clone()));

        let snapshot_root = monitor_dir
            .parent()
            .map(|p| p.join("snapshots"))
            .unwrap_or_else(|| PathBuf::from("snapshots"));
        tokio::spawn(snapshot::run_perform_consumer(
            self.bus.clone(),
            self.state.clone(),
            monitor_dir.clone(),
            snapshot_root,
        ));

        let containment_state = self.state.clone();
        let containment_monitor_dir = monitor_dir.clone();
        let containment_port = self.config.containment_port;
        let containment_events = event_tx.clone();
        tokio::spawn(async move {
            let addr = format!("0.0.0.0:{containment_port}").parse().expect("valid socket addr");
            let service = ContainmentService::new(containment_state, containment_monitor_dir, containment_events);
            info!("controller: containment RPC listening on {addr}");
            if let Err(e) = Server::builder().add_service(service).serve(addr).await {
                warn!("controller: containment server exited: {e}");
            }
        });

        let api_state = ApiState {
            node_state: self.state.clone(),
            monitor_dir,
        };
        if let Err(e) = api::serve(api_state, &self.config.http_bind).await {
            warn!("controller: http api exited: {e}");
        }
    }
}

async fn forward_events_to_bus(bus: Arc<dyn Bus>, mut rx: mpsc::Receiver<FileEvent>) {
    while let Some(event) = rx.recv().await {
        match serde_json::to_vec(&event) {
            Ok(body) => {
                if let Err(e) = bus.publish_to_queue(FILE_EVENTS_QUEUE, &body, None, None).await {
                    warn!("controller: failed to publish file event: {e}");
                }
            }
            Err(e) => warn!("controller: failed to encode file event: {e}"),
        }
    }
}

/// Consumes the deprecated `commands` queue. Any message on it is treated as
/// an unconditional lockdown trigger, matching the legacy behaviour this
/// queue originally carried.
async fn run_legacy_commands_consumer(bus: Arc<dyn Bus>, state: Arc<NodeState>, events: mpsc::Sender<FileEvent>) {
    let mut consumer = match bus.consume(LEGACY_COMMANDS_QUEUE, "legacy-commands").await {
        Ok(c) => c,
        Err(e) => {
            warn!("controller: failed to consume {LEGACY_COMMANDS_QUEUE}: {e}");
            return;
        }
    };

    while let Some(delivery) = consumer.recv().await {
        if !state.is_locked_down() {
            state.set_lockdown(true);
            warn!("controller: legacy lockdown command received, engaging lockdown");
            let event = FileEvent::new(&state.client_id, &state.client_id, EventKind::SystemIsolated, 0.0);
            let _ = events.send(event).await;
        }
        delivery.ack().await;
    }
}
