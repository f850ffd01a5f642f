pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::containment::ContainmentClient;
use crate::detector::types::{EventKind, FileEvent};

use types::{DashboardSnapshot, IssuedCommand, NodeDashboardEntry, NodeStatus};

pub const FILE_EVENTS_QUEUE: &str = "file_events";
/// Entropy above which an otherwise-unclassified event is a suspected threat.
pub const ENTROPY_THRESHOLD: f64 = 7.5;

pub struct DetectionEngine {
    /// client_id -> containment RPC address ("http://host:port").
    node_addrs: HashMap<String, String>,
    dashboard: Mutex<DashboardSnapshot>,
}

#[derive(Debug, PartialEq, Eq)]
enum Classification {
    Confirmed,
    Suspected,
    LockAcknowledged,
    Benign,
}

impl DetectionEngine {
    pub fn new(node_addrs: HashMap<String, String>) -> Arc<Self> {
        Arc::new(Self {
            node_addrs,
            dashboard: Mutex::new(DashboardSnapshot::default()),
        })
    }

    pub fn dashboard_snapshot(&self) -> DashboardSnapshot {
        self.dashboard.lock().clone()
    }

    fn classify(event: &FileEvent) -> Classification {
        match event.event_kind {
            EventKind::BaitTriggered | EventKind::VelocityAttack | EventKind::HeaderViolation => {
                Classification::Confirmed
            }
            EventKind::LockDown => Classification::LockAcknowledged,
            _ if event.entropy > ENTROPY_THRESHOLD => Classification::Suspected,
            _ => Classification::Benign,
        }
    }

    async fn handle_event(self: &Arc<Self>, event: FileEvent) {
        let classification = Self::classify(&event);

        {
            let mut dashboard = self.dashboard.lock();
            let entry = dashboard
                .nodes
                .entry(event.node_id.clone())
                .or_insert_with(NodeDashboardEntry::default);
            entry.last_entropy = event.entropy;
            entry.status = match classification {
                Classification::Confirmed | Classification::Suspected => NodeStatus::Infected,
                Classification::LockAcknowledged => NodeStatus::Locked,
                Classification::Benign => NodeStatus::Safe,
            };
            dashboard.push_log(format!(
                "{} {:?} entropy={:.3} path={}",
                event.node_id, event.event_kind, event.entropy, event.path
            ));
            if event.entropy > 0.0 {
                dashboard.push_entropy(event.entropy);
            }
        }

        if matches!(classification, Classification::Confirmed | Classification::Suspected) {
            self.contain_fleet(&event).await;
        }
    }

    /// Issues TriggerLockdown against every known node in the fleet, not
    /// only the one that reported the threat.
    async fn contain_fleet(self: &Arc<Self>, event: &FileEvent) {
        let threat_id = format!("RANSOM-{}", chrono::Utc::now().timestamp());
        let reason = format!("{:?} on {} (entropy={:.3})", event.event_kind, event.path, event.entropy);

        {
            let mut dashboard = self.dashboard.lock();
            dashboard.push_command(IssuedCommand {
                threat_id: threat_id.clone(),
                targeted_node: "ALL".to_string(),
                reason: reason.clone(),
                ts: chrono::Utc::now(),
            });
        }

        for (client_id, addr) in &self.node_addrs {
            match ContainmentClient::trigger_lockdown(addr, &threat_id, &reason, client_id).await {
                Ok(resp) if resp.success => {
                    info!("detection_engine: {client_id} locked down: {}", resp.status_message);
                }
                Ok(resp) => warn!("detection_engine: {client_id} refused lockdown: {}", resp.status_message),
                Err(e) => warn!("detection_engine: failed to reach {client_id}: {e}"),
            }
        }
    }

    pub async fn run(self: Arc<Self>, bus: Arc<dyn Bus>) {
        if let Err(e) = bus.declare_queue(FILE_EVENTS_QUEUE, false, false).await {
            warn!("detection_engine: failed to declare {FILE_EVENTS_QUEUE}: {e}");
            return;
        }
        let mut consumer = match bus.consume(FILE_EVENTS_QUEUE, "detection-engine").await {
            Ok(c) => c,
            Err(e) => {
                warn!("detection_engine: failed to consume {FILE_EVENTS_QUEUE}: {e}");
                return;
            }
        };

        info!("detection_engine: listening on {FILE_EVENTS_QUEUE}");
        while let Some(delivery) = consumer.recv().await {
            if let Ok(event) = serde_json::from_slice::<FileEvent>(&delivery.data) {
                self.handle_event(event).await;
            }
            delivery.ack().await;
        }
    }
}
