//! Containment RPC: the synchronous unicast gRPC channel the detection
//! engine uses to drive fleet-wide lockdown, and the local enforcement
//! (directory permission hardening) each node performs on acceptance.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::detector::types::{EventKind, FileEvent};
use crate::metrics::LOCKDOWN_EVENTS_TOTAL;
use crate::node_state::NodeState;

pub mod proto {
    tonic::include_proto!("containment");
}

use proto::containment_server::{Containment, ContainmentServer};
use proto::{LockdownRequest, LockdownResponse};

pub const ALL_NODES: &str = "ALL";

pub struct ContainmentService {
    state: Arc<NodeState>,
    monitor_dir: PathBuf,
    events: mpsc::Sender<FileEvent>,
}

impl ContainmentService {
    pub fn new(state: Arc<NodeState>, monitor_dir: PathBuf, events: mpsc::Sender<FileEvent>) -> ContainmentServer<Self> {
        ContainmentServer::new(Self { state, monitor_dir, events })
    }

    async fn emit(&self, kind: EventKind) {
        let event = FileEvent::new(&self.state.client_id, &self.monitor_dir.to_string_lossy(), kind, 0.0);
        let _ = self.events.send(event).await;
    }

    fn targets_me(&self, targeted: &str) -> bool {
        targeted == ALL_NODES || targeted == self.state.client_id
    }

    fn harden_permissions(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o500); // owner r-x only
            std::fs::set_permissions(&self.monitor_dir, perms)?;
        }
        Ok(())
    }

    fn restore_permissions(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700); // owner rwx
            std::fs::set_permissions(&self.monitor_dir, perms)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Containment for ContainmentService {
    async fn trigger_lockdown(&self, request: Request<LockdownRequest>) -> Result<Response<LockdownResponse>, Status> {
        let req = request.into_inner();
        if !self.targets_me(&req.targeted_node) {
            return Ok(Response::new(LockdownResponse {
                success: false,
                status_message: format!("{} does not target this node", req.targeted_node),
            }));
        }

        if self.state.is_locked_down() {
            return Ok(Response::new(LockdownResponse {
                success: true,
                status_message: "already locked down".to_string(),
            }));
        }

        match self.harden_permissions() {
            Ok(()) => {
                self.state.set_lockdown(true);
                LOCKDOWN_EVENTS_TOTAL.with_label_values(&[&self.state.client_id, "trigger"]).inc();
                warn!("containment: lockdown engaged for threat {} ({})", req.threat_id, req.reason);
                self.emit(EventKind::SystemIsolated).await;
                Ok(Response::new(LockdownResponse {
                    success: true,
                    status_message: "lockdown engaged".to_string(),
                }))
            }
            Err(e) => Ok(Response::new(LockdownResponse {
                success: false,
                status_message: format!("failed to harden permissions: {e}"),
            })),
        }
    }

    async fn release_lockdown(&self, request: Request<LockdownRequest>) -> Result<Response<LockdownResponse>, Status> {
        let req = request.into_inner();
        if !self.targets_me(&req.targeted_node) {
            return Ok(Response::new(LockdownResponse {
                success: false,
                status_message: format!("{} does not target this node", req.targeted_node),
            }));
        }

        if !self.state.is_locked_down() {
            return Ok(Response::new(LockdownResponse {
                success: true,
                status_message: "not locked down".to_string(),
            }));
        }

        match self.restore_permissions() {
            Ok(()) => {
                self.state.set_lockdown(false);
                LOCKDOWN_EVENTS_TOTAL.with_label_values(&[&self.state.client_id, "release"]).inc();
                info!("containment: lockdown released ({})", req.reason);
                self.emit(EventKind::LockDown).await;
                Ok(Response::new(LockdownResponse {
                    success: true,
                    status_message: "lockdown released".to_string(),
                }))
            }
            Err(e) => Ok(Response::new(LockdownResponse {
                success: false,
                status_message: format!("failed to restore permissions: {e}"),
            })),
        }
    }
}

/// Fleet-facing client used by the detection engine to trigger lockdown on
/// every node, including the one that reported the threat (lateral
/// movement hypothesis).
pub struct ContainmentClient;

impl ContainmentClient {
    pub async fn trigger_lockdown(addr: &str, threat_id: &str, reason: &str, targeted_node: &str) -> Result<LockdownResponse, tonic::transport::Error> {
        let mut client = proto::containment_client::ContainmentClient::connect(addr.to_string()).await?;
        let request = Request::new(LockdownRequest {
            threat_id: threat_id.to_string(),
            reason: reason.to_string(),
            targeted_node: targeted_node.to_string(),
            ts_unix: chrono::Utc::now().timestamp(),
        });
        match client.trigger_lockdown(request).await {
            Ok(resp) => Ok(resp.into_inner()),
            Err(status) => Ok(LockdownResponse {
                success: false,
                status_message: status.message().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_service(label: &str) -> ContainmentService {
        let dir = std::env::temp_dir().join(format!("finance-fabric-containment-{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        ContainmentService {
            state: NodeState::new("finance1"),
            monitor_dir: dir,
            events: tx,
        }
    }

    fn req(targeted_node: &str) -> Request<LockdownRequest> {
        Request::new(LockdownRequest {
            threat_id: "RANSOM-1".to_string(),
            reason: "test".to_string(),
            targeted_node: targeted_node.to_string(),
            ts_unix: 0,
        })
    }

    #[tokio::test]
    async fn lockdown_targeted_at_another_node_is_ignored() {
        let service = scratch_service("ignored");
        let resp = service.trigger_lockdown(req("finance2")).await.unwrap().into_inner();
        assert!(!resp.success);
        assert!(!service.state.is_locked_down());
        std::fs::remove_dir_all(&service.monitor_dir).ok();
    }

    #[tokio::test]
    async fn lockdown_targeted_at_all_nodes_engages() {
        let service = scratch_service("engage");
        let resp = service.trigger_lockdown(req(ALL_NODES)).await.unwrap().into_inner();
        assert!(resp.success);
        assert!(service.state.is_locked_down());
        std::fs::remove_dir_all(&service.monitor_dir).ok();
    }

    #[tokio::test]
    async fn release_after_lockdown_restores_state() {
        let service = scratch_service("release");
        service.state.set_lockdown(true);
        let resp = service.release_lockdown(req("finance1")).await.unwrap().into_inner();
        assert!(resp.success);
        assert!(!service.state.is_locked_down());
        std::fs::remove_dir_all(&service.monitor_dir).ok();
    }
}
