use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotPhase {
    Prepare,
    Perform,
    Commit,
}

/// PREPARE/COMMIT travel over HTTP; PERFORM travels as a bus broadcast. All
/// three share this shape for symmetry in logging and the audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotCommand {
    pub command_id: String,
    pub phase: SnapshotPhase,
    pub wall_ts: DateTime<Utc>,
}

impl SnapshotCommand {
    pub fn new(command_id: impl Into<String>, phase: SnapshotPhase) -> Self {
        Self {
            command_id: command_id.into(),
            phase,
            wall_ts: Utc::now(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SnapshotStatus {
    Done,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub command_id: String,
    pub client_id: String,
    pub status: SnapshotStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_handle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub wall_ts: DateTime<Utc>,
}

impl SnapshotResult {
    pub fn done(command_id: impl Into<String>, client_id: impl Into<String>, handle: String) -> Self {
        Self {
            command_id: command_id.into(),
            client_id: client_id.into(),
            status: SnapshotStatus::Done,
            snapshot_handle: Some(handle),
            error: None,
            wall_ts: Utc::now(),
        }
    }

    pub fn failed(command_id: impl Into<String>, client_id: impl Into<String>, error: String) -> Self {
        Self {
            command_id: command_id.into(),
            client_id: client_id.into(),
            status: SnapshotStatus::Failed,
            snapshot_handle: None,
            error: Some(error),
            wall_ts: Utc::now(),
        }
    }
}
