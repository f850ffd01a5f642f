use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of filesystem event the detector observed or synthesized.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    BaitTriggered,
    VelocityAttack,
    SizeAnomaly,
    HeaderViolation,
    LockDown,
    SystemIsolated,
}

impl EventKind {
    /// Confirmed-malicious event kinds bypass the entropy threshold entirely.
    pub fn is_confirmed_threat(self) -> bool {
        matches!(
            self,
            EventKind::BaitTriggered | EventKind::VelocityAttack | EventKind::HeaderViolation
        )
    }
}

/// A single observation published to the `file_events` queue for the
/// detection engine to classify.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileEvent {
    pub node_id: String,
    pub path: String,
    pub event_kind: EventKind,
    pub entropy: f64,
    pub wall_ts: DateTime<Utc>,
}

impl FileEvent {
    pub fn new(node_id: impl Into<String>, path: impl Into<String>, event_kind: EventKind, entropy: f64) -> Self {
        Self {
            node_id: node_id.into(),
            path: path.into(),
            event_kind,
            entropy,
            wall_ts: Utc::now(),
        }
    }
}
