use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Safe,
    Infected,
    Locked,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeDashboardEntry {
    pub status: NodeStatus,
    pub last_entropy: f64,
}

impl Default for NodeDashboardEntry {
    fn default() -> Self {
        Self {
            status: NodeStatus::Safe,
            last_entropy: 0.0,
        }
    }
}

pub const LOG_RING_LEN: usize = 10;
pub const ENTROPY_RING_LEN: usize = 50;
pub const COMMAND_RING_LEN: usize = 50;

/// Rolling state the engine exposes for dashboard polling. Bounded rings
/// keep memory flat regardless of fleet uptime.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DashboardSnapshot {
    pub nodes: std::collections::HashMap<String, NodeDashboardEntry>,
    pub logs: VecDeque<String>,
    pub entropy_samples: VecDeque<f64>,
    pub issued_commands: VecDeque<IssuedCommand>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuedCommand {
    pub threat_id: String,
    pub targeted_node: String,
    pub reason: String,
    pub ts: DateTime<Utc>,
}

impl DashboardSnapshot {
    pub fn push_log(&mut self, line: String) {
        self.logs.push_back(line);
        while self.logs.len() > LOG_RING_LEN {
            self.logs.pop_front();
        }
    }

    pub fn push_entropy(&mut self, value: f64) {
        self.entropy_samples.push_back(value);
        while self.entropy_samples.len() > ENTROPY_RING_LEN {
            self.entropy_samples.pop_front();
        }
    }

    pub fn push_command(&mut self, command: IssuedCommand) {
        self.issued_commands.push_back(command);
        while self.issued_commands.len() > COMMAND_RING_LEN {
            self.issued_commands.pop_front();
        }
    }
}
