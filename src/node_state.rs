use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Size/mtime cache entry used by the size-delta check (step 3).
#[derive(Clone, Copy, Debug)]
pub struct CachedMetadata {
    pub size: u64,
    pub last_mtime: DateTime<Utc>,
}

/// Tracks ACKs collected so far for an in-flight snapshot command.
#[derive(Clone, Debug, Default)]
pub struct PendingSnapshot {
    pub received: usize,
}

/// The write gate: a binary condition variable. Many writers can wait for it
/// to open; the controller is the only one permitted to close or open it.
pub struct WriteGate {
    closed: AtomicBool,
    notify: Notify,
}

impl WriteGate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Blocks the caller until the gate is open. Idempotent if already open.
    pub async fn wait_open(&self) {
        loop {
            if !self.is_closed() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-process node state. Everything here is behind a single lock per
/// field grouping as described in the concurrency model: the controller is
/// the only component that mutates `lockdown`, the gate, and the vector
/// clock, and it does so without holding the lock across an await point.
pub struct NodeState {
    pub client_id: String,
    pub lockdown: AtomicBool,
    pub write_gate: WriteGate,
    inner: Mutex<Inner>,
}

struct Inner {
    vector_clock: HashMap<String, u64>,
    metadata_cache: HashMap<String, CachedMetadata>,
    velocity_window: VecDeque<Instant>,
    pending_snapshots: HashMap<String, PendingSnapshot>,
    last_command_id: Option<String>,
}

/// Number of recent MODIFY timestamps the velocity check considers.
pub const VELOCITY_WINDOW_LEN: usize = 10;
/// Minimum span the oldest-to-newest window must cover to be considered benign.
pub const VELOCITY_WINDOW_SECONDS: f64 = 1.0;
/// Minimum relative size change (of the old size) considered an anomaly.
pub const SIZE_DELTA_THRESHOLD: f64 = 0.3;

impl NodeState {
    pub fn new(client_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            lockdown: AtomicBool::new(false),
            write_gate: WriteGate::default(),
            inner: Mutex::new(Inner {
                vector_clock: HashMap::new(),
                metadata_cache: HashMap::new(),
                velocity_window: VecDeque::with_capacity(VELOCITY_WINDOW_LEN),
                pending_snapshots: HashMap::new(),
                last_command_id: None,
            }),
        })
    }

    pub fn is_locked_down(&self) -> bool {
        self.lockdown.load(Ordering::SeqCst)
    }

    pub fn set_lockdown(&self, value: bool) {
        self.lockdown.store(value, Ordering::SeqCst);
    }

    /// Increments this node's own vector-clock component and returns the
    /// resulting full clock snapshot, to be embedded in the broadcast op.
    /// Must be called before the op is published (I3).
    pub fn increment_and_snapshot_clock(&self) -> HashMap<String, u64> {
        let mut inner = self.inner.lock();
        let counter = inner.vector_clock.entry(self.client_id.clone()).or_insert(0);
        *counter += 1;
        inner.vector_clock.clone()
    }

    /// Applies an inbound peer clock iff the sender's component advanced
    /// past our local view (I4). Returns true if the op should be applied.
    pub fn should_apply(&self, sender: &str, incoming: &HashMap<String, u64>) -> bool {
        let mut inner = self.inner.lock();
        let incoming_component = incoming.get(sender).copied().unwrap_or(0);
        let local_component = inner.vector_clock.get(sender).copied().unwrap_or(0);
        if incoming_component > local_component {
            for (node, count) in incoming {
                let entry = inner.vector_clock.entry(node.clone()).or_insert(0);
                *entry = (*entry).max(*count);
            }
            true
        } else {
            false
        }
    }

    pub fn record_modify(&self) -> VecDeque<Instant> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.velocity_window.push_back(now);
        while inner.velocity_window.len() > VELOCITY_WINDOW_LEN {
            inner.velocity_window.pop_front();
        }
        inner.velocity_window.clone()
    }

    pub fn cached_size(&self, path: &str) -> Option<u64> {
        self.inner.lock().metadata_cache.get(path).map(|m| m.size)
    }

    pub fn update_cached_metadata(&self, path: &str, size: u64) {
        self.inner.lock().metadata_cache.insert(
            path.to_string(),
            CachedMetadata {
                size,
                last_mtime: Utc::now(),
            },
        );
    }

    pub fn begin_pending_snapshot(&self, command_id: &str) {
        self.inner
            .lock()
            .pending_snapshots
            .insert(command_id.to_string(), PendingSnapshot::default());
    }

    pub fn take_pending_snapshot(&self, command_id: &str) -> Option<PendingSnapshot> {
        self.inner.lock().pending_snapshots.remove(command_id)
    }

    /// Dedupes a PERFORM broadcast: returns true the first time a given
    /// command_id is seen, false on any repeat.
    pub fn mark_command_seen(&self, command_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.last_command_id.as_deref() == Some(command_id) {
            false
        } else {
            inner.last_command_id = Some(command_id.to_string());
            true
        }
    }
}

/// Returns true iff the velocity window is full and its span is under the
/// threshold -- i.e. 10 modifications happened within under a second.
pub fn velocity_attack(window: &VecDeque<Instant>) -> bool {
    if window.len() < VELOCITY_WINDOW_LEN {
        return false;
    }
    let oldest = window.front().unwrap();
    let newest = window.back().unwrap();
    newest.duration_since(*oldest).as_secs_f64() < VELOCITY_WINDOW_SECONDS
}

/// Returns true iff the relative size change exceeds the anomaly threshold.
pub fn size_anomaly(old_size: u64, new_size: u64) -> bool {
    if old_size == 0 {
        return false;
    }
    let delta = (new_size as f64 - old_size as f64).abs();
    delta / old_size as f64 >= SIZE_DELTA_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_clock_increments_strictly() {
        let state = NodeState::new("finance1");
        let first = state.increment_and_snapshot_clock();
        let second = state.increment_and_snapshot_clock();
        assert_eq!(first["finance1"], 1);
        assert_eq!(second["finance1"], 2);
    }

    #[test]
    fn stale_clock_is_rejected() {
        let state = NodeState::new("finance1");
        let mut incoming = HashMap::new();
        incoming.insert("finance2".to_string(), 1);
        assert!(state.should_apply("finance2", &incoming));
        // Same clock again must be rejected (replay).
        assert!(!state.should_apply("finance2", &incoming));
    }

    #[test]
    fn size_anomaly_boundary() {
        assert!(!size_anomaly(1000, 1299)); // 29.9%
        assert!(size_anomaly(1000, 1300)); // 30.0%
    }

    #[test]
    fn velocity_boundary() {
        let mut window = VecDeque::new();
        let base = Instant::now();
        for i in 0..VELOCITY_WINDOW_LEN {
            window.push_back(base + std::time::Duration::from_millis((i as u64) * 110));
        }
        // span = 9 * 110ms = 990ms < 1.0s -> attack
        assert!(velocity_attack(&window));
    }
}
