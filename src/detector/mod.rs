//! Behavioural Detector: classifies filesystem events via the ordered
//! pipeline (bait, velocity, size-delta, magic-byte, entropy) and emits
//! `FileEvent`s for the detection engine.

pub mod signatures;
pub mod types;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::metrics::{ENTROPY_SAMPLE, FILE_EVENTS_TOTAL};
use crate::node_state::{self, NodeState};
use types::{EventKind, FileEvent};

const SAMPLE_BLOCK_SIZE: usize = 4096;
const SAMPLE_BLOCKS: usize = 4;
const FULL_READ_THRESHOLD: u64 = 16 * 1024;
/// Settle delay before sampling a freshly created file (step 3-5 for CREATE).
const CREATE_SETTLE_DELAY: Duration = Duration::from_millis(50);

pub struct BehaviouralDetector {
    state: Arc<NodeState>,
    events: mpsc::Sender<FileEvent>,
}

impl BehaviouralDetector {
    pub fn new(state: Arc<NodeState>, events: mpsc::Sender<FileEvent>) -> Self {
        Self { state, events }
    }

    /// Starts the recursive filesystem watcher rooted at `monitor_dir`.
    /// Returns the underlying watcher handle; dropping it stops watching.
    pub fn watch(self: Arc<Self>, monitor_dir: &Path) -> notify::Result<RecommendedWatcher> {
        let (tx, mut rx) = mpsc::channel::<Event>(1024);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.blocking_send(event);
            }
        })?;
        watcher.watch(monitor_dir, RecursiveMode::Recursive)?;

        let detector = self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                detector.clone().handle_notify_event(event).await;
            }
        });

        Ok(watcher)
    }

    async fn handle_notify_event(self: Arc<Self>, event: Event) {
        for path in event.paths {
            match event.kind {
                NotifyEventKind::Create(_) => {
                    let detector = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(CREATE_SETTLE_DELAY).await;
                        detector.process_create(&path).await;
                    });
                }
                NotifyEventKind::Modify(_) => self.process_modify(&path).await,
                NotifyEventKind::Remove(_) => self.process_delete(&path).await,
                _ => {}
            }
        }
    }

    fn pre_filter(&self, path: &Path) -> bool {
        if self.state.is_locked_down() {
            return false; // I5: never emit while locked down
        }
        if path.is_dir() {
            return false;
        }
        let s = path.to_string_lossy();
        if s.ends_with(".locked") || s.contains(".tmp") {
            return false;
        }
        true
    }

    async fn emit(&self, event_kind: EventKind, path: &Path, entropy: f64) {
        let fe = FileEvent::new(&self.state.client_id, path.to_string_lossy(), event_kind, entropy);
        FILE_EVENTS_TOTAL
            .with_label_values(&[&self.state.client_id, &format!("{event_kind:?}")])
            .inc();
        if entropy > 0.0 {
            ENTROPY_SAMPLE.observe(entropy);
        }
        if let Err(e) = self.events.send(fe).await {
            warn!("detector: event channel closed: {e}");
        }
    }

    pub async fn process_create(&self, path: &Path) {
        if !self.pre_filter(path) {
            return;
        }
        if self.check_magic_header(path).await {
            return;
        }
        let size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        self.state.update_cached_metadata(&path.to_string_lossy(), size);
        let entropy = self.sample_entropy(path).unwrap_or(0.0);
        self.emit(EventKind::Create, path, entropy).await;
    }

    pub async fn process_modify(&self, path: &Path) {
        if !self.pre_filter(path) {
            return;
        }

        if signatures::is_bait_file(path) {
            self.emit(EventKind::BaitTriggered, path, 8.0).await;
            self.state.set_lockdown(true);
            return;
        }

        let window = self.state.record_modify();
        if node_state::velocity_attack(&window) {
            self.emit(EventKind::VelocityAttack, path, 8.0).await;
            self.state.set_lockdown(true);
            return;
        }

        let path_key = path.to_string_lossy().to_string();
        let new_size = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if let Some(old_size) = self.state.cached_size(&path_key) {
            if node_state::size_anomaly(old_size, new_size) {
                self.emit(EventKind::SizeAnomaly, path, 0.0).await;
                self.state.update_cached_metadata(&path_key, new_size);
                return;
            }
        }
        self.state.update_cached_metadata(&path_key, new_size);

        if self.check_magic_header(path).await {
            return;
        }

        let entropy = self.sample_entropy(path).unwrap_or(0.0);
        if entropy > 0.0 {
            self.emit(EventKind::Modify, path, entropy).await;
        }
    }

    pub async fn process_delete(&self, path: &Path) {
        if !self.pre_filter(path) {
            return;
        }

        if signatures::is_bait_file(path) {
            self.emit(EventKind::BaitTriggered, path, 8.0).await;
            self.state.set_lockdown(true);
            return;
        }

        self.emit(EventKind::Delete, path, 0.0).await;
    }

    /// Step 4: returns true (and emits) iff the file's extension has a known
    /// magic header and the on-disk bytes don't match it.
    async fn check_magic_header(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let Some(magic) = signatures::magic_header_for(ext) else {
            return false;
        };
        let Ok(bytes) = fs::read(path) else {
            return false;
        };
        if bytes.len() >= magic.len() && &bytes[..magic.len()] == magic {
            return false;
        }
        self.emit(EventKind::HeaderViolation, path, 8.0).await;
        self.state.set_lockdown(true);
        true
    }

    /// Step 5: samples up to 4 blocks of 4096 bytes at random offsets within
    /// 4 equal regions of the file (or reads the whole file if it is small
    /// enough), then computes Shannon entropy over the observed bytes.
    fn sample_entropy(&self, path: &Path) -> Option<f64> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if signatures::is_entropy_excluded(ext) {
            return None;
        }

        let metadata = fs::metadata(path).ok()?;
        let len = metadata.len();
        if len == 0 {
            return Some(0.0);
        }

        let data = if len <= FULL_READ_THRESHOLD {
            fs::read(path).ok()?
        } else {
            self.sample_blocks(path, len)?
        };

        Some(shannon_entropy(&data))
    }

    fn sample_blocks(&self, path: &Path, len: u64) -> Option<Vec<u8>> {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = fs::File::open(path).ok()?;
        let region_size = len / SAMPLE_BLOCKS as u64;
        let mut out = Vec::with_capacity(SAMPLE_BLOCK_SIZE * SAMPLE_BLOCKS);
        let mut rng = rand::thread_rng();

        for region in 0..SAMPLE_BLOCKS as u64 {
            let region_start = region * region_size;
            let max_offset = region_size.saturating_sub(SAMPLE_BLOCK_SIZE as u64);
            let offset = region_start + rng.gen_range(0..=max_offset);
            file.seek(SeekFrom::Start(offset)).ok()?;
            let mut buf = vec![0u8; SAMPLE_BLOCK_SIZE.min(len as usize)];
            let n = file.read(&mut buf).ok()?;
            buf.truncate(n);
            out.extend_from_slice(&buf);
        }
        Some(out)
    }

    pub fn deploy_bait_files(&self, monitor_dir: &Path) -> std::io::Result<()> {
        for name in signatures::BAIT_FILES {
            let path: PathBuf = monitor_dir.join(name);
            if !path.exists() {
                fs::write(&path, signatures::BAIT_CONTENT)?;
                debug!("deployed bait file {}", path.display());
            }
        }
        Ok(())
    }
}

/// Shannon entropy over byte frequencies, H = -sum p_i log2 p_i.
///
/// Grounded on the 256-bucket frequency-array approach used elsewhere in
/// this codebase's threat-analysis lineage.
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &b in data {
        freq[b as usize] += 1;
    }
    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_state::NodeState;

    #[test]
    fn entropy_of_uniform_bytes_is_near_max() {
        let data: Vec<u8> = (0..=255u8).collect();
        let h = shannon_entropy(&data);
        assert!((h - 8.0).abs() < 1e-9);
    }

    #[test]
    fn entropy_of_constant_bytes_is_zero() {
        let data = vec![0x41u8; 4096];
        assert_eq!(shannon_entropy(&data), 0.0);
    }

    #[test]
    fn entropy_of_empty_is_zero() {
        assert_eq!(shannon_entropy(&[]), 0.0);
    }

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("finance-fabric-detector-{label}-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn delete_of_bait_file_triggers_lockdown() {
        let dir = scratch_dir("delete-bait");
        let bait = dir.join(signatures::BAIT_FILES[0]);
        fs::write(&bait, signatures::BAIT_CONTENT).unwrap();

        let state = NodeState::new("finance1");
        let (tx, mut rx) = mpsc::channel(4);
        let detector = BehaviouralDetector::new(state.clone(), tx);

        detector.process_delete(&bait).await;

        let event = rx.recv().await.expect("bait deletion must emit an event");
        assert_eq!(event.event_kind, EventKind::BaitTriggered);
        assert!(state.is_locked_down());

        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn delete_of_ordinary_file_is_plain_delete() {
        let dir = scratch_dir("delete-plain");
        let target = dir.join("report.txt");
        fs::write(&target, b"hello").unwrap();

        let state = NodeState::new("finance1");
        let (tx, mut rx) = mpsc::channel(4);
        let detector = BehaviouralDetector::new(state.clone(), tx);

        detector.process_delete(&target).await;

        let event = rx.recv().await.expect("delete must emit an event");
        assert_eq!(event.event_kind, EventKind::Delete);
        assert!(!state.is_locked_down());

        fs::remove_dir_all(&dir).ok();
    }
}
