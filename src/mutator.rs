//! Local File Mutator: the only code path allowed to touch bytes under the
//! monitored directory on behalf of CREATE/WRITE-APPEND/DELETE operations.
//! Both API-originated and replication-originated writes funnel through
//! here so the write-gate and lockdown checks are enforced once.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{FabricError, FabricResult};
use crate::node_state::NodeState;

pub struct LocalMutator {
    root: PathBuf,
}

impl LocalMutator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        self.root.join(filename)
    }

    async fn guard(&self, state: &NodeState) -> FabricResult<()> {
        if state.is_locked_down() {
            return Err(FabricError::LockdownActive);
        }
        state.write_gate.wait_open().await;
        Ok(())
    }

    pub async fn create(&self, state: &NodeState, filename: &str, content: &str) -> FabricResult<()> {
        self.guard(state).await?;
        let path = self.resolve(filename);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, content).await?;
        self.refresh_cache(state, &path).await;
        Ok(())
    }

    pub async fn write_append(&self, state: &NodeState, filename: &str, content: &str) -> FabricResult<()> {
        self.guard(state).await?;
        let path = self.resolve(filename);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        self.refresh_cache(state, &path).await;
        Ok(())
    }

    pub async fn delete(&self, state: &NodeState, filename: &str) -> FabricResult<()> {
        self.guard(state).await?;
        let path = self.resolve(filename);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn refresh_cache(&self, state: &NodeState, path: &Path) {
        if let Ok(meta) = fs::metadata(path).await {
            state.update_cached_metadata(&path.to_string_lossy(), meta.len());
        }
    }
}
