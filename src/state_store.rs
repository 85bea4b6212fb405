//! Local state that outlives the process: cached images and the
//! recent-prompt list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::watch;

use crate::cache::CacheEntry;
use crate::error::StoreError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    #[serde(default)]
    pub cache: BTreeMap<String, CacheEntry>,
    #[serde(default)]
    pub recent_prompts: Vec<String>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Missing state is not an error; it loads as empty.
    async fn load(&self) -> Result<PersistedState, StoreError>;

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// Write every snapshot published on `snapshots`, newest first. Snapshots
/// published while a write is in flight collapse into the latest one.
/// Returns once the sending side is dropped and the last snapshot is written.
pub async fn state_writer(
    store: Arc<dyn StateStore>,
    mut snapshots: watch::Receiver<Option<PersistedState>>,
) {
    while snapshots.changed().await.is_ok() {
        let Some(state) = snapshots.borrow_and_update().clone() else {
            continue;
        };
        if let Err(e) = store.save(&state).await {
            tracing::warn!(error = %e, "Failed to save local state");
        }
    }
    tracing::debug!("State writer stopped");
}

pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(PersistedState::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(state)?;
        // write-then-rename so a crash never leaves a torn file
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
    saves: Mutex<usize>,
}

impl MemoryStateStore {
    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            saves: Mutex::new(0),
        }
    }

    pub fn current(&self) -> PersistedState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<PersistedState, StoreError> {
        Ok(self.current())
    }

    async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state.clone();
        *self.saves.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) += 1;
        Ok(())
    }
}
