//! `tracker` keeps the durable record of installed components.
//!
//! The record is the source of truth for what uninstall has to undo. It is
//! re-read and rewritten under a lock on every mutation. Locks are shared
//! per record path across the process, so two trackers pointed at the same
//! file never lose each other's updates.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::artifact::{write_file, Component};
use crate::error::{Error, Result};

lazy_static::lazy_static! {
    static ref RECORD_LOCKS: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        std::sync::Mutex::new(HashMap::new());
}

/// The lock guarding the record at `path`, shared by every tracker on it.
fn record_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = lock_key(path);
    let mut locks = match RECORD_LOCKS.lock() {
        Ok(locks) => locks,
        Err(poisoned) => poisoned.into_inner(),
    };
    locks.entry(key).or_default().clone()
}

// The record may not exist yet, so only its directory is canonicalized.
fn lock_key(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => std::fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Persisted shape of the tracker file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TrackerState {
    /// Installed components, in installation order.
    #[serde(default)]
    artifacts: Vec<Component>,
}

/// Durable set of installed [`Component`]s.
#[derive(Debug)]
pub struct Tracker {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl Tracker {
    /// A tracker persisting to `path`. The file is created on first mutation.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        Tracker {
            lock: record_lock(&path),
            path,
        }
    }

    /// Where the record lives.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records `component` as installed. Adding a component twice is a no-op.
    ///
    /// Only returns once the updated record is on disk.
    pub async fn add(&self, component: Component) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;
        if state.artifacts.contains(&component) {
            debug!(%component, "Component already tracked");
            return Ok(());
        }
        state.artifacts.push(component);
        self.write(&state).await?;
        info!(%component, "Tracked installed component");
        Ok(())
    }

    /// Forgets `component`. Removing an untracked component is a no-op.
    pub async fn remove(&self, component: Component) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut state = self.read().await?;
        let before = state.artifacts.len();
        state.artifacts.retain(|c| *c != component);
        if state.artifacts.len() == before {
            return Ok(());
        }
        self.write(&state).await?;
        debug!(%component, "Untracked component");
        Ok(())
    }

    /// Whether `component` is recorded as installed.
    pub async fn has(&self, component: Component) -> Result<bool> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.artifacts.contains(&component))
    }

    /// Installed components in installation order.
    pub async fn components(&self) -> Result<Vec<Component>> {
        let _guard = self.lock.lock().await;
        Ok(self.read().await?.artifacts)
    }

    /// Deletes the record once nothing is tracked any more.
    pub async fn clear_if_empty(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.read().await?.artifacts.is_empty() {
            crate::artifact::remove_path(&self.path).await?;
        }
        Ok(())
    }

    async fn read(&self) -> Result<TrackerState> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TrackerState::default())
            }
            Err(e) => return Err(Error::io("reading tracker", &self.path, e)),
        };
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(TrackerState::default());
        }
        serde_yaml::from_slice(&raw).map_err(|e| Error::Serialization {
            context: format!("parsing tracker {:?}", self.path),
            message: e.to_string(),
        })
    }

    async fn write(&self, state: &TrackerState) -> Result<()> {
        let raw = serde_yaml::to_string(state).map_err(|e| Error::Serialization {
            context: "encoding tracker".into(),
            message: e.to_string(),
        })?;
        write_file(&self.path, raw, 0o644).await
    }
}
