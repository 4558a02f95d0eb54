//! The persistent environment: main dataset, pose index, group catalog and
//! merge ledger, plus the guards that keep concurrent attempts apart.
//!
//! Readers take lock-free snapshots. The merge committer is the only writer;
//! it holds the commit lock, builds the next state from the current one,
//! writes `state.yaml` atomically and then publishes the new snapshot.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use hashbrown::HashSet;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::catalog::{GroupCatalog, GroupId};
use crate::config::PipelineConfig;
use crate::dataset::{rebased_path, Dataset, DatasetKind, IMAGES_DIR};
use crate::error::{Error, IoResultExt, Result};
use crate::merge::MergeRecord;
use crate::pose_index::PoseIndex;

pub const MAIN_DIR: &str = "main";
pub const STAGING_DIR: &str = "staging";
pub const MODELS_DIR: &str = "models";
pub const STATE_FILE: &str = "state.yaml";
pub const CONFIG_FILE: &str = "pipeline.yaml";
/// Present while the pipeline is halted, so the halt outlives the process.
pub const HALT_FILE: &str = "HALTED";

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MainState {
    pub dataset: Dataset,
    #[serde(default)]
    pub poses: PoseIndex,
    #[serde(default)]
    pub catalog: GroupCatalog,
    #[serde(default)]
    pub merges: Vec<MergeRecord>,
}

impl MainState {
    fn empty(root: &Path) -> Self {
        Self {
            dataset: Dataset::new(DatasetKind::Main, root),
            poses: PoseIndex::default(),
            catalog: GroupCatalog::default(),
            merges: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }

    /// Moves every stored path under `main_root`, including the model
    /// archives referenced by merge records.
    fn rebase(&mut self, main_root: &Path) {
        let old_root = self.dataset.root.clone();
        self.dataset.rebase(main_root);
        for dir in self.merges.iter_mut().filter_map(|record| record.model_dir.as_mut()) {
            *dir = rebased_path(dir, &old_root, main_root);
        }
    }
}

/// Spatial region an attempt works on; at most one attempt per region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Bootstrap,
    Group(GroupId),
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Region::Bootstrap => write!(f, "bootstrap"),
            Region::Group(group) => write!(f, "{group}"),
        }
    }
}

/// Releases the region when dropped.
#[derive(Debug)]
pub struct RegionClaim<'a> {
    environment: &'a Environment,
    region: Region,
}

impl RegionClaim<'_> {
    pub fn region(&self) -> Region {
        self.region
    }
}

impl Drop for RegionClaim<'_> {
    fn drop(&mut self) {
        self.environment.claims.lock().remove(&self.region);
    }
}

#[derive(Debug)]
pub struct Environment {
    root: PathBuf,
    config: PipelineConfig,
    state: ArcSwap<MainState>,
    commit_lock: Mutex<()>,
    claims: Mutex<HashSet<Region>>,
    halted: AtomicBool,
    events: broadcast::Sender<MergeRecord>,
}

impl Environment {
    /// Opens the environment at `root`, creating the directory layout and an
    /// empty main dataset on first use.
    pub fn open(root: impl Into<PathBuf>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let root = root.into();

        for dir in [
            root.join(MAIN_DIR).join(IMAGES_DIR),
            root.join(MAIN_DIR).join(MODELS_DIR),
            root.join(STAGING_DIR),
        ] {
            fs::create_dir_all(&dir).at_path(&dir)?;
        }

        let main_root = root.join(MAIN_DIR);
        let state_path = main_root.join(STATE_FILE);
        let state = if state_path.is_file() {
            let mut state: MainState = common::serde::read_file(&state_path)
                .map_err(|err| Error::format(&state_path, err))?;
            state.rebase(&main_root);
            state
        } else {
            MainState::empty(&main_root)
        };

        info!(
            "Opened environment {} ({} images, {} groups, {} merges)",
            root.display(),
            state.dataset.len(),
            state.catalog.len(),
            state.merges.len()
        );

        let halted = root.join(HALT_FILE).is_file();
        if halted {
            warn!("Environment {} is halted after a failed commit", root.display());
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            root,
            config,
            state: ArcSwap::from_pointee(state),
            commit_lock: Mutex::new(()),
            claims: Mutex::new(HashSet::new()),
            halted: AtomicBool::new(halted),
            events,
        })
    }

    /// Opens with the config stored in the environment, writing the default
    /// config there first if there is none.
    pub fn open_with_stored_config(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config_path = root.join(CONFIG_FILE);
        let config = if config_path.is_file() {
            PipelineConfig::load(&config_path)?
        } else {
            fs::create_dir_all(&root).at_path(&root)?;
            let config = PipelineConfig::default();
            config.save(&config_path)?;
            config
        };
        Self::open(root, config)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn main_dir(&self) -> PathBuf {
        self.root.join(MAIN_DIR)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn models_dir(&self) -> PathBuf {
        self.main_dir().join(MODELS_DIR)
    }

    pub fn state_path(&self) -> PathBuf {
        self.main_dir().join(STATE_FILE)
    }

    /// Current main state. Never observes a half-applied merge.
    pub fn snapshot(&self) -> Arc<MainState> {
        self.state.load_full()
    }

    /// Receives every merge record, committed or rejected, as it is written.
    pub fn subscribe(&self) -> broadcast::Receiver<MergeRecord> {
        self.events.subscribe()
    }

    pub fn claim(&self, region: Region) -> Result<RegionClaim<'_>> {
        if !self.claims.lock().insert(region) {
            return Err(Error::RegionBusy(region));
        }
        Ok(RegionClaim {
            environment: self,
            region,
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Lifts the halt set by a failed commit, once an operator has checked
    /// the main dataset.
    pub fn clear_halt(&self) -> Result<()> {
        let marker = self.root.join(HALT_FILE);
        match fs::remove_file(&marker) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err).at_path(&marker),
            _ => {}
        }
        if self.halted.swap(false, Ordering::SeqCst) {
            info!("Pipeline halt cleared");
        }
        Ok(())
    }

    pub(crate) fn halt(&self, reason: &str) {
        self.halted.store(true, Ordering::SeqCst);
        let marker = self.root.join(HALT_FILE);
        if let Err(err) = fs::write(&marker, reason) {
            warn!("Could not write halt marker {}: {err}", marker.display());
        }
    }

    pub(crate) fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Makes `state` durable, then visible. Callers hold the commit lock.
    pub(crate) fn publish(&self, state: MainState) -> Result<Arc<MainState>> {
        let path = self.state_path();
        common::serde::write_file_atomic(&path, &state).map_err(|err| Error::format(&path, err))?;
        let state = Arc::new(state);
        self.state.store(state.clone());
        Ok(state)
    }

    pub(crate) fn announce(&self, record: &MergeRecord) {
        // no subscribers is fine
        let _ = self.events.send(record.clone());
    }

    /// Writes the current snapshot to `state.yaml`.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.lock_commits();
        let path = self.state_path();
        common::serde::write_file_atomic(&path, &*self.snapshot())
            .map_err(|err| Error::format(&path, err))
    }

    pub fn close(self) -> Result<()> {
        if !self.claims.lock().is_empty() {
            warn!("Closing environment with attempts still in flight");
        }
        self.flush()?;
        info!("Closed environment {}", self.root.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_layout_and_empty_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), PipelineConfig::default())?;

        assert!(env.main_dir().join("images").is_dir());
        assert!(env.models_dir().is_dir());
        assert!(env.staging_dir().is_dir());
        assert!(env.snapshot().is_empty());
        assert_eq!(env.snapshot().dataset.kind, DatasetKind::Main);
        Ok(())
    }

    #[test]
    fn flush_and_reopen_keeps_state() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), PipelineConfig::default())?;
        let id = env.snapshot().dataset.id;
        env.close()?;

        let reopened = Environment::open(dir.path(), PipelineConfig::default())?;
        assert_eq!(reopened.snapshot().dataset.id, id);
        Ok(())
    }

    #[test]
    fn reopen_after_move_rebases_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let first = dir.path().join("a");
        let env = Environment::open(&first, PipelineConfig::default())?;
        env.close()?;

        let second = dir.path().join("b");
        fs::rename(&first, &second)?;
        let env = Environment::open(&second, PipelineConfig::default())?;
        assert_eq!(env.snapshot().dataset.root, second.join(MAIN_DIR));
        Ok(())
    }

    #[test]
    fn regions_are_exclusive_until_released() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), PipelineConfig::default())?;
        let group = Region::Group(GroupId::new(3));

        let claim = env.claim(group)?;
        assert!(matches!(env.claim(group), Err(Error::RegionBusy(r)) if r == group));
        let other = env.claim(Region::Group(GroupId::new(4)))?;

        drop(claim);
        let again = env.claim(group)?;
        assert_eq!(again.region(), group);
        drop(other);
        Ok(())
    }

    #[test]
    fn halt_is_sticky_until_cleared() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open(dir.path(), PipelineConfig::default())?;

        env.halt("disk full");
        assert!(env.is_halted());
        drop(env);

        let env = Environment::open(dir.path(), PipelineConfig::default())?;
        assert!(env.is_halted());
        env.clear_halt()?;
        assert!(!env.is_halted());
        assert!(!dir.path().join(HALT_FILE).exists());

        let env = Environment::open(dir.path(), PipelineConfig::default())?;
        assert!(!env.is_halted());
        Ok(())
    }

    #[test]
    fn stored_config_is_created_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let env = Environment::open_with_stored_config(dir.path())?;
        assert_eq!(env.config(), &PipelineConfig::default());
        assert!(dir.path().join(CONFIG_FILE).is_file());

        let custom = PipelineConfig {
            neighbor_count: 7,
            ..Default::default()
        };
        custom.save(&dir.path().join(CONFIG_FILE))?;
        drop(env);

        let env = Environment::open_with_stored_config(dir.path())?;
        assert_eq!(env.config().neighbor_count, 7);
        Ok(())
    }

    #[test]
    fn invalid_config_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            staging_size_cap: 0,
            ..Default::default()
        };
        assert!(matches!(
            Environment::open(dir.path(), config),
            Err(Error::InvalidConfig(_))
        ));
    }
}
