use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use tempfile::TempDir;

use jobtrack_core::ids::OwnerId;
use jobtrack_engine::{Engine, EngineConfig, EngineError, RebalanceWorker};
use jobtrack_storage::SqliteStorage;

/// Several app servers sharing one database file, as in production.
pub struct TestCluster {
    _dir: TempDir,
    path: PathBuf,
    pub owner: OwnerId,
    pub config: EngineConfig,
}

impl TestCluster {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("jobtrack.db");
        Ok(Self {
            _dir: dir,
            path,
            owner: OwnerId::new(),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A new engine with its own connection. `seed` keeps placement reproducible.
    pub fn engine(&self, seed: u64) -> Result<Engine, EngineError> {
        let storage = SqliteStorage::open(&self.path)?;
        Ok(Engine::with_config(storage, self.config.clone())?.with_rng(StdRng::seed_from_u64(seed)))
    }

    pub fn spawn_worker(&self) -> Result<RebalanceWorker, EngineError> {
        RebalanceWorker::spawn(&self.path, self.config.clone())
    }
}
