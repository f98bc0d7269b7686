use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use jobtrack_core::{
    ids::*,
    item::Item,
    position::{PositionGroup, PositionPolicy},
};
use jobtrack_engine::{Engine, EngineConfig, EngineError};
use jobtrack_storage::{ItemStore, JobQueue, JobStatus, SqliteStorage};

use crate::audit::RecordingAudit;

const SEED: u64 = 0x5eed;

/// One job's task board backed by an in-memory database, with seeded
/// placement and a recording audit hook.
pub struct TestBoard {
    pub engine: Engine,
    pub owner: OwnerId,
    pub audit: Arc<RecordingAudit>,
}

impl TestBoard {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_policy(policy: PositionPolicy) -> Result<Self, EngineError> {
        Self::with_config(EngineConfig {
            policy,
            ..EngineConfig::default()
        })
    }

    pub fn with_config(mut config: EngineConfig) -> Result<Self, EngineError> {
        // Retries become due immediately so tests can drain the queue inline.
        config.queue.retry_backoff_ms = 0;
        let audit = Arc::new(RecordingAudit::default());
        let engine = Engine::with_config(SqliteStorage::open_in_memory()?, config)?
            .with_rng(StdRng::seed_from_u64(SEED))
            .with_audit(audit.clone());
        Ok(Self {
            engine,
            owner: OwnerId::new(),
            audit,
        })
    }

    pub fn root(&self) -> PositionGroup {
        PositionGroup::root(self.owner)
    }

    pub fn children_of(&self, parent: ItemId) -> PositionGroup {
        PositionGroup::children(self.owner, parent)
    }

    /// Append a root-level item.
    pub fn add(&mut self, title: &str) -> Result<Item, EngineError> {
        self.engine.create_item(Item::new(self.owner, title))
    }

    pub fn add_child(&mut self, parent: ItemId, title: &str) -> Result<Item, EngineError> {
        self.engine
            .create_item(Item::new(self.owner, title).child_of(parent))
    }

    pub fn add_after(&mut self, anchor: ItemId, title: &str) -> Result<Item, EngineError> {
        self.engine
            .create_item(Item::new(self.owner, title).after(anchor))
    }

    pub fn add_at_top(&mut self, title: &str) -> Result<Item, EngineError> {
        self.engine.create_item(Item::new(self.owner, title).at_top())
    }

    /// Bulk-import items with fixed positions straight into storage, bypassing
    /// assignment, audit and the rebalance trigger.
    pub fn seed(&mut self, group: PositionGroup, positions: &[i64]) -> Result<Vec<Item>, EngineError> {
        let mut items = Vec::with_capacity(positions.len());
        for (i, &position) in positions.iter().enumerate() {
            let mut item = Item::new(group.owner_id, format!("seeded {i}")).with_position(position);
            item.parent_id = group.parent_id;
            self.engine.storage_mut().insert_item(&item)?;
            items.push(item);
        }
        Ok(items)
    }

    pub fn positions(&self, group: &PositionGroup) -> Result<Vec<i64>, EngineError> {
        Ok(self
            .engine
            .storage()
            .get_group_members(group)?
            .iter()
            .map(|m| m.position)
            .collect())
    }

    pub fn ids(&self, group: &PositionGroup) -> Result<Vec<ItemId>, EngineError> {
        Ok(self
            .engine
            .storage()
            .get_group_members(group)?
            .iter()
            .map(|m| m.item_id)
            .collect())
    }

    /// Jobs for `group` that have not run yet.
    pub fn queued_jobs(&self, group: &PositionGroup) -> Result<usize, EngineError> {
        Ok(self
            .engine
            .storage()
            .jobs_for_group(group)?
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .count())
    }
}
