pub mod audit;
pub mod config;
pub mod context;
pub mod error;
pub mod rebalance;
pub mod trigger;
pub mod worker;

pub use audit::{AuditHook, TracingAudit};
pub use config::{EngineConfig, QueueConfig};
pub use context::{ExecutionContext, RecursionGuard};
pub use error::EngineError;
pub use rebalance::RebalanceOutcome;
pub use trigger::TriggerDecision;
pub use worker::{JobReport, JobRunSummary, RebalanceWorker};

use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;

use jobtrack_core::{
    ids::*,
    item::Item,
    position::{PositionGroup, Sibling, assign_position},
};
use jobtrack_storage::{ItemStore, SqliteStorage};

pub struct Engine {
    storage: SqliteStorage,
    config: EngineConfig,
    rng: StdRng,
    audit: Arc<dyn AuditHook>,
}

impl Engine {
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            config: EngineConfig::default(),
            rng: StdRng::from_entropy(),
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_config(storage: SqliteStorage, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            ..Self::new(storage)
        })
    }

    /// Replace the randomness source, e.g. with a seeded one for reproducible placement.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditHook>) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    fn require_live_item(&self, item_id: ItemId) -> Result<Item, EngineError> {
        match self.storage.get_item(item_id)? {
            None => Err(EngineError::ItemNotFound(item_id.to_string())),
            Some(item) if item.deleted => Err(EngineError::ItemDeleted(item_id.to_string())),
            Some(item) => Ok(item),
        }
    }

    /// Live members of `group` other than `item_id`, in order.
    fn siblings_of(&self, group: &PositionGroup, item_id: ItemId) -> Result<Vec<Sibling>, EngineError> {
        let mut members = self.storage.get_group_members(group)?;
        members.retain(|s| s.item_id != item_id);
        Ok(members)
    }

    fn place(&mut self, item: &mut Item) -> Result<(), EngineError> {
        let group = item.group();
        let siblings = self.siblings_of(&group, item.item_id)?;
        let rule = assign_position(item, &siblings, &self.config.policy, &mut self.rng);
        tracing::debug!(
            item_id = %item.item_id,
            group = %group,
            position = item.position,
            ?rule,
            "position assigned"
        );
        Ok(())
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert `item`, computing its position unless it is finalized.
    pub fn create_item(&mut self, item: Item) -> Result<Item, EngineError> {
        self.create_item_in(&ExecutionContext::new(), item)
    }

    pub fn create_item_in(
        &mut self,
        ctx: &ExecutionContext,
        mut item: Item,
    ) -> Result<Item, EngineError> {
        if let Some(parent_id) = item.parent_id {
            self.require_live_item(parent_id)?;
        }
        self.place(&mut item)?;
        self.storage.insert_item(&item)?;
        self.audit.item_created(&item);

        trigger::evaluate(ctx, &mut self.storage, &item.group(), &self.config)?;
        Ok(item)
    }

    /// Persist changes to an existing item. A pending directive recomputes the
    /// position. A new parent without a directive appends the item to the
    /// destination group. Otherwise the given position is kept.
    pub fn update_item(&mut self, item: Item) -> Result<Item, EngineError> {
        self.update_item_in(&ExecutionContext::new(), item)
    }

    pub fn update_item_in(
        &mut self,
        ctx: &ExecutionContext,
        mut item: Item,
    ) -> Result<Item, EngineError> {
        let current = self.require_live_item(item.item_id)?;
        if current.owner_id != item.owner_id {
            return Err(EngineError::OwnerChange {
                item_id: item.item_id.to_string(),
            });
        }
        if current.parent_id != item.parent_id {
            if let Some(parent_id) = item.parent_id {
                self.require_live_item(parent_id)?;
            }
            // A position from the old group means nothing in the new one.
            if !item.has_directive() {
                item.position_finalized = false;
            }
        }

        self.place(&mut item)?;
        self.storage.update_item(&item)?;

        let regrouped = current.group() != item.group();
        if regrouped || current.position != item.position {
            self.audit.position_changed(&item, current.position);
            trigger::evaluate(ctx, &mut self.storage, &item.group(), &self.config)?;
        }
        Ok(item)
    }

    /// Drag `item_id` directly below `anchor` in its current group.
    pub fn move_after(&mut self, item_id: ItemId, anchor: ItemId) -> Result<Item, EngineError> {
        let mut item = self.require_live_item(item_id)?;
        item.move_after(anchor);
        self.update_item(item)
    }

    pub fn move_to_top(&mut self, item_id: ItemId) -> Result<Item, EngineError> {
        let mut item = self.require_live_item(item_id)?;
        item.move_to_top();
        self.update_item(item)
    }

    /// Re-parent `item_id`; it lands at the end of the new group.
    pub fn move_to_parent(
        &mut self,
        item_id: ItemId,
        parent_id: Option<ItemId>,
    ) -> Result<Item, EngineError> {
        let mut item = self.require_live_item(item_id)?;
        item.move_to_parent(parent_id);
        self.update_item(item)
    }

    pub fn delete_item(&mut self, item_id: ItemId) -> Result<(), EngineError> {
        self.require_live_item(item_id)?;
        self.storage.delete_item(item_id)?;
        self.audit.item_deleted(item_id);
        Ok(())
    }

    // ========================================================================
    // Rebalancing
    // ========================================================================

    /// Rebalance `group` now, in a fresh execution, bypassing the queue.
    pub fn rebalance_group(&mut self, group: &PositionGroup) -> Result<RebalanceOutcome, EngineError> {
        let ctx = ExecutionContext::new();
        Ok(rebalance::run_rebalance(
            &ctx,
            &mut self.storage,
            group,
            &self.config,
        )?)
    }

    /// Run every queued job that is due, on this thread.
    pub fn run_pending_jobs(&mut self) -> Result<JobRunSummary, EngineError> {
        Ok(worker::drain_queue(&mut self.storage, &self.config)?)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn get_item(&self, item_id: ItemId) -> Result<Option<Item>, EngineError> {
        Ok(self.storage.get_item(item_id)?)
    }

    /// Live items of `group` in display order.
    pub fn list_group(&self, group: &PositionGroup) -> Result<Vec<Item>, EngineError> {
        Ok(self.storage.get_group_items(group)?)
    }

    pub fn list_children(&self, owner_id: OwnerId, parent_id: ItemId) -> Result<Vec<Item>, EngineError> {
        self.list_group(&PositionGroup::children(owner_id, parent_id))
    }
}
