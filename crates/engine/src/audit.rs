use jobtrack_core::{ids::ItemId, item::Item};

/// Side-effect hook for user-visible item changes.
///
/// Only ordinary edits reach it. Respacing done by the rebalancer is an
/// internal detail and is never reported.
pub trait AuditHook: Send + Sync {
    fn item_created(&self, _item: &Item) {}

    fn position_changed(&self, _item: &Item, _previous_position: i64) {}

    fn item_deleted(&self, _item_id: ItemId) {}
}

/// Default hook: one `tracing` event per change.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditHook for TracingAudit {
    fn item_created(&self, item: &Item) {
        tracing::info!(
            target: "jobtrack::audit",
            item_id = %item.item_id,
            owner_id = %item.owner_id,
            position = item.position,
            "item created"
        );
    }

    fn position_changed(&self, item: &Item, previous_position: i64) {
        tracing::info!(
            target: "jobtrack::audit",
            item_id = %item.item_id,
            from = previous_position,
            to = item.position,
            "item moved"
        );
    }

    fn item_deleted(&self, item_id: ItemId) {
        tracing::info!(target: "jobtrack::audit", item_id = %item_id, "item deleted");
    }
}
