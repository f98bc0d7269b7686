use std::sync::Mutex;

use jobtrack_core::{ids::ItemId, item::Item};
use jobtrack_engine::AuditHook;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Created { item_id: ItemId, position: i64 },
    Moved { item_id: ItemId, from: i64, to: i64 },
    Deleted { item_id: ItemId },
}

/// Audit hook that keeps every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingAudit {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAudit {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }

    fn push(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl AuditHook for RecordingAudit {
    fn item_created(&self, item: &Item) {
        self.push(AuditEvent::Created {
            item_id: item.item_id,
            position: item.position,
        });
    }

    fn position_changed(&self, item: &Item, previous_position: i64) {
        self.push(AuditEvent::Moved {
            item_id: item.item_id,
            from: previous_position,
            to: item.position,
        });
    }

    fn item_deleted(&self, item_id: ItemId) {
        self.push(AuditEvent::Deleted { item_id });
    }
}
