use crate::ids::{ItemId, OwnerId};
use crate::position::PositionGroup;

/// A positioned entry in a job's task list.
///
/// `insert_after_id` and `insert_at_top` are per-request directives. They are
/// never persisted: the position assigner consumes and clears them before the
/// write commits. Setting either one through the methods below un-finalizes
/// the position so the assigner recomputes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub item_id: ItemId,
    pub owner_id: OwnerId,
    pub parent_id: Option<ItemId>,
    pub title: String,
    pub position: i64,
    pub position_finalized: bool,
    pub insert_after_id: Option<ItemId>,
    pub insert_at_top: bool,
    pub deleted: bool,
}

impl Item {
    /// A new root-level item that will be appended at the end of its group.
    pub fn new(owner_id: OwnerId, title: impl Into<String>) -> Self {
        Self {
            item_id: ItemId::new(),
            owner_id,
            parent_id: None,
            title: title.into(),
            position: 0,
            position_finalized: false,
            insert_after_id: None,
            insert_at_top: false,
            deleted: false,
        }
    }

    pub fn child_of(mut self, parent_id: ItemId) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn after(mut self, anchor: ItemId) -> Self {
        self.move_after(anchor);
        self
    }

    pub fn at_top(mut self) -> Self {
        self.move_to_top();
        self
    }

    /// Use `position` verbatim (bulk import, fixtures, the rebalancer).
    pub fn with_position(mut self, position: i64) -> Self {
        self.set_position(position);
        self
    }

    pub fn group(&self) -> PositionGroup {
        PositionGroup {
            owner_id: self.owner_id,
            parent_id: self.parent_id,
        }
    }

    pub fn has_directive(&self) -> bool {
        self.insert_at_top || self.insert_after_id.is_some()
    }

    pub fn clear_directives(&mut self) {
        self.insert_after_id = None;
        self.insert_at_top = false;
    }

    pub fn move_after(&mut self, anchor: ItemId) {
        self.insert_after_id = Some(anchor);
        self.insert_at_top = false;
        self.position_finalized = false;
    }

    pub fn move_to_top(&mut self) {
        self.insert_after_id = None;
        self.insert_at_top = true;
        self.position_finalized = false;
    }

    /// Re-parent the item. Without a further directive it lands at the end of
    /// the destination group.
    pub fn move_to_parent(&mut self, parent_id: Option<ItemId>) {
        if self.parent_id != parent_id {
            self.parent_id = parent_id;
            self.position_finalized = false;
        }
    }

    pub fn set_position(&mut self, position: i64) {
        self.position = position;
        self.position_finalized = true;
        self.clear_directives();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_unfinalize_position() {
        let owner = OwnerId::new();
        let mut item = Item::new(owner, "Quote").with_position(40_000);
        assert!(item.position_finalized);

        item.move_to_top();
        assert!(!item.position_finalized);
        assert!(item.insert_at_top);

        let anchor = ItemId::new();
        item.move_after(anchor);
        assert!(!item.insert_at_top);
        assert_eq!(item.insert_after_id, Some(anchor));
    }

    #[test]
    fn reparent_to_same_parent_keeps_position() {
        let owner = OwnerId::new();
        let parent = ItemId::new();
        let mut item = Item::new(owner, "Invoice").child_of(parent).with_position(10);
        item.move_to_parent(Some(parent));
        assert!(item.position_finalized);

        item.move_to_parent(None);
        assert!(!item.position_finalized);
        assert_eq!(item.group(), PositionGroup::root(owner));
    }
}
