//! Ordering keys for items in draggable, nested lists.
//!
//! Positions are sparse integers compared within one [`PositionGroup`]. New
//! positions are carved out of the gaps between siblings; when gaps run out or
//! values drift past the ceiling, the group is respaced by a rebalance job.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::CoreError;
use crate::ids::{ItemId, OwnerId};
use crate::item::Item;

pub const DEFAULT_SPACING: i64 = 10_000;
pub const DEFAULT_BASELINE_MIN: i64 = 1_000;
pub const DEFAULT_BASELINE_MAX: i64 = 10_000;
pub const DEFAULT_TOP_FLOOR: i64 = -10_000;
/// 4 keeps random picks inside the middle 50% of a gap.
pub const DEFAULT_GAP_MARGIN_DIVISOR: i64 = 4;
pub const DEFAULT_TAIL_JITTER: i64 = 5_000;
pub const DEFAULT_MIN_SAFE_GAP: i64 = 2;
pub const DEFAULT_MIN_GROUP_SIZE: usize = 10;
pub const DEFAULT_POSITION_CEILING: i64 = 2_000_000_000;

/// Tunable numbers behind position assignment and rebalancing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionPolicy {
    /// Distance between neighbours on append and after a rebalance.
    pub spacing: i64,
    /// Range for the first item of an empty group.
    pub baseline_min: i64,
    pub baseline_max: i64,
    /// Lowest value a top insert may produce while there is room above it.
    pub top_floor: i64,
    /// Random picks avoid `gap / divisor` at each end of a gap.
    pub gap_margin_divisor: i64,
    /// Upper bound of the random jitter added when inserting after the last item.
    pub tail_jitter: i64,
    /// Positive gaps below this are considered unsafe to subdivide.
    pub min_safe_gap: i64,
    /// Groups with fewer live members are never auto-rebalanced.
    pub min_group_size: usize,
    pub ceiling: i64,
}

impl Default for PositionPolicy {
    fn default() -> Self {
        Self {
            spacing: DEFAULT_SPACING,
            baseline_min: DEFAULT_BASELINE_MIN,
            baseline_max: DEFAULT_BASELINE_MAX,
            top_floor: DEFAULT_TOP_FLOOR,
            gap_margin_divisor: DEFAULT_GAP_MARGIN_DIVISOR,
            tail_jitter: DEFAULT_TAIL_JITTER,
            min_safe_gap: DEFAULT_MIN_SAFE_GAP,
            min_group_size: DEFAULT_MIN_GROUP_SIZE,
            ceiling: DEFAULT_POSITION_CEILING,
        }
    }
}

impl PositionPolicy {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.spacing < 1 {
            return Err(CoreError::InvalidPolicy("spacing must be positive".into()));
        }
        if self.baseline_min > self.baseline_max {
            return Err(CoreError::InvalidPolicy(format!(
                "baseline range is empty: {}..={}",
                self.baseline_min, self.baseline_max
            )));
        }
        if self.gap_margin_divisor < 2 {
            return Err(CoreError::InvalidPolicy(
                "gap_margin_divisor must be at least 2".into(),
            ));
        }
        if self.tail_jitter < 0 {
            return Err(CoreError::InvalidPolicy("tail_jitter must not be negative".into()));
        }
        if self.min_safe_gap < 1 {
            return Err(CoreError::InvalidPolicy("min_safe_gap must be positive".into()));
        }
        if self.ceiling <= self.baseline_max {
            return Err(CoreError::InvalidPolicy(
                "ceiling must be above the baseline range".into(),
            ));
        }
        Ok(())
    }
}

/// The scope inside which positions are compared: one owner's root level, or
/// the children of one parent item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PositionGroup {
    pub owner_id: OwnerId,
    pub parent_id: Option<ItemId>,
}

impl PositionGroup {
    pub fn root(owner_id: OwnerId) -> Self {
        Self {
            owner_id,
            parent_id: None,
        }
    }

    pub fn children(owner_id: OwnerId, parent_id: ItemId) -> Self {
        Self {
            owner_id,
            parent_id: Some(parent_id),
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

impl fmt::Display for PositionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_id {
            Some(parent) => write!(f, "{}/{}", self.owner_id, parent),
            None => write!(f, "{}/root", self.owner_id),
        }
    }
}

/// A live member of a group as seen by the assigner and the rebalancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sibling {
    pub item_id: ItemId,
    pub position: i64,
}

/// Which rule produced an item's position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementRule {
    /// Caller supplied the value.
    Finalized,
    /// First item of an empty group.
    Baseline,
    Top,
    /// Subdivided the gap between the anchor and its successor.
    Between,
    /// Gap to the successor was too small; took `anchor + 1`.
    Adjacent,
    /// Anchor was the last sibling.
    AfterLast,
    Append,
}

/// Compute a position for `item` from the ordered snapshot of its siblings.
///
/// `siblings` must be ordered by `(position, item_id)` and must not contain
/// `item` itself. An `insert_after_id` that does not name one of the siblings
/// is dropped and the item is appended instead.
pub fn assign_position<R: Rng + ?Sized>(
    item: &mut Item,
    siblings: &[Sibling],
    policy: &PositionPolicy,
    rng: &mut R,
) -> PlacementRule {
    if item.position_finalized {
        item.clear_directives();
        return PlacementRule::Finalized;
    }

    let (position, rule) = if item.insert_at_top {
        top_position(siblings, policy, rng)
    } else if let Some(anchor_id) = item.insert_after_id {
        match siblings.iter().position(|s| s.item_id == anchor_id) {
            Some(index) => after_position(siblings, index, policy, rng),
            None => append_position(siblings, policy, rng),
        }
    } else {
        append_position(siblings, policy, rng)
    };

    item.position = position;
    item.clear_directives();
    item.position_finalized = true;
    rule
}

fn baseline<R: Rng + ?Sized>(policy: &PositionPolicy, rng: &mut R) -> i64 {
    if policy.baseline_max <= policy.baseline_min {
        return policy.baseline_min;
    }
    rng.gen_range(policy.baseline_min..=policy.baseline_max)
}

fn top_position<R: Rng + ?Sized>(
    siblings: &[Sibling],
    policy: &PositionPolicy,
    rng: &mut R,
) -> (i64, PlacementRule) {
    let Some(min) = siblings.iter().map(|s| s.position).min() else {
        return (baseline(policy, rng), PlacementRule::Baseline);
    };

    let full_step = min.saturating_sub(policy.spacing);
    let position = if full_step >= policy.top_floor {
        full_step
    } else if min > policy.top_floor {
        policy.top_floor
    } else {
        // Already at or past the floor: stay strictly below and let the
        // rebalancer reclaim the room.
        min.saturating_sub(1)
    };
    (position, PlacementRule::Top)
}

fn after_position<R: Rng + ?Sized>(
    siblings: &[Sibling],
    anchor_index: usize,
    policy: &PositionPolicy,
    rng: &mut R,
) -> (i64, PlacementRule) {
    let anchor = siblings[anchor_index].position;

    let Some(next) = siblings.get(anchor_index + 1).map(|s| s.position) else {
        let jitter = if policy.tail_jitter > 0 {
            rng.gen_range(0..=policy.tail_jitter)
        } else {
            0
        };
        let position = anchor
            .saturating_add(policy.spacing)
            .saturating_add(jitter);
        return (position, PlacementRule::AfterLast);
    };

    let gap = next.saturating_sub(anchor);
    if gap <= 1 {
        return (anchor.saturating_add(1), PlacementRule::Adjacent);
    }

    let margin = gap / policy.gap_margin_divisor.max(2);
    let low = anchor.saturating_add(margin).max(anchor + 1);
    let high = next.saturating_sub(margin).min(next - 1);
    if low >= high {
        return (low, PlacementRule::Between);
    }
    (rng.gen_range(low..=high), PlacementRule::Between)
}

fn append_position<R: Rng + ?Sized>(
    siblings: &[Sibling],
    policy: &PositionPolicy,
    rng: &mut R,
) -> (i64, PlacementRule) {
    match siblings.iter().map(|s| s.position).max() {
        Some(last) => (last.saturating_add(policy.spacing), PlacementRule::Append),
        None => (baseline(policy, rng), PlacementRule::Baseline),
    }
}

/// Summary of a group's spacing used to decide whether it needs respacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GapDiagnostic {
    pub member_count: usize,
    /// Smallest strictly positive gap between neighbours. Duplicates do not
    /// count as a gap.
    pub min_gap: Option<i64>,
    pub max_position: Option<i64>,
}

impl GapDiagnostic {
    /// `positions` must be in ascending order.
    pub fn from_positions<I>(positions: I) -> Self
    where
        I: IntoIterator<Item = i64>,
    {
        let mut diagnostic = Self::default();
        let mut previous: Option<i64> = None;

        for position in positions {
            diagnostic.member_count += 1;
            diagnostic.max_position = Some(match diagnostic.max_position {
                Some(max) => max.max(position),
                None => position,
            });
            if let Some(prev) = previous {
                let gap = position.saturating_sub(prev);
                if gap > 0 {
                    diagnostic.min_gap = Some(match diagnostic.min_gap {
                        Some(min) => min.min(gap),
                        None => gap,
                    });
                }
            }
            previous = Some(position);
        }
        diagnostic
    }

    pub fn from_siblings(siblings: &[Sibling]) -> Self {
        Self::from_positions(siblings.iter().map(|s| s.position))
    }

    pub fn gap_too_small(&self, policy: &PositionPolicy) -> bool {
        self.min_gap.is_some_and(|gap| gap < policy.min_safe_gap)
    }

    pub fn above_ceiling(&self, policy: &PositionPolicy) -> bool {
        self.max_position.is_some_and(|max| max > policy.ceiling)
    }

    pub fn needs_rebalance(&self, policy: &PositionPolicy) -> bool {
        self.gap_too_small(policy) || self.above_ceiling(policy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionChange {
    pub item_id: ItemId,
    pub from: i64,
    pub to: i64,
}

/// Step used to respace a group of `member_count` members: the policy spacing,
/// narrowed so the last member stays at or below the ceiling.
pub fn respacing_step(policy: &PositionPolicy, member_count: usize) -> i64 {
    let count = i64::try_from(member_count.max(1)).unwrap_or(i64::MAX);
    (policy.ceiling / count).clamp(1, policy.spacing.max(1))
}

/// Target positions `spacing * 1, spacing * 2, ...` for `members` in their
/// current order. Members already at their target are left out.
pub fn even_spacing(members: &[Sibling], spacing: i64) -> Vec<PositionChange> {
    members
        .iter()
        .zip(1i64..)
        .filter_map(|(member, ordinal)| {
            let to = spacing.saturating_mul(ordinal);
            (member.position != to).then_some(PositionChange {
                item_id: member.item_id,
                from: member.position,
                to,
            })
        })
        .collect()
}
