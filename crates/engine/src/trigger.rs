use jobtrack_core::{
    ids::RebalanceJobId,
    position::{GapDiagnostic, PositionGroup},
};
use jobtrack_storage::{ItemStore, JobQueue, StorageError};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// The write came from a rebalance of this execution.
    Guarded,
    TooFewMembers { count: usize },
    Healthy(GapDiagnostic),
    Scheduled {
        job_id: RebalanceJobId,
        diagnostic: GapDiagnostic,
    },
}

impl TriggerDecision {
    pub fn is_scheduled(&self) -> bool {
        matches!(self, Self::Scheduled { .. })
    }
}

/// Post-commit check after an insert into `group` or a position change in it.
/// Queues a rebalance when the group is large enough and either has a gap too
/// small to subdivide or a member above the ceiling.
pub fn evaluate<S>(
    ctx: &ExecutionContext,
    storage: &mut S,
    group: &PositionGroup,
    config: &EngineConfig,
) -> Result<TriggerDecision, StorageError>
where
    S: ItemStore + JobQueue,
{
    if ctx.is_rebalancing() {
        return Ok(TriggerDecision::Guarded);
    }

    let members = storage.get_group_members(group)?;
    if members.len() < config.policy.min_group_size {
        return Ok(TriggerDecision::TooFewMembers {
            count: members.len(),
        });
    }

    let diagnostic = GapDiagnostic::from_siblings(&members);
    if !diagnostic.needs_rebalance(&config.policy) {
        return Ok(TriggerDecision::Healthy(diagnostic));
    }

    let job_id = storage.enqueue_rebalance(group, config.queue.max_attempts)?;
    tracing::info!(
        group = %group,
        %job_id,
        members = diagnostic.member_count,
        min_gap = ?diagnostic.min_gap,
        max_position = ?diagnostic.max_position,
        "rebalance scheduled"
    );
    Ok(TriggerDecision::Scheduled { job_id, diagnostic })
}
