use jobtrack_core::position::{GapDiagnostic, PositionGroup, even_spacing, respacing_step};
use jobtrack_storage::{ItemStore, JobQueue, StorageError};

use crate::config::EngineConfig;
use crate::context::ExecutionContext;
use crate::trigger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebalanceOutcome {
    TooFewMembers { count: usize },
    /// Spacing was already fine when the job ran.
    NotNeeded(GapDiagnostic),
    Rebalanced { written: usize },
}

/// Respace `group` to `step * 1, step * 2, ...` if it still needs it. The step
/// is the policy spacing, narrowed for very large groups so the result stays
/// under the ceiling.
///
/// Safe to run any number of times: it re-checks the group before writing,
/// and an evenly spaced group produces no writes. Either every changed
/// member is written or none is; if the group changed after it was read the
/// write fails with a conflict and the job is retried.
pub fn run_rebalance<S>(
    ctx: &ExecutionContext,
    storage: &mut S,
    group: &PositionGroup,
    config: &EngineConfig,
) -> Result<RebalanceOutcome, StorageError>
where
    S: ItemStore + JobQueue,
{
    let _guard = ctx.enter_rebalance();

    let members = storage.get_group_members(group)?;
    if members.len() < 2 {
        return Ok(RebalanceOutcome::TooFewMembers {
            count: members.len(),
        });
    }

    let diagnostic = GapDiagnostic::from_siblings(&members);
    if !diagnostic.needs_rebalance(&config.policy) {
        tracing::debug!(group = %group, "rebalance no longer needed");
        return Ok(RebalanceOutcome::NotNeeded(diagnostic));
    }

    let step = respacing_step(&config.policy, members.len());
    let changes = even_spacing(&members, step);
    storage.apply_positions(group, &members, &changes)?;

    // Same post-commit hook as any positional write; the guard keeps it quiet.
    trigger::evaluate(ctx, storage, group, config)?;

    tracing::info!(
        group = %group,
        members = members.len(),
        step,
        written = changes.len(),
        "group rebalanced"
    );
    Ok(RebalanceOutcome::Rebalanced {
        written: changes.len(),
    })
}
