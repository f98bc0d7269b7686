use jobtrack_core::{
    ids::*,
    item::Item,
    position::{PositionChange, PositionGroup, Sibling},
};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::Serialization(format!("unknown job status: {s}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RebalanceJobRecord {
    pub job_id: RebalanceJobId,
    pub group: PositionGroup,
    pub status: JobStatus,
    /// Number of times the job has been claimed, including the current claim.
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounts {
    pub queued: u64,
    pub running: u64,
    pub done: u64,
    pub failed: u64,
}

/// Persistence for positioned items. Deleted items are never group members.
pub trait ItemStore {
    fn insert_item(&mut self, item: &Item) -> Result<(), StorageError>;

    /// Overwrite parent, title and position of a live item.
    fn update_item(&mut self, item: &Item) -> Result<(), StorageError>;

    /// Soft-delete. Returns false if the item was missing or already deleted.
    fn delete_item(&mut self, item_id: ItemId) -> Result<bool, StorageError>;

    fn get_item(&self, item_id: ItemId) -> Result<Option<Item>, StorageError>;

    /// Live members ordered by `(position, item_id)`.
    fn get_group_members(&self, group: &PositionGroup) -> Result<Vec<Sibling>, StorageError>;

    /// Same order as [`ItemStore::get_group_members`], full records.
    fn get_group_items(&self, group: &PositionGroup) -> Result<Vec<Item>, StorageError>;

    fn count_group_members(&self, group: &PositionGroup) -> Result<usize, StorageError>;

    /// Apply all changes in one transaction. `snapshot` is the member list the
    /// changes were planned from; if the live members of `group` no longer
    /// match it, or an item is no longer at `change.from`, nothing is written
    /// and [`StorageError::Conflict`] is returned.
    fn apply_positions(
        &mut self,
        group: &PositionGroup,
        snapshot: &[Sibling],
        changes: &[PositionChange],
    ) -> Result<(), StorageError>;
}

/// Durable, at-least-once queue of group rebalance requests.
pub trait JobQueue {
    fn enqueue_rebalance(
        &mut self,
        group: &PositionGroup,
        max_attempts: u32,
    ) -> Result<RebalanceJobId, StorageError>;

    /// Claim the oldest runnable queued job, marking it running.
    fn claim_next_job(&mut self) -> Result<Option<RebalanceJobRecord>, StorageError>;

    fn complete_job(&mut self, job_id: RebalanceJobId) -> Result<(), StorageError>;

    /// Record a failed attempt. The job is queued again after
    /// `retry_delay_ms * attempts` unless it has used up its attempts, in
    /// which case it ends `Failed`. Returns the resulting status.
    fn fail_job(
        &mut self,
        job_id: RebalanceJobId,
        error: &str,
        retry_delay_ms: u64,
    ) -> Result<JobStatus, StorageError>;

    /// Re-queue jobs left running by a worker that stopped mid-job.
    fn recover_jobs(&mut self) -> Result<usize, StorageError>;

    /// Re-queue jobs whose claim has not been touched for `lease_ms`.
    fn requeue_expired(&mut self, lease_ms: u64) -> Result<usize, StorageError>;

    fn get_job(&self, job_id: RebalanceJobId) -> Result<Option<RebalanceJobRecord>, StorageError>;

    fn jobs_for_group(&self, group: &PositionGroup) -> Result<Vec<RebalanceJobRecord>, StorageError>;

    fn job_counts(&self) -> Result<JobCounts, StorageError>;
}
