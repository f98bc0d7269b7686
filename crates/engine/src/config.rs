use serde::{Deserialize, Serialize};

use jobtrack_core::position::PositionPolicy;

use crate::EngineError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_BATCH_SIZE: usize = 32;
pub const DEFAULT_CLAIM_LEASE_MS: u64 = 5 * 60 * 1_000;

/// Retry and polling behaviour of the rebalance queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Claims allowed per job before it is dead-lettered.
    pub max_attempts: u32,
    /// Linear backoff: attempt `n` waits `n * retry_backoff_ms` before the next claim.
    pub retry_backoff_ms: u64,
    pub poll_interval_ms: u64,
    /// Jobs a worker handles before checking for shutdown.
    pub batch_size: usize,
    /// A job left `running` this long is treated as abandoned and re-queued.
    pub claim_lease_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            claim_lease_ms: DEFAULT_CLAIM_LEASE_MS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: PositionPolicy,
    pub queue: QueueConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.policy.validate()?;
        if self.queue.max_attempts == 0 {
            return Err(EngineError::InvalidConfig("max_attempts must be at least 1".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(EngineError::InvalidConfig("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}
