use jobtrack_core::CoreError;
use jobtrack_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("item already deleted: {0}")]
    ItemDeleted(String),

    #[error("item {item_id} cannot move to another owner")]
    OwnerChange { item_id: String },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rebalance worker panicked")]
    WorkerPanicked,
}
