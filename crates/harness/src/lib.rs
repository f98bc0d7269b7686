pub mod audit;
pub mod board;
pub mod cluster;

pub use audit::{AuditEvent, RecordingAudit};
pub use board::TestBoard;
pub use cluster::TestCluster;
