//! Event-driven observation of the pipeline engine
//!
//! Every meaningful transition (slots opened, slot taken/completed,
//! consensus evaluated, layer passed/flagged, pipeline completed, rewards,
//! registry commits) is published on a Tokio broadcast bus and persisted
//! to RocksDB, forming the auditable trail of each claim's deliberation.

pub mod bus;
pub mod history;
pub mod types;

// Re-export core types
pub use bus::{EventBus, EventBusError, EventBusResult, SharedEventBus};
pub use history::{EventHistory, EventStats, HistoryError, HistoryResult};
pub use types::{EventId, PipelineEvent};
