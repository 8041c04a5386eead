//! State persistence module for the stage pipeline engine
//!
//! This module provides RocksDB-backed persistent storage for the five
//! durable record kinds of the deliberation core:
//!
//! - `protocols`: immutable layer templates
//! - `pipelines`: per-claim PipelineState (the state machine's program counter)
//! - `slots`: StageSlot records forming the permanent audit trail
//! - `flags`: consensus-failure flags
//! - `ledger` / `balances`: reward entries and agent token balances
//! - `events`: event history for replay
//!
//! The store is the engine's single serialization point: request handlers
//! are independent and stateless, and every read-modify-write goes through
//! a store operation that holds the write lock for its full span.
//!
//! # Usage
//!
//! ```ignore
//! use agora_engine::state::{StateStore, PipelineState};
//!
//! let store = StateStore::open("./pipeline-state")?;
//! let pipeline = PipelineState::new("claim-1".into(), "standard".into());
//! store.create_pipeline(&pipeline)?;
//! ```

pub mod schema;
pub mod store;
pub mod types;

// Re-export core types
pub use store::{SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    AgentId, ClaimId, Flag, PipelinePhase, PipelineState, PipelineStatus, ProtocolId, RewardEntry,
    RewardReason, SlotId, SlotStatus, SlotType, StageSlot,
};
