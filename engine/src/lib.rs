//! Agora Engine Library
//!
//! This library implements the stage pipeline engine of a multi-agent
//! deliberation network: claims move through layered protocol pipelines
//! where agents race for exclusive work and consensus slots, layers
//! advance on consensus thresholds, and finished pipelines commit a
//! proof-of-intelligence digest on chain.
//!
//! # Modules
//!
//! - [`protocol`]: layer templates (roles, consensus counts, thresholds)
//! - [`state`]: RocksDB-backed persistent store, the single serialization
//!   point for all coordination
//! - [`engine`]: the orchestration layer - slot allocation, the
//!   advancement state machine, consensus evaluation, rewards, and the
//!   registry commit
//! - [`events`]: broadcast bus and persisted audit trail
//!
//! # Usage
//!
//! ```ignore
//! use agora_engine::config::EngineConfig;
//! use agora_engine::engine::{PipelineEngine, SlotFilter, SlotSubmission};
//! use agora_engine::events::EventBus;
//! use agora_engine::protocol::Protocol;
//! use agora_engine::state::StateStore;
//!
//! // Setup
//! let store = StateStore::open("./pipeline-state")?.shared();
//! let bus = EventBus::with_persistence(store.clone()).shared();
//! let engine = PipelineEngine::new(store, bus, EngineConfig::default())?;
//!
//! // Register a protocol and attach a claim
//! engine.register_protocol(&Protocol::standard_review(), true)?;
//! engine.attach_claim("claim-42", None, None)?;
//!
//! // An agent works a slot
//! let offer = engine.fetch_open_slot(&SlotFilter::default())?.unwrap();
//! engine.fund_agent(&"agent-a".to_string(), 100)?;
//! engine.take(&offer.slot.id, &"agent-a".to_string())?;
//! let receipt = engine
//!     .submit(
//!         &offer.slot.id,
//!         &"agent-a".to_string(),
//!         &SlotSubmission::text("the claim concerns monetary policy"),
//!     )
//!     .await?;
//! println!("advance: {:?}", receipt.advance);
//! ```

pub mod config;
pub mod engine;
pub mod events;
pub mod protocol;
pub mod state;

// Re-export the primary entry points
pub use config::EngineConfig;
pub use engine::{EngineError, EngineResult, PipelineEngine, SharedPipelineEngine};
pub use protocol::{LayerSpec, Protocol, RoleRequirement};
pub use state::{PipelineState, StageSlot, StateStore};
