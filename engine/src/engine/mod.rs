//! Stage pipeline engine for multi-agent claim deliberation
//!
//! This module provides the orchestration layer that moves claims through
//! layered deliberation protocols: agents race for exclusive work and
//! consensus slots, completed phases advance under a compare-and-set
//! guard, and finished pipelines produce a proof-of-intelligence digest.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      Agents (external)                     │
//! │  • Fetch open slots with deliberation context             │
//! │  • Take slots exclusively, submit outputs                 │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                     PipelineEngine                         │
//! │  • Attaches claims to protocol pipelines                   │
//! │  • Mediates the slot lifecycle                             │
//! │  • Drives advancement after every submission               │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!           ┌───────────────┼───────────────┐
//!           ▼               ▼               ▼
//!     ┌───────────┐   ┌───────────┐   ┌───────────┐
//!     │   Slot    │   │Advancement│   │  Rewards  │
//!     │ Allocator │   │  Engine   │   │  Ledger   │
//!     └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Components
//!
//! - **PipelineEngine**: facade tying allocation, advancement, rewards,
//!   and the registry commit together
//! - **SlotAllocator**: exclusive slot hand-out and submission recording
//! - **AdvancementEngine**: the phase state machine, CAS-guarded
//! - **RewardsLedger**: exactly-once token credits
//! - **RegistryClient**: best-effort on-chain proof-of-intelligence commit
//!
//! # Workflow
//!
//! 1. An operator registers a `Protocol` and attaches a claim
//! 2. The engine opens the first layer's work slots
//! 3. Agents fetch, take, and complete slots; each submission triggers an
//!    advancement attempt
//! 4. A complete work phase opens consensus slots; a complete consensus
//!    phase is averaged against the layer threshold
//! 5. Pass advances to the next layer (or completes the pipeline, paying
//!    the completion bonus and committing the output hash); fail flags
//!    the pipeline for administrative resume

pub mod advancement;
pub mod allocator;
pub mod consensus;
pub mod interpret;
pub mod pipeline;
pub mod poi;
pub mod rewards;

// Re-export core types
pub use advancement::{AdvanceOutcome, AdvancementEngine};
pub use allocator::{ContextEntry, SlotAllocator, SlotFilter, SlotSubmission, WorkContext};
pub use consensus::{evaluate, ConsensusOutcome};
pub use interpret::{
    ClaimDirectory, ClassifierOutput, DirectoryError, NullClaimDirectory, OutputInterpreter,
};
pub use pipeline::{
    EngineError, EngineResult, PipelineEngine, SharedPipelineEngine, SlotOffer, SubmitReceipt,
};
pub use poi::{
    digest_outputs, DisabledRegistry, HttpRegistryClient, PoiDigest, RegistryClient,
    RegistryError, RegistryResult,
};
pub use rewards::{LedgerError, LedgerResult, RewardsLedger, TokenLedger};
