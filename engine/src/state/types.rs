//! Core types for pipeline state persistence
//!
//! These types are stored in RocksDB and form the durable record of a
//! claim's passage through layered deliberation: the pipeline program
//! counter, the stage slots agents fill, consensus-failure flags, and the
//! reward ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for claims (owned by the external claim service)
pub type ClaimId = String;

/// Identity of a participating agent (or human acting through the API)
pub type AgentId = String;

/// Unique identifier for protocol templates
pub type ProtocolId = String;

/// Unique identifier for stage slots
///
/// Slot ids are deterministic composite keys (see `schema::keys::slot`),
/// so lexicographic id order is creation order.
pub type SlotId = String;

/// Phase of the current layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    /// Role-specific work slots are being filled
    Work,
    /// Consensus review slots are being filled
    Consensus,
}

impl std::fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelinePhase::Work => write!(f, "work"),
            PipelinePhase::Consensus => write!(f, "consensus"),
        }
    }
}

impl PipelinePhase {
    /// The slot type filled during this phase
    pub fn slot_type(&self) -> SlotType {
        match self {
            PipelinePhase::Work => SlotType::Work,
            PipelinePhase::Consensus => SlotType::Consensus,
        }
    }
}

/// Overall pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Advancing through layers
    Active,
    /// A layer failed consensus; halted until administratively resumed
    Flagged,
    /// All layers passed; terminal
    Complete,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Active => write!(f, "active"),
            PipelineStatus::Flagged => write!(f, "flagged"),
            PipelineStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Kind of a stage slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotType {
    /// Role-specific reasoning output
    Work,
    /// Confidence review of the layer's work outputs
    Consensus,
}

impl std::fmt::Display for SlotType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotType::Work => write!(f, "work"),
            SlotType::Consensus => write!(f, "consensus"),
        }
    }
}

/// Lifecycle status of a stage slot
///
/// A slot is mutated exactly twice: `open -> taken` (atomic claim) and
/// `taken -> done` (submission). Reclaim of an expired `taken` slot is the
/// one deliberate exception (see `StateStore::reclaim_taken_before`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Open,
    Taken,
    Done,
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Open => write!(f, "open"),
            SlotStatus::Taken => write!(f, "taken"),
            SlotStatus::Done => write!(f, "done"),
        }
    }
}

/// The authoritative progress record for one claim's deliberation
///
/// Exactly one exists per claim. Only the advancement state machine
/// mutates it, and `complete` is terminal (the commit-tx backfill after a
/// successful registry call is the single permitted bookkeeping write).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    /// Claim this pipeline deliberates
    pub claim_id: ClaimId,

    /// Protocol template governing layer structure
    pub protocol_id: ProtocolId,

    /// Domain tag snapshotted from the claim at attach time
    pub domain: Option<String>,

    /// Index of the layer currently being filled
    pub current_layer: u32,

    /// Phase of the current layer
    pub phase: PipelinePhase,

    /// Overall status
    pub status: PipelineStatus,

    /// Retry round of the current layer; incremented by administrative
    /// resume after a flag, reset on layer advance
    pub round: u32,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,

    /// Proof-of-intelligence hash, set when the pipeline completes
    pub output_hash: Option<String>,

    /// On-chain transaction reference, set if the registry commit succeeds
    pub commit_tx: Option<String>,
}

impl PipelineState {
    /// Create a new active pipeline at layer 0, work phase
    pub fn new(claim_id: ClaimId, protocol_id: ProtocolId) -> Self {
        let now = Utc::now();
        Self {
            claim_id,
            protocol_id,
            domain: None,
            current_layer: 0,
            phase: PipelinePhase::Work,
            status: PipelineStatus::Active,
            round: 0,
            created_at: now,
            updated_at: now,
            output_hash: None,
            commit_tx: None,
        }
    }

    /// Set the claim's domain tag
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Touch the pipeline to update last mutation time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One assignable unit of work or consensus review within a layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSlot {
    /// Slot id; equals the storage key, sorts in creation order
    pub id: SlotId,

    /// Claim under deliberation
    pub claim_id: ClaimId,

    /// Protocol governing this slot's layer
    pub protocol_id: ProtocolId,

    /// Layer index within the protocol
    pub layer: u32,

    /// Retry round this slot belongs to
    pub round: u32,

    /// Work or consensus
    pub slot_type: SlotType,

    /// Required worker role ("consensus" for consensus slots)
    pub role: String,

    /// Domain tag inherited from the pipeline, used for slot matching
    pub domain: Option<String>,

    /// Lifecycle status
    pub status: SlotStatus,

    /// Agent currently holding or having completed the slot
    pub agent: Option<AgentId>,

    /// Submitted free-text output
    pub output: Option<String>,

    /// Optional structured payload, interpreted per role
    pub structured_output: Option<serde_json::Value>,

    /// Confidence score; required for consensus slots
    pub confidence: Option<f32>,

    /// Optional cryptographic signature over the output
    pub signature: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// When the slot was taken
    pub taken_at: Option<DateTime<Utc>>,

    /// When the slot was completed
    pub done_at: Option<DateTime<Utc>>,
}

impl StageSlot {
    /// Create a new open slot
    pub fn new(
        id: SlotId,
        claim_id: ClaimId,
        protocol_id: ProtocolId,
        layer: u32,
        round: u32,
        slot_type: SlotType,
        role: impl Into<String>,
    ) -> Self {
        Self {
            id,
            claim_id,
            protocol_id,
            layer,
            round,
            slot_type,
            role: role.into(),
            domain: None,
            status: SlotStatus::Open,
            agent: None,
            output: None,
            structured_output: None,
            confidence: None,
            signature: None,
            created_at: Utc::now(),
            taken_at: None,
            done_at: None,
        }
    }

    /// Set the inherited domain tag
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Whether the slot has been completed
    pub fn is_done(&self) -> bool {
        self.status == SlotStatus::Done
    }

    /// Whether the slot is still claimable
    pub fn is_open(&self) -> bool {
        self.status == SlotStatus::Open
    }
}

/// Record of a layer failing to clear its consensus threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flag {
    /// Unique flag id
    pub id: String,

    /// Claim whose layer failed
    pub claim_id: ClaimId,

    /// Layer that failed consensus
    pub layer: u32,

    /// Retry round that failed
    pub round: u32,

    /// Human-readable reason
    pub reason: String,

    /// Computed average confidence across consensus slots
    pub average_confidence: f32,

    /// Threshold the average failed to clear
    pub threshold: f32,

    /// Flag timestamp
    pub created_at: DateTime<Utc>,
}

impl Flag {
    /// Create a new consensus-failure flag
    pub fn consensus_failure(
        claim_id: ClaimId,
        layer: u32,
        round: u32,
        average_confidence: f32,
        threshold: f32,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            claim_id,
            layer,
            round,
            reason: format!(
                "layer {} consensus averaged {:.3}, below threshold {:.3}",
                layer, average_confidence, threshold
            ),
            average_confidence,
            threshold,
            created_at: Utc::now(),
        }
    }
}

/// Why a reward was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardReason {
    /// Completed a work slot
    WorkSlot,
    /// Completed a consensus slot
    ConsensusSlot,
    /// Contributed work to a layer that passed consensus
    LayerBonus,
    /// Contributed work to a pipeline that completed
    PipelineBonus,
}

impl std::fmt::Display for RewardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewardReason::WorkSlot => write!(f, "work_slot"),
            RewardReason::ConsensusSlot => write!(f, "consensus_slot"),
            RewardReason::LayerBonus => write!(f, "layer_bonus"),
            RewardReason::PipelineBonus => write!(f, "pipeline_bonus"),
        }
    }
}

/// Immutable reward ledger entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardEntry {
    /// Agent credited
    pub agent: AgentId,

    /// Why the reward was issued
    pub reason: RewardReason,

    /// Token amount credited
    pub amount: u64,

    /// Claim the reward relates to
    pub claim_id: ClaimId,

    /// Slot that triggered the reward, for slot-level rewards
    pub slot_id: Option<SlotId>,

    /// Layer the reward relates to, for layer bonuses
    pub layer: Option<u32>,

    /// Entry timestamp
    pub created_at: DateTime<Utc>,
}

impl RewardEntry {
    /// Reward for completing a single slot
    pub fn for_slot(agent: AgentId, reason: RewardReason, amount: u64, slot: &StageSlot) -> Self {
        Self {
            agent,
            reason,
            amount,
            claim_id: slot.claim_id.clone(),
            slot_id: Some(slot.id.clone()),
            layer: Some(slot.layer),
            created_at: Utc::now(),
        }
    }

    /// Layer-pass bonus for one contributing agent
    pub fn layer_bonus(agent: AgentId, amount: u64, claim_id: ClaimId, layer: u32) -> Self {
        Self {
            agent,
            reason: RewardReason::LayerBonus,
            amount,
            claim_id,
            slot_id: None,
            layer: Some(layer),
            created_at: Utc::now(),
        }
    }

    /// Pipeline-completion bonus for one contributing agent
    pub fn pipeline_bonus(agent: AgentId, amount: u64, claim_id: ClaimId) -> Self {
        Self {
            agent,
            reason: RewardReason::PipelineBonus,
            amount,
            claim_id,
            slot_id: None,
            layer: None,
            created_at: Utc::now(),
        }
    }

    /// Dedup scope identifying the qualifying event
    ///
    /// The ledger inserts at most one entry per (agent, scope), which is
    /// what makes layer and pipeline bonuses exactly-once per identity.
    pub fn dedup_scope(&self) -> String {
        match self.reason {
            RewardReason::WorkSlot | RewardReason::ConsensusSlot => {
                format!("slot:{}", self.slot_id.as_deref().unwrap_or(""))
            }
            RewardReason::LayerBonus => {
                format!("layer:{}:{:04}", self.claim_id, self.layer.unwrap_or(0))
            }
            RewardReason::PipelineBonus => format!("pipeline:{}", self.claim_id),
        }
    }
}
