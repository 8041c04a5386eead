//! Event types for pipeline coordination
//!
//! These events drive the pub/sub system and are persisted for the audit
//! trail and replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{AgentId, ClaimId, ProtocolId, RewardReason, SlotId, SlotType};

/// Unique identifier for events
pub type EventId = String;

/// All pipeline coordination events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A claim entered the pipeline
    PipelineAttached {
        claim_id: ClaimId,
        protocol_id: ProtocolId,
        timestamp: DateTime<Utc>,
    },

    /// A phase's slot set was created
    SlotsOpened {
        claim_id: ClaimId,
        layer: u32,
        round: u32,
        slot_type: SlotType,
        count: u32,
        timestamp: DateTime<Utc>,
    },

    /// An agent claimed exclusive hold of a slot
    SlotTaken {
        slot_id: SlotId,
        claim_id: ClaimId,
        agent: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// An agent submitted output for a slot it held
    SlotCompleted {
        slot_id: SlotId,
        claim_id: ClaimId,
        agent: AgentId,
        slot_type: SlotType,
        confidence: Option<f32>,
        timestamp: DateTime<Utc>,
    },

    /// A silent holder's expired slot was returned to the pool
    SlotReclaimed {
        slot_id: SlotId,
        claim_id: ClaimId,
        agent: AgentId,
        timestamp: DateTime<Utc>,
    },

    /// A layer's consensus reviews were aggregated
    ConsensusEvaluated {
        claim_id: ClaimId,
        layer: u32,
        round: u32,
        average: f32,
        threshold: f32,
        passed: bool,
        reviews: u32,
        timestamp: DateTime<Utc>,
    },

    /// A layer cleared its consensus threshold
    LayerPassed {
        claim_id: ClaimId,
        layer: u32,
        timestamp: DateTime<Utc>,
    },

    /// A layer failed consensus; the pipeline halted flagged
    LayerFlagged {
        claim_id: ClaimId,
        layer: u32,
        round: u32,
        average: f32,
        threshold: f32,
        timestamp: DateTime<Utc>,
    },

    /// A flagged layer was administratively reopened for another round
    LayerReopened {
        claim_id: ClaimId,
        layer: u32,
        round: u32,
        timestamp: DateTime<Utc>,
    },

    /// Every layer passed; the pipeline is terminal
    PipelineCompleted {
        claim_id: ClaimId,
        output_hash: String,
        agent_count: u32,
        layer_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A reward was credited to an agent's ledger
    RewardIssued {
        agent: AgentId,
        reason: RewardReason,
        amount: u64,
        claim_id: ClaimId,
        timestamp: DateTime<Utc>,
    },

    /// The proof-of-intelligence hash was sent to the on-chain registry
    CommitRequested {
        claim_id: ClaimId,
        output_hash: String,
        timestamp: DateTime<Utc>,
    },

    /// The registry acknowledged the commit with a transaction reference
    CommitConfirmed {
        claim_id: ClaimId,
        tx_ref: String,
        timestamp: DateTime<Utc>,
    },

    /// The registry call failed or was not configured; commit skipped
    CommitDeferred {
        claim_id: ClaimId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    /// Generate a new event id
    pub fn new_id() -> EventId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Short name of the event variant, for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::PipelineAttached { .. } => "pipeline_attached",
            PipelineEvent::SlotsOpened { .. } => "slots_opened",
            PipelineEvent::SlotTaken { .. } => "slot_taken",
            PipelineEvent::SlotCompleted { .. } => "slot_completed",
            PipelineEvent::SlotReclaimed { .. } => "slot_reclaimed",
            PipelineEvent::ConsensusEvaluated { .. } => "consensus_evaluated",
            PipelineEvent::LayerPassed { .. } => "layer_passed",
            PipelineEvent::LayerFlagged { .. } => "layer_flagged",
            PipelineEvent::LayerReopened { .. } => "layer_reopened",
            PipelineEvent::PipelineCompleted { .. } => "pipeline_completed",
            PipelineEvent::RewardIssued { .. } => "reward_issued",
            PipelineEvent::CommitRequested { .. } => "commit_requested",
            PipelineEvent::CommitConfirmed { .. } => "commit_confirmed",
            PipelineEvent::CommitDeferred { .. } => "commit_deferred",
        }
    }

    /// Timestamp of the event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PipelineEvent::PipelineAttached { timestamp, .. }
            | PipelineEvent::SlotsOpened { timestamp, .. }
            | PipelineEvent::SlotTaken { timestamp, .. }
            | PipelineEvent::SlotCompleted { timestamp, .. }
            | PipelineEvent::SlotReclaimed { timestamp, .. }
            | PipelineEvent::ConsensusEvaluated { timestamp, .. }
            | PipelineEvent::LayerPassed { timestamp, .. }
            | PipelineEvent::LayerFlagged { timestamp, .. }
            | PipelineEvent::LayerReopened { timestamp, .. }
            | PipelineEvent::PipelineCompleted { timestamp, .. }
            | PipelineEvent::RewardIssued { timestamp, .. }
            | PipelineEvent::CommitRequested { timestamp, .. }
            | PipelineEvent::CommitConfirmed { timestamp, .. }
            | PipelineEvent::CommitDeferred { timestamp, .. } => *timestamp,
        }
    }

    /// Claim the event relates to
    pub fn claim_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::PipelineAttached { claim_id, .. }
            | PipelineEvent::SlotsOpened { claim_id, .. }
            | PipelineEvent::SlotTaken { claim_id, .. }
            | PipelineEvent::SlotCompleted { claim_id, .. }
            | PipelineEvent::SlotReclaimed { claim_id, .. }
            | PipelineEvent::ConsensusEvaluated { claim_id, .. }
            | PipelineEvent::LayerPassed { claim_id, .. }
            | PipelineEvent::LayerFlagged { claim_id, .. }
            | PipelineEvent::LayerReopened { claim_id, .. }
            | PipelineEvent::PipelineCompleted { claim_id, .. }
            | PipelineEvent::RewardIssued { claim_id, .. }
            | PipelineEvent::CommitRequested { claim_id, .. }
            | PipelineEvent::CommitConfirmed { claim_id, .. }
            | PipelineEvent::CommitDeferred { claim_id, .. } => Some(claim_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_names() {
        let event = PipelineEvent::LayerFlagged {
            claim_id: "claim-1".into(),
            layer: 1,
            round: 0,
            average: 0.6,
            threshold: 0.7,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "layer_flagged");
        assert_eq!(event.claim_id(), Some("claim-1"));
    }

    #[test]
    fn test_event_serde_roundtrip_tagging() {
        let event = PipelineEvent::SlotTaken {
            slot_id: "slot:c:0000:00:0:00".into(),
            claim_id: "c".into(),
            agent: "agent-a".into(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "slot_taken");
    }
}
