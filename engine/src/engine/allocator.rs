//! Slot allocation - exclusive hand-out of stage slots to racing agents
//!
//! Creates the slot sets for a phase (all at once, double-open guarded)
//! and mediates the open->taken->done lifecycle. Exclusivity is the central
//! correctness property here: `take` goes through the store's atomic
//! check-and-flip, so of all agents racing on one slot at most one wins
//! and the rest see a conflict they can retry against a different slot.

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::events::{PipelineEvent, SharedEventBus};
use crate::protocol::Protocol;
use crate::state::{
    schema, AgentId, PipelineState, SharedStateStore, SlotId, SlotType, StageSlot, StoreError,
};

use super::{EngineError, EngineResult};

/// Filters for open-slot matching
///
/// All fields are optional; the allocator returns the oldest-created open
/// slot consistent with every set filter. Matching is a suggestion only -
/// it never reserves.
#[derive(Debug, Clone, Default)]
pub struct SlotFilter {
    /// Restrict to one claim
    pub claim_id: Option<String>,
    /// Restrict to one layer index
    pub layer: Option<u32>,
    /// Restrict to one role name
    pub role: Option<String>,
    /// Restrict to claims tagged with this domain
    pub domain: Option<String>,
}

/// An agent's submission for a slot it holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotSubmission {
    /// Free-text reasoning output; must be non-empty
    pub output: String,
    /// Confidence in [0, 1]; required for consensus slots
    pub confidence: Option<f32>,
    /// Optional structured payload, interpreted per role
    pub structured_output: Option<serde_json::Value>,
    /// Optional signature over the output
    pub signature: Option<String>,
}

impl SlotSubmission {
    /// Plain text submission
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            confidence: None,
            structured_output: None,
            signature: None,
        }
    }

    /// Set the confidence score
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Set the structured payload
    pub fn with_structured(mut self, payload: serde_json::Value) -> Self {
        self.structured_output = Some(payload);
        self
    }
}

/// Prior and in-progress outputs handed to an agent with a slot offer
///
/// Lets the agent reason with the claim's deliberation history: what
/// earlier layers concluded, and what the current layer has produced so
/// far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkContext {
    /// Done outputs from layers before the current one
    pub prior_outputs: Vec<ContextEntry>,
    /// Done outputs from the current layer
    pub current_outputs: Vec<ContextEntry>,
}

/// One completed output in a work context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEntry {
    pub slot_id: SlotId,
    pub layer: u32,
    pub role: String,
    pub slot_type: SlotType,
    pub output: String,
    pub confidence: Option<f32>,
}

impl ContextEntry {
    fn from_slot(slot: &StageSlot) -> Option<Self> {
        Some(Self {
            slot_id: slot.id.clone(),
            layer: slot.layer,
            role: slot.role.clone(),
            slot_type: slot.slot_type,
            output: slot.output.clone()?,
            confidence: slot.confidence,
        })
    }
}

/// Hands out exclusive slot ownership and records submissions
pub struct SlotAllocator {
    store: SharedStateStore,
    bus: SharedEventBus,
    config: EngineConfig,
}

impl SlotAllocator {
    /// Create a new allocator
    pub fn new(store: SharedStateStore, bus: SharedEventBus, config: EngineConfig) -> Self {
        Self { store, bus, config }
    }

    /// Open the work slot set for the pipeline's current layer and round
    ///
    /// One slot per required role instance, all `open`, created in a
    /// single batch so agents never observe a partial layer.
    pub fn open_work_layer(
        &self,
        pipeline: &PipelineState,
        protocol: &Protocol,
    ) -> EngineResult<Vec<StageSlot>> {
        let layer = protocol.layer(pipeline.current_layer).ok_or_else(|| {
            EngineError::Store(format!(
                "protocol {} has no layer {}",
                protocol.id, pipeline.current_layer
            ))
        })?;

        let slots: Vec<StageSlot> = layer
            .role_instances()
            .into_iter()
            .enumerate()
            .map(|(idx, role)| {
                let id = schema::keys::slot(
                    &pipeline.claim_id,
                    layer.index,
                    pipeline.round,
                    SlotType::Work,
                    idx as u32,
                );
                StageSlot::new(
                    id,
                    pipeline.claim_id.clone(),
                    protocol.id.clone(),
                    layer.index,
                    pipeline.round,
                    SlotType::Work,
                    role,
                )
                .with_domain(pipeline.domain.clone())
            })
            .collect();

        self.store.create_slots(
            &pipeline.claim_id,
            layer.index,
            pipeline.round,
            SlotType::Work,
            &slots,
        )?;

        info!(
            claim_id = %pipeline.claim_id,
            layer = layer.index,
            round = pipeline.round,
            count = slots.len(),
            "Work slots opened"
        );
        let _ = self.bus.publish(PipelineEvent::SlotsOpened {
            claim_id: pipeline.claim_id.clone(),
            layer: layer.index,
            round: pipeline.round,
            slot_type: SlotType::Work,
            count: slots.len() as u32,
            timestamp: Utc::now(),
        });

        Ok(slots)
    }

    /// Open the consensus slot set for the pipeline's current layer
    pub fn open_consensus_layer(
        &self,
        pipeline: &PipelineState,
        protocol: &Protocol,
    ) -> EngineResult<Vec<StageSlot>> {
        let layer = protocol.layer(pipeline.current_layer).ok_or_else(|| {
            EngineError::Store(format!(
                "protocol {} has no layer {}",
                protocol.id, pipeline.current_layer
            ))
        })?;

        let slots: Vec<StageSlot> = (0..layer.consensus_count)
            .map(|idx| {
                let id = schema::keys::slot(
                    &pipeline.claim_id,
                    layer.index,
                    pipeline.round,
                    SlotType::Consensus,
                    idx,
                );
                StageSlot::new(
                    id,
                    pipeline.claim_id.clone(),
                    protocol.id.clone(),
                    layer.index,
                    pipeline.round,
                    SlotType::Consensus,
                    "consensus",
                )
                .with_domain(pipeline.domain.clone())
            })
            .collect();

        self.store.create_slots(
            &pipeline.claim_id,
            layer.index,
            pipeline.round,
            SlotType::Consensus,
            &slots,
        )?;

        info!(
            claim_id = %pipeline.claim_id,
            layer = layer.index,
            count = slots.len(),
            "Consensus slots opened"
        );
        let _ = self.bus.publish(PipelineEvent::SlotsOpened {
            claim_id: pipeline.claim_id.clone(),
            layer: layer.index,
            round: pipeline.round,
            slot_type: SlotType::Consensus,
            count: slots.len() as u32,
            timestamp: Utc::now(),
        });

        Ok(slots)
    }

    /// Find the oldest open slot matching the filters, without reserving it
    pub fn find_open_slot(&self, filter: &SlotFilter) -> EngineResult<Option<StageSlot>> {
        let slots = match &filter.claim_id {
            Some(claim_id) => self.store.claim_slots(claim_id)?,
            None => self.store.all_slots()?,
        };

        let mut candidates: Vec<StageSlot> = slots
            .into_iter()
            .filter(|s| s.is_open())
            .filter(|s| filter.layer.map_or(true, |l| s.layer == l))
            .filter(|s| filter.role.as_deref().map_or(true, |r| s.role == r))
            .filter(|s| {
                filter
                    .domain
                    .as_deref()
                    .map_or(true, |d| s.domain.as_deref() == Some(d))
            })
            .collect();

        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(candidates.into_iter().next())
    }

    /// Atomically take a slot for an agent
    ///
    /// Staking precondition: the agent's balance must cover the per-slot
    /// stake. Losing the race surfaces as `SlotConflict`; the caller
    /// should re-fetch and try another slot.
    pub fn take(&self, slot_id: &str, agent: &AgentId) -> EngineResult<StageSlot> {
        let slot = self
            .store
            .take_slot(slot_id, agent, self.config.stake_per_slot)?;

        debug!(slot_id, agent = %agent, "Slot taken");
        let _ = self.bus.publish(PipelineEvent::SlotTaken {
            slot_id: slot.id.clone(),
            claim_id: slot.claim_id.clone(),
            agent: agent.clone(),
            timestamp: Utc::now(),
        });

        Ok(slot)
    }

    /// Record a submission for a slot the agent holds
    ///
    /// Validates output and confidence before touching the store; the
    /// store then re-checks status and ownership under the write lock.
    pub fn submit(
        &self,
        slot_id: &str,
        agent: &AgentId,
        submission: &SlotSubmission,
    ) -> EngineResult<StageSlot> {
        if submission.output.trim().is_empty() {
            return Err(EngineError::InvalidSubmission(
                "output must not be empty".to_string(),
            ));
        }
        if let Some(confidence) = submission.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(EngineError::InvalidSubmission(format!(
                    "confidence {} outside [0, 1]",
                    confidence
                )));
            }
        }

        let slot = self
            .store
            .get_slot(slot_id)?
            .ok_or_else(|| EngineError::NotFound(format!("slot: {}", slot_id)))?;

        if slot.slot_type == SlotType::Consensus && submission.confidence.is_none() {
            return Err(EngineError::InvalidSubmission(
                "consensus slots require a confidence score".to_string(),
            ));
        }

        let done = self
            .store
            .complete_slot(
                slot_id,
                agent,
                &submission.output,
                submission.confidence,
                submission.structured_output.clone(),
                submission.signature.clone(),
            )
            .map_err(|e| match e {
                // Submitting for a slot you don't hold (or that isn't
                // held at all) is an invalid submission, not a take race.
                StoreError::Ownership(msg) | StoreError::Conflict(msg) => {
                    EngineError::InvalidSubmission(msg)
                }
                other => EngineError::from(other),
            })?;

        info!(
            slot_id,
            agent = %agent,
            claim_id = %done.claim_id,
            slot_type = %done.slot_type,
            "Slot completed"
        );
        let _ = self.bus.publish(PipelineEvent::SlotCompleted {
            slot_id: done.id.clone(),
            claim_id: done.claim_id.clone(),
            agent: agent.clone(),
            slot_type: done.slot_type,
            confidence: done.confidence,
            timestamp: Utc::now(),
        });

        Ok(done)
    }

    /// Assemble the deliberation history for a claim
    pub fn build_context(&self, pipeline: &PipelineState) -> EngineResult<WorkContext> {
        let slots = self.store.claim_slots(&pipeline.claim_id)?;
        let mut context = WorkContext::default();

        for slot in slots.iter().filter(|s| s.is_done()) {
            if let Some(entry) = ContextEntry::from_slot(slot) {
                if slot.layer < pipeline.current_layer {
                    context.prior_outputs.push(entry);
                } else if slot.layer == pipeline.current_layer {
                    context.current_outputs.push(entry);
                }
            }
        }
        Ok(context)
    }

    /// Return expired `taken` slots to the open pool
    ///
    /// A holder that never submits would otherwise park the slot forever;
    /// operators invoke this with the configured TTL.
    pub fn reclaim_expired(&self) -> EngineResult<Vec<StageSlot>> {
        let cutoff = Utc::now() - Duration::seconds(self.config.taken_ttl_secs);
        let reclaimed = self.store.reclaim_taken_before(cutoff)?;

        for slot in &reclaimed {
            info!(
                slot_id = %slot.id,
                agent = ?slot.agent,
                "Expired slot reclaimed"
            );
            let _ = self.bus.publish(PipelineEvent::SlotReclaimed {
                slot_id: slot.id.clone(),
                claim_id: slot.claim_id.clone(),
                agent: slot.agent.clone().unwrap_or_default(),
                timestamp: Utc::now(),
            });
        }
        Ok(reclaimed)
    }
}
