//! Layer advancement - the pipeline's phase state machine
//!
//! Every slot submission funnels through `advance`. The function is
//! deliberately safe to call concurrently and redundantly: it reads the
//! phase's slot set, and only if every slot is done does it attempt the
//! compare-and-set transition on the pipeline record. Racing callers all
//! observe the full slot set, but exactly one wins the CAS and performs
//! the transition's side effects (opening slots, paying bonuses,
//! requesting the proof-of-intelligence commit); the rest see a stale
//! no-op.

use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::events::{PipelineEvent, SharedEventBus};
use crate::state::{
    Flag, PipelinePhase, PipelineState, PipelineStatus, SharedStateStore, StageSlot,
};

use super::allocator::SlotAllocator;
use super::consensus::{self, ConsensusOutcome};
use super::poi::{self, PoiDigest, RegistryClient, RegistryError};
use super::rewards::RewardsLedger;
use super::{EngineError, EngineResult};

/// What an advancement attempt did
#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceOutcome {
    /// The current phase still has unfinished slots
    Pending,
    /// Another caller already performed this transition
    Stale,
    /// Work phase finished; consensus review slots were opened
    ConsensusOpened { layer: u32 },
    /// Consensus passed; the next layer's work slots were opened
    LayerPassed { layer: u32, next_layer: u32 },
    /// The final layer passed; the pipeline is terminal
    Completed { output_hash: String },
    /// Consensus failed; the pipeline halted flagged
    Flagged {
        layer: u32,
        average: f32,
        threshold: f32,
    },
}

/// Drives phase and layer transitions for pipelines
pub struct AdvancementEngine {
    store: SharedStateStore,
    bus: SharedEventBus,
    config: EngineConfig,
    allocator: SlotAllocator,
}

impl AdvancementEngine {
    /// Create a new advancement engine
    pub fn new(store: SharedStateStore, bus: SharedEventBus, config: EngineConfig) -> Self {
        let allocator = SlotAllocator::new(store.clone(), bus.clone(), config.clone());
        Self {
            store,
            bus,
            config,
            allocator,
        }
    }

    /// Attempt to advance a claim's pipeline past its current phase
    pub async fn advance(
        &self,
        claim_id: &str,
        ledger: &dyn RewardsLedger,
        registry: &Arc<dyn RegistryClient>,
    ) -> EngineResult<AdvanceOutcome> {
        let pipeline = self
            .store
            .get_pipeline(claim_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pipeline: {}", claim_id)))?;

        if pipeline.status != PipelineStatus::Active {
            return Ok(AdvanceOutcome::Stale);
        }

        let protocol = self
            .store
            .get_protocol(&pipeline.protocol_id)?
            .ok_or_else(|| EngineError::NotFound(format!("protocol: {}", pipeline.protocol_id)))?;
        let layer = protocol.layer(pipeline.current_layer).ok_or_else(|| {
            EngineError::Store(format!(
                "pipeline for claim {} points at missing layer {}",
                claim_id, pipeline.current_layer
            ))
        })?;

        let slots = self.store.phase_slots(
            claim_id,
            pipeline.current_layer,
            pipeline.round,
            pipeline.phase.slot_type(),
        )?;
        let expected = match pipeline.phase {
            PipelinePhase::Work => layer.work_slot_count(),
            PipelinePhase::Consensus => layer.consensus_count,
        };
        if (slots.len() as u32) < expected || !slots.iter().all(StageSlot::is_done) {
            debug!(
                claim_id,
                layer = layer.index,
                phase = %pipeline.phase,
                done = slots.iter().filter(|s| s.is_done()).count(),
                expected,
                "Phase not yet complete"
            );
            return Ok(AdvanceOutcome::Pending);
        }

        match pipeline.phase {
            PipelinePhase::Work => {
                if layer.consensus_count == 0 {
                    // No reviewers for this layer: a vacuous pass straight
                    // out of the work phase.
                    let outcome = consensus::evaluate(&[], layer.consensus_threshold);
                    self.publish_consensus(&pipeline, &outcome);
                    self.pass_layer(&pipeline, &protocol, PipelinePhase::Work, ledger, registry)
                        .await
                } else {
                    self.open_consensus(&pipeline, &protocol).await
                }
            }
            PipelinePhase::Consensus => {
                let outcome = consensus::evaluate(&slots, layer.consensus_threshold);
                self.publish_consensus(&pipeline, &outcome);
                if outcome.passed {
                    self.pass_layer(
                        &pipeline,
                        &protocol,
                        PipelinePhase::Consensus,
                        ledger,
                        registry,
                    )
                    .await
                } else {
                    self.flag_layer(&pipeline, &outcome)
                }
            }
        }
    }

    /// Work phase done: flip to consensus and open review slots
    async fn open_consensus(
        &self,
        pipeline: &PipelineState,
        protocol: &crate::protocol::Protocol,
    ) -> EngineResult<AdvanceOutcome> {
        let updated = match self.store.update_pipeline_if(
            &pipeline.claim_id,
            pipeline.current_layer,
            PipelinePhase::Work,
            |p| p.phase = PipelinePhase::Consensus,
        )? {
            Some(updated) => updated,
            None => return Ok(AdvanceOutcome::Stale),
        };

        self.allocator.open_consensus_layer(&updated, protocol)?;
        info!(
            claim_id = %updated.claim_id,
            layer = updated.current_layer,
            "Work phase complete, consensus opened"
        );
        Ok(AdvanceOutcome::ConsensusOpened {
            layer: updated.current_layer,
        })
    }

    /// Consensus (or a zero-reviewer work phase) passed: advance the layer
    async fn pass_layer(
        &self,
        pipeline: &PipelineState,
        protocol: &crate::protocol::Protocol,
        expected_phase: PipelinePhase,
        ledger: &dyn RewardsLedger,
        registry: &Arc<dyn RegistryClient>,
    ) -> EngineResult<AdvanceOutcome> {
        let claim_id = &pipeline.claim_id;
        let layer = pipeline.current_layer;

        if protocol.is_last_layer(layer) {
            // Digest before the CAS so the winner stores the hash in the
            // same pipeline write that marks completion.
            let digest = poi::digest_outputs(&self.store.claim_slots(claim_id)?);

            if self
                .store
                .update_pipeline_if(claim_id, layer, expected_phase, |p| {
                    p.status = PipelineStatus::Complete;
                    p.output_hash = Some(digest.output_hash.clone());
                })?
                .is_none()
            {
                return Ok(AdvanceOutcome::Stale);
            }

            self.publish_layer_passed(claim_id, layer);
            self.award_layer_bonus(pipeline, ledger).await;

            info!(
                claim_id,
                output_hash = %digest.output_hash,
                agents = digest.agent_count,
                layers = digest.layer_count,
                "Pipeline completed"
            );
            let _ = self.bus.publish(PipelineEvent::PipelineCompleted {
                claim_id: claim_id.clone(),
                output_hash: digest.output_hash.clone(),
                agent_count: digest.agent_count,
                layer_count: digest.layer_count,
                timestamp: Utc::now(),
            });
            self.award_pipeline_bonus(claim_id, ledger).await;
            self.spawn_commit(claim_id, &digest, registry);

            Ok(AdvanceOutcome::Completed {
                output_hash: digest.output_hash,
            })
        } else {
            let updated = match self.store.update_pipeline_if(
                claim_id,
                layer,
                expected_phase,
                |p| {
                    p.current_layer += 1;
                    p.phase = PipelinePhase::Work;
                    p.round = 0;
                },
            )? {
                Some(updated) => updated,
                None => return Ok(AdvanceOutcome::Stale),
            };

            self.publish_layer_passed(claim_id, layer);
            self.award_layer_bonus(pipeline, ledger).await;
            self.allocator.open_work_layer(&updated, protocol)?;

            info!(claim_id, layer, next_layer = updated.current_layer, "Layer passed");
            Ok(AdvanceOutcome::LayerPassed {
                layer,
                next_layer: updated.current_layer,
            })
        }
    }

    /// Consensus failed: halt the pipeline and record a flag
    fn flag_layer(
        &self,
        pipeline: &PipelineState,
        outcome: &ConsensusOutcome,
    ) -> EngineResult<AdvanceOutcome> {
        let claim_id = &pipeline.claim_id;
        let layer = pipeline.current_layer;

        if self
            .store
            .update_pipeline_if(claim_id, layer, PipelinePhase::Consensus, |p| {
                p.status = PipelineStatus::Flagged;
            })?
            .is_none()
        {
            return Ok(AdvanceOutcome::Stale);
        }

        let flag = Flag::consensus_failure(
            claim_id.clone(),
            layer,
            pipeline.round,
            outcome.average,
            outcome.threshold,
        );
        self.store.put_flag(&flag)?;

        warn!(
            claim_id,
            layer,
            round = pipeline.round,
            average = outcome.average,
            threshold = outcome.threshold,
            "Layer failed consensus, pipeline flagged"
        );
        let _ = self.bus.publish(PipelineEvent::LayerFlagged {
            claim_id: claim_id.clone(),
            layer,
            round: pipeline.round,
            average: outcome.average,
            threshold: outcome.threshold,
            timestamp: Utc::now(),
        });

        Ok(AdvanceOutcome::Flagged {
            layer,
            average: outcome.average,
            threshold: outcome.threshold,
        })
    }

    fn publish_consensus(&self, pipeline: &PipelineState, outcome: &ConsensusOutcome) {
        info!(
            claim_id = %pipeline.claim_id,
            layer = pipeline.current_layer,
            average = outcome.average,
            threshold = outcome.threshold,
            passed = outcome.passed,
            reviews = outcome.reviews,
            "Consensus evaluated"
        );
        let _ = self.bus.publish(PipelineEvent::ConsensusEvaluated {
            claim_id: pipeline.claim_id.clone(),
            layer: pipeline.current_layer,
            round: pipeline.round,
            average: outcome.average,
            threshold: outcome.threshold,
            passed: outcome.passed,
            reviews: outcome.reviews as u32,
            timestamp: Utc::now(),
        });
    }

    fn publish_layer_passed(&self, claim_id: &str, layer: u32) {
        let _ = self.bus.publish(PipelineEvent::LayerPassed {
            claim_id: claim_id.to_string(),
            layer,
            timestamp: Utc::now(),
        });
    }

    /// Pay the layer bonus to this round's distinct work contributors
    ///
    /// The ledger deduplicates per (agent, claim, layer), so a retried
    /// round never pays the same agent twice for one layer. Ledger errors
    /// are logged, not propagated: the transition has already happened.
    async fn award_layer_bonus(&self, pipeline: &PipelineState, ledger: &dyn RewardsLedger) {
        let work_slots = match self.store.phase_slots(
            &pipeline.claim_id,
            pipeline.current_layer,
            pipeline.round,
            PipelinePhase::Work.slot_type(),
        ) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(claim_id = %pipeline.claim_id, error = %e, "Layer bonus slot lookup failed");
                return;
            }
        };

        let agents: BTreeSet<String> = work_slots
            .iter()
            .filter(|s| s.is_done())
            .filter_map(|s| s.agent.clone())
            .collect();

        for agent in agents {
            if let Err(e) = ledger
                .award_layer_bonus(
                    &agent,
                    &pipeline.claim_id,
                    pipeline.current_layer,
                    self.config.layer_bonus,
                )
                .await
            {
                warn!(agent = %agent, error = %e, "Layer bonus credit failed");
            }
        }
    }

    /// Pay the completion bonus to every distinct work contributor
    async fn award_pipeline_bonus(&self, claim_id: &str, ledger: &dyn RewardsLedger) {
        let slots = match self.store.claim_slots(claim_id) {
            Ok(slots) => slots,
            Err(e) => {
                warn!(claim_id, error = %e, "Pipeline bonus slot lookup failed");
                return;
            }
        };

        let agents: BTreeSet<String> = slots
            .iter()
            .filter(|s| s.is_done() && s.slot_type == PipelinePhase::Work.slot_type())
            .filter_map(|s| s.agent.clone())
            .collect();

        for agent in agents {
            if let Err(e) = ledger
                .award_pipeline_bonus(&agent, claim_id, self.config.pipeline_bonus)
                .await
            {
                warn!(agent = %agent, error = %e, "Pipeline bonus credit failed");
            }
        }
    }

    /// Best-effort registry commit of the proof-of-intelligence digest
    ///
    /// The chain call runs on a spawned task, so the submission that
    /// completed the pipeline never waits on the registry. Commit failure
    /// never un-completes the pipeline; the stored hash allows retrying or
    /// auditing out of band.
    fn spawn_commit(
        &self,
        claim_id: &str,
        digest: &PoiDigest,
        registry: &Arc<dyn RegistryClient>,
    ) {
        let _ = self.bus.publish(PipelineEvent::CommitRequested {
            claim_id: claim_id.to_string(),
            output_hash: digest.output_hash.clone(),
            timestamp: Utc::now(),
        });

        let store = self.store.clone();
        let bus = self.bus.clone();
        let registry = registry.clone();
        let claim_id = claim_id.to_string();
        let digest = digest.clone();
        tokio::spawn(async move {
            match registry.commit_pipeline_hash(&claim_id, &digest).await {
                Ok(tx_ref) => {
                    if let Err(e) = store.set_commit_tx(&claim_id, &tx_ref) {
                        warn!(claim_id = %claim_id, tx_ref = %tx_ref, error = %e, "Commit tx backfill failed");
                    }
                    info!(claim_id = %claim_id, tx_ref = %tx_ref, "Proof-of-intelligence committed");
                    let _ = bus.publish(PipelineEvent::CommitConfirmed {
                        claim_id,
                        tx_ref,
                        timestamp: Utc::now(),
                    });
                }
                Err(RegistryError::NotConfigured) => {
                    info!(claim_id = %claim_id, "Registry not configured, commit deferred");
                    let _ = bus.publish(PipelineEvent::CommitDeferred {
                        claim_id,
                        reason: "registry not configured".to_string(),
                        timestamp: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!(claim_id = %claim_id, error = %e, "Registry commit failed, deferred");
                    let _ = bus.publish(PipelineEvent::CommitDeferred {
                        claim_id,
                        reason: e.to_string(),
                        timestamp: Utc::now(),
                    });
                }
            }
        });
    }
}
