//! Reward triggering - the Rewards Ledger collaborator seam
//!
//! Three reward events fire from the state machine: slot completion,
//! layer pass, and pipeline completion. Each writes an immutable ledger
//! entry and credits the agent's balance, exactly once per qualifying
//! (agent, event, scope) identity. Ledger failures must never fail the
//! submission that triggered them; the engine logs and continues.

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::events::{PipelineEvent, SharedEventBus};
use crate::state::{AgentId, RewardEntry, RewardReason, SharedStateStore, StageSlot};

/// Error type for ledger operations
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

/// Result type for ledger operations
pub type LedgerResult<T> = Result<T, LedgerError>;

/// External-collaborator seam for the rewards ledger
///
/// Contract: idempotent by identity and event - the same qualifying
/// (agent, event, scope) tuple is credited at most once; amounts are
/// never negative and never re-applied.
#[async_trait]
pub trait RewardsLedger: Send + Sync {
    /// Credit the per-slot reward for a completed slot
    ///
    /// Returns whether a new ledger entry was written.
    async fn award_slot_reward(
        &self,
        agent: &AgentId,
        slot: &StageSlot,
        amount: u64,
    ) -> LedgerResult<bool>;

    /// Credit the layer-pass bonus, once per agent per (claim, layer)
    async fn award_layer_bonus(
        &self,
        agent: &AgentId,
        claim_id: &str,
        layer: u32,
        amount: u64,
    ) -> LedgerResult<bool>;

    /// Credit the pipeline-completion bonus, once per agent per claim
    async fn award_pipeline_bonus(
        &self,
        agent: &AgentId,
        claim_id: &str,
        amount: u64,
    ) -> LedgerResult<bool>;

    /// Current token balance for an agent
    async fn balance(&self, agent: &AgentId) -> LedgerResult<u64>;
}

/// Store-backed rewards ledger
///
/// The ledger insert and balance increment share one store write section,
/// so concurrent reward events serialize and the balance never drifts
/// from the ledger sum.
pub struct TokenLedger {
    store: SharedStateStore,
    bus: SharedEventBus,
}

impl TokenLedger {
    /// Create a ledger over the given store
    pub fn new(store: SharedStateStore, bus: SharedEventBus) -> Self {
        Self { store, bus }
    }

    fn apply(&self, entry: RewardEntry) -> LedgerResult<bool> {
        let credited = self
            .store
            .credit(&entry)
            .map_err(|e| LedgerError::StoreError(e.to_string()))?;

        if credited {
            info!(
                agent = %entry.agent,
                reason = %entry.reason,
                amount = entry.amount,
                claim_id = %entry.claim_id,
                "Reward credited"
            );
            let _ = self.bus.publish(PipelineEvent::RewardIssued {
                agent: entry.agent.clone(),
                reason: entry.reason,
                amount: entry.amount,
                claim_id: entry.claim_id.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(credited)
    }
}

#[async_trait]
impl RewardsLedger for TokenLedger {
    async fn award_slot_reward(
        &self,
        agent: &AgentId,
        slot: &StageSlot,
        amount: u64,
    ) -> LedgerResult<bool> {
        let reason = match slot.slot_type {
            crate::state::SlotType::Work => RewardReason::WorkSlot,
            crate::state::SlotType::Consensus => RewardReason::ConsensusSlot,
        };
        self.apply(RewardEntry::for_slot(agent.clone(), reason, amount, slot))
    }

    async fn award_layer_bonus(
        &self,
        agent: &AgentId,
        claim_id: &str,
        layer: u32,
        amount: u64,
    ) -> LedgerResult<bool> {
        self.apply(RewardEntry::layer_bonus(
            agent.clone(),
            amount,
            claim_id.to_string(),
            layer,
        ))
    }

    async fn award_pipeline_bonus(
        &self,
        agent: &AgentId,
        claim_id: &str,
        amount: u64,
    ) -> LedgerResult<bool> {
        self.apply(RewardEntry::pipeline_bonus(
            agent.clone(),
            amount,
            claim_id.to_string(),
        ))
    }

    async fn balance(&self, agent: &AgentId) -> LedgerResult<u64> {
        self.store
            .balance(agent)
            .map_err(|e| LedgerError::StoreError(e.to_string()))
    }
}
