//! Pipeline engine - central orchestrator for claim deliberation
//!
//! The engine manages the lifecycle of claims through their staged
//! pipelines: protocol registration, attachment, slot hand-out,
//! submission, advancement, and flag recovery.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::events::{PipelineEvent, SharedEventBus};
use crate::protocol::{Protocol, ProtocolError};
use crate::state::{
    AgentId, Flag, PipelineState, RewardEntry, SharedStateStore, StageSlot, StoreError,
};

use super::advancement::{AdvanceOutcome, AdvancementEngine};
use super::allocator::{SlotAllocator, SlotFilter, SlotSubmission, WorkContext};
use super::interpret::{ClaimDirectory, NullClaimDirectory, OutputInterpreter};
use super::poi::{DisabledRegistry, HttpRegistryClient, RegistryClient, RegistryError};
use super::rewards::{RewardsLedger, TokenLedger};

/// Error type for engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Lost a take race, or a slot set was already opened
    #[error("Slot conflict: {0}")]
    SlotConflict(String),

    #[error("Insufficient stake: need {required}, have {available}")]
    InsufficientStake { required: u64, available: u64 },

    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Retry rounds exhausted for claim {0}")]
    RetryExhausted(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Store error: {0}")]
    Store(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(msg) => EngineError::SlotConflict(msg),
            StoreError::InsufficientStake {
                required,
                available,
            } => EngineError::InsufficientStake {
                required,
                available,
            },
            StoreError::Ownership(msg) => EngineError::InvalidSubmission(msg),
            StoreError::NotFound(what) => EngineError::NotFound(what),
            StoreError::RetryExhausted { claim, .. } => EngineError::RetryExhausted(claim),
            other => EngineError::Store(other.to_string()),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Shared reference to PipelineEngine
pub type SharedPipelineEngine = Arc<PipelineEngine>;

/// An open slot offered to an agent, with the deliberation history it
/// needs to produce an informed submission
#[derive(Debug, Clone)]
pub struct SlotOffer {
    pub slot: StageSlot,
    pub pipeline: PipelineState,
    pub context: WorkContext,
}

/// What a submission did, beyond completing the slot
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    /// The completed slot
    pub slot: StageSlot,
    /// Advancement triggered by this submission, if it got that far
    pub advance: Option<AdvanceOutcome>,
}

/// Central orchestrator for staged claim deliberation
pub struct PipelineEngine {
    store: SharedStateStore,
    bus: SharedEventBus,
    config: EngineConfig,
    allocator: SlotAllocator,
    advancement: AdvancementEngine,
    ledger: Arc<dyn RewardsLedger>,
    registry: Arc<dyn RegistryClient>,
    directory: Arc<dyn ClaimDirectory>,
}

impl PipelineEngine {
    /// Create a new pipeline engine
    ///
    /// Defaults to the store-backed token ledger and the null claim
    /// directory. The registry client is HTTP when `registry_url` is
    /// configured, otherwise disabled (commits defer).
    pub fn new(
        store: SharedStateStore,
        bus: SharedEventBus,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let registry: Arc<dyn RegistryClient> = match &config.registry_url {
            Some(url) => Arc::new(
                HttpRegistryClient::new(url.clone())
                    .map_err(|e: RegistryError| EngineError::Registry(e.to_string()))?,
            ),
            None => Arc::new(DisabledRegistry),
        };

        Ok(Self {
            store: store.clone(),
            bus: bus.clone(),
            config: config.clone(),
            allocator: SlotAllocator::new(store.clone(), bus.clone(), config.clone()),
            advancement: AdvancementEngine::new(store.clone(), bus.clone(), config),
            ledger: Arc::new(TokenLedger::new(store, bus)),
            registry,
            directory: Arc::new(NullClaimDirectory),
        })
    }

    /// Create a shared reference to this engine
    pub fn shared(self) -> SharedPipelineEngine {
        Arc::new(self)
    }

    /// Replace the rewards ledger
    pub fn with_ledger(mut self, ledger: Arc<dyn RewardsLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    /// Replace the on-chain registry client
    pub fn with_registry(mut self, registry: Arc<dyn RegistryClient>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the claim directory used for classifier write-backs
    pub fn with_claim_directory(mut self, directory: Arc<dyn ClaimDirectory>) -> Self {
        self.directory = directory;
        self
    }

    /// Underlying store handle
    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// Event bus handle
    pub fn bus(&self) -> &SharedEventBus {
        &self.bus
    }

    /// Register a protocol template (write-once by id)
    pub fn register_protocol(&self, protocol: &Protocol, default: bool) -> EngineResult<()> {
        protocol.validate()?;
        self.store.create_protocol(protocol)?;
        if default {
            self.store.set_default_protocol(&protocol.id)?;
        }
        info!(protocol_id = %protocol.id, layers = protocol.layer_count(), "Protocol registered");
        Ok(())
    }

    /// Attach a claim to a pipeline and open its first work layer
    ///
    /// Uses the default protocol when none is named. One pipeline per
    /// claim: re-attachment is a conflict.
    pub fn attach_claim(
        &self,
        claim_id: &str,
        protocol_id: Option<&str>,
        domain: Option<String>,
    ) -> EngineResult<PipelineState> {
        let protocol = match protocol_id {
            Some(id) => self
                .store
                .get_protocol(id)?
                .ok_or_else(|| EngineError::NotFound(format!("protocol: {}", id)))?,
            None => self
                .store
                .get_default_protocol()?
                .ok_or_else(|| EngineError::NotFound("no default protocol".to_string()))?,
        };

        let pipeline =
            PipelineState::new(claim_id.to_string(), protocol.id.clone()).with_domain(domain);
        self.store.create_pipeline(&pipeline)?;
        self.allocator.open_work_layer(&pipeline, &protocol)?;

        info!(claim_id, protocol_id = %protocol.id, "Claim attached to pipeline");
        let _ = self.bus.publish(PipelineEvent::PipelineAttached {
            claim_id: claim_id.to_string(),
            protocol_id: protocol.id.clone(),
            timestamp: Utc::now(),
        });

        Ok(pipeline)
    }

    /// Offer the oldest open slot matching the filters
    ///
    /// The offer carries the claim's deliberation history; it does not
    /// reserve the slot.
    pub fn fetch_open_slot(&self, filter: &SlotFilter) -> EngineResult<Option<SlotOffer>> {
        let slot = match self.allocator.find_open_slot(filter)? {
            Some(slot) => slot,
            None => return Ok(None),
        };
        let pipeline = self
            .store
            .get_pipeline(&slot.claim_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pipeline: {}", slot.claim_id)))?;
        let context = self.allocator.build_context(&pipeline)?;
        Ok(Some(SlotOffer {
            slot,
            pipeline,
            context,
        }))
    }

    /// Atomically take a slot for an agent
    pub fn take(&self, slot_id: &str, agent: &AgentId) -> EngineResult<StageSlot> {
        self.allocator.take(slot_id, agent)
    }

    /// Submit output for a held slot
    ///
    /// Completes the slot, then runs the downstream chain: slot reward,
    /// structured-output interpretation, and an advancement attempt.
    /// Everything after completion is isolated - a reward or advancement
    /// failure is logged, and the submission still succeeds.
    pub async fn submit(
        &self,
        slot_id: &str,
        agent: &AgentId,
        submission: &SlotSubmission,
    ) -> EngineResult<SubmitReceipt> {
        let slot = self.allocator.submit(slot_id, agent, submission)?;

        let amount = match slot.slot_type {
            crate::state::SlotType::Work => self.config.work_slot_reward,
            crate::state::SlotType::Consensus => self.config.consensus_slot_reward,
        };
        if let Err(e) = self.ledger.award_slot_reward(agent, &slot, amount).await {
            warn!(slot_id, agent = %agent, error = %e, "Slot reward credit failed");
        }

        OutputInterpreter::for_role(&slot.role)
            .apply(&slot, self.directory.as_ref())
            .await;

        let advance = match self
            .advancement
            .advance(&slot.claim_id, self.ledger.as_ref(), &self.registry)
            .await
        {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(claim_id = %slot.claim_id, error = %e, "Advancement attempt failed");
                None
            }
        };

        Ok(SubmitReceipt { slot, advance })
    }

    /// Current pipeline state for a claim
    pub fn pipeline_state(&self, claim_id: &str) -> EngineResult<PipelineState> {
        self.store
            .get_pipeline(claim_id)?
            .ok_or_else(|| EngineError::NotFound(format!("pipeline: {}", claim_id)))
    }

    /// Every slot of a claim, in creation order (the audit trail)
    pub fn claim_slots(&self, claim_id: &str) -> EngineResult<Vec<StageSlot>> {
        Ok(self.store.claim_slots(claim_id)?)
    }

    /// Flags recorded against a claim
    pub fn claim_flags(&self, claim_id: &str) -> EngineResult<Vec<Flag>> {
        Ok(self.store.claim_flags(claim_id)?)
    }

    /// Administratively reopen a flagged claim's layer for a fresh round
    ///
    /// Bounded by the configured maximum rounds per layer. Prior rounds'
    /// slots stay in place as audit trail.
    pub fn resume_flagged(&self, claim_id: &str) -> EngineResult<PipelineState> {
        let pipeline = self
            .store
            .resume_pipeline(claim_id, self.config.max_layer_rounds)?;
        let protocol = self
            .store
            .get_protocol(&pipeline.protocol_id)?
            .ok_or_else(|| EngineError::NotFound(format!("protocol: {}", pipeline.protocol_id)))?;
        self.allocator.open_work_layer(&pipeline, &protocol)?;

        info!(
            claim_id,
            layer = pipeline.current_layer,
            round = pipeline.round,
            "Flagged layer reopened"
        );
        let _ = self.bus.publish(PipelineEvent::LayerReopened {
            claim_id: claim_id.to_string(),
            layer: pipeline.current_layer,
            round: pipeline.round,
            timestamp: Utc::now(),
        });

        Ok(pipeline)
    }

    /// Return expired `taken` slots to the open pool
    pub fn reclaim_expired(&self) -> EngineResult<Vec<StageSlot>> {
        self.allocator.reclaim_expired()
    }

    /// Deposit tokens into an agent's balance
    pub fn fund_agent(&self, agent: &AgentId, amount: u64) -> EngineResult<u64> {
        Ok(self.store.deposit(agent, amount)?)
    }

    /// Current token balance for an agent
    pub fn agent_balance(&self, agent: &AgentId) -> EngineResult<u64> {
        Ok(self.store.balance(agent)?)
    }

    /// Reward ledger entries credited to an agent
    pub fn agent_ledger(&self, agent: &AgentId) -> EngineResult<Vec<RewardEntry>> {
        Ok(self.store.agent_ledger(agent)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::{PipelinePhase, StateStore};
    use tempfile::tempdir;

    fn setup() -> (PipelineEngine, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path().join("test.db")).unwrap().shared();
        let bus = EventBus::new().shared();
        let config = EngineConfig {
            registry_url: None,
            ..Default::default()
        };
        let engine = PipelineEngine::new(store, bus, config).unwrap();
        engine
            .register_protocol(&Protocol::standard_review(), true)
            .unwrap();
        (engine, dir)
    }

    #[test]
    fn test_attach_uses_default_protocol_and_opens_layer_zero() {
        let (engine, _dir) = setup();
        let pipeline = engine.attach_claim("claim-1", None, None).unwrap();
        assert_eq!(pipeline.protocol_id, "standard-review");
        assert_eq!(pipeline.current_layer, 0);
        assert_eq!(pipeline.phase, PipelinePhase::Work);

        let slots = engine.claim_slots("claim-1").unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].role, "classifier");
    }

    #[test]
    fn test_attach_twice_is_a_conflict() {
        let (engine, _dir) = setup();
        engine.attach_claim("claim-1", None, None).unwrap();
        assert!(matches!(
            engine.attach_claim("claim-1", None, None),
            Err(EngineError::SlotConflict(_))
        ));
    }

    #[test]
    fn test_attach_unknown_protocol_not_found() {
        let (engine, _dir) = setup();
        assert!(matches!(
            engine.attach_claim("claim-1", Some("missing"), None),
            Err(EngineError::NotFound(_))
        ));
    }

    #[test]
    fn test_take_requires_stake() {
        let (engine, _dir) = setup();
        engine.attach_claim("claim-1", None, None).unwrap();
        let slot = engine
            .fetch_open_slot(&SlotFilter::default())
            .unwrap()
            .unwrap()
            .slot;

        let agent = "agent-poor".to_string();
        assert!(matches!(
            engine.take(&slot.id, &agent),
            Err(EngineError::InsufficientStake { required: 10, .. })
        ));

        engine.fund_agent(&agent, 10).unwrap();
        engine.take(&slot.id, &agent).unwrap();
    }

    #[tokio::test]
    async fn test_submit_pays_slot_reward() {
        let (engine, _dir) = setup();
        engine.attach_claim("claim-1", None, None).unwrap();
        let agent = "agent-a".to_string();
        engine.fund_agent(&agent, 10).unwrap();

        let slot = engine
            .fetch_open_slot(&SlotFilter::default())
            .unwrap()
            .unwrap()
            .slot;
        engine.take(&slot.id, &agent).unwrap();
        let receipt = engine
            .submit(&slot.id, &agent, &SlotSubmission::text("classified"))
            .await
            .unwrap();
        assert!(receipt.advance.is_some());

        // 10 funded + 25 work reward + 50 layer bonus for the vacuous pass
        assert_eq!(engine.agent_balance(&agent).unwrap(), 85);
        assert_eq!(engine.agent_ledger(&agent).unwrap().len(), 2);
    }
}
