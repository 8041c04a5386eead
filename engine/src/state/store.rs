//! RocksDB-backed store for pipeline coordination state
//!
//! Provides persistent storage with column families for logical data
//! separation, using bincode for binary serialization internally.
//!
//! All cross-request coordination in the engine flows through this store:
//! read paths take the read lock, and every check-then-mutate sequence
//! (atomic slot take, ownership-checked completion, the advancement
//! compare-and-set, ledger credit, expired-slot reclaim, bulk phase open)
//! holds the write lock for its full span. Concurrent writers therefore
//! serialize rather than interleave, which is the exclusivity guarantee
//! the slot allocator and state machine build on.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, ALL_CFS};
use super::types::*;
use crate::protocol::Protocol;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Lost a race or attempted to recreate an existing record
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Agent balance below the required slot stake
    #[error("Insufficient stake: need {required}, have {available}")]
    InsufficientStake { required: u64, available: u64 },

    /// Agent attempted to mutate a slot held by someone else
    #[error("Ownership mismatch: {0}")]
    Ownership(String),

    /// Flagged layer has exhausted its retry rounds
    #[error("Retry rounds exhausted for claim {claim} (round {round})")]
    RetryExhausted { claim: String, round: u32 },
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to StateStore
pub type SharedStateStore = Arc<StateStore>;

/// RocksDB-backed persistent pipeline store
pub struct StateStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl StateStore {
    /// Open or create a store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> SharedStateStore {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Raw helpers (usable under either lock)
    // =========================================================================

    fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
        bincode::serialize(value).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
        bincode::deserialize(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn put_raw<T: Serialize>(db: &DB, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        db.put_cf(&cf, key.as_bytes(), Self::encode(value)?)?;
        Ok(())
    }

    fn get_raw<T: DeserializeOwned>(db: &DB, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;
        match db.get_cf(&cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn prefix_keys(db: &DB, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut keys = Vec::new();
        let iter = db.prefix_iterator_cf(&cf, prefix.as_bytes());

        for result in iter {
            let (key, _) = result?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                if key_str.starts_with(prefix) {
                    keys.push(key_str);
                } else {
                    break; // Prefix no longer matches
                }
            }
        }

        Ok(keys)
    }

    fn prefix_values<T: DeserializeOwned>(
        db: &DB,
        cf_name: &str,
        prefix: &str,
    ) -> StoreResult<Vec<T>> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

        let mut values = Vec::new();
        let iter = db.prefix_iterator_cf(&cf, prefix.as_bytes());

        for result in iter {
            let (key, value) = result?;
            if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                if key_str.starts_with(prefix) {
                    values.push(Self::decode(&value)?);
                } else {
                    break;
                }
            }
        }

        Ok(values)
    }

    // =========================================================================
    // Protocol operations
    // =========================================================================

    /// Store a protocol template, write-once
    ///
    /// Protocols are immutable once stored: a live pipeline may already
    /// reference them, so overwriting is a conflict, not an update.
    pub fn create_protocol(&self, protocol: &Protocol) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::protocol(&protocol.id);

        if Self::get_raw::<Protocol>(&db, schema::CF_PROTOCOLS, &key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "protocol already exists: {}",
                protocol.id
            )));
        }
        Self::put_raw(&db, schema::CF_PROTOCOLS, &key, protocol)
    }

    /// Get a protocol by id
    pub fn get_protocol(&self, protocol_id: &str) -> StoreResult<Option<Protocol>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::get_raw(&db, schema::CF_PROTOCOLS, &schema::keys::protocol(protocol_id))
    }

    /// Mark a stored protocol as the default
    pub fn set_default_protocol(&self, protocol_id: &str) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::protocol(protocol_id);
        if Self::get_raw::<Protocol>(&db, schema::CF_PROTOCOLS, &key)?.is_none() {
            return Err(StoreError::NotFound(format!("protocol: {}", protocol_id)));
        }
        Self::put_raw(
            &db,
            schema::CF_PROTOCOLS,
            schema::keys::DEFAULT_PROTOCOL,
            &protocol_id.to_string(),
        )
    }

    /// Get the default protocol, if one is marked
    pub fn get_default_protocol(&self) -> StoreResult<Option<Protocol>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let id: Option<String> =
            Self::get_raw(&db, schema::CF_PROTOCOLS, schema::keys::DEFAULT_PROTOCOL)?;
        match id {
            Some(id) => Self::get_raw(&db, schema::CF_PROTOCOLS, &schema::keys::protocol(&id)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Pipeline operations
    // =========================================================================

    /// Create the pipeline state for a claim, write-once (1:1 with claim)
    pub fn create_pipeline(&self, pipeline: &PipelineState) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::pipeline(&pipeline.claim_id);

        if Self::get_raw::<PipelineState>(&db, schema::CF_PIPELINES, &key)?.is_some() {
            return Err(StoreError::Conflict(format!(
                "pipeline already exists for claim: {}",
                pipeline.claim_id
            )));
        }
        Self::put_raw(&db, schema::CF_PIPELINES, &key, pipeline)
    }

    /// Get the pipeline state for a claim
    pub fn get_pipeline(&self, claim_id: &str) -> StoreResult<Option<PipelineState>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::get_raw(&db, schema::CF_PIPELINES, &schema::keys::pipeline(claim_id))
    }

    /// Compare-and-set mutation of the pipeline program counter
    ///
    /// Applies `mutate` only while the pipeline is still `active` at the
    /// expected (layer, phase). Returns `Ok(None)` when the expectation no
    /// longer holds - a stale advancement attempt is a no-op, never an
    /// error, which is what keeps concurrent phase completions from
    /// double-advancing.
    pub fn update_pipeline_if(
        &self,
        claim_id: &str,
        expected_layer: u32,
        expected_phase: PipelinePhase,
        mutate: impl FnOnce(&mut PipelineState),
    ) -> StoreResult<Option<PipelineState>> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::pipeline(claim_id);

        let mut pipeline: PipelineState = Self::get_raw(&db, schema::CF_PIPELINES, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline: {}", claim_id)))?;

        if pipeline.status != PipelineStatus::Active
            || pipeline.current_layer != expected_layer
            || pipeline.phase != expected_phase
        {
            return Ok(None);
        }

        mutate(&mut pipeline);
        pipeline.touch();
        Self::put_raw(&db, schema::CF_PIPELINES, &key, &pipeline)?;
        Ok(Some(pipeline))
    }

    /// Reopen a flagged pipeline's current layer for another work round
    ///
    /// Administrative operation: bounded retry of the same layer, not a
    /// rollback. Fails once `max_rounds` rounds have been attempted.
    pub fn resume_pipeline(&self, claim_id: &str, max_rounds: u32) -> StoreResult<PipelineState> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::pipeline(claim_id);

        let mut pipeline: PipelineState = Self::get_raw(&db, schema::CF_PIPELINES, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline: {}", claim_id)))?;

        if pipeline.status != PipelineStatus::Flagged {
            return Err(StoreError::Conflict(format!(
                "pipeline for claim {} is {}, not flagged",
                claim_id, pipeline.status
            )));
        }
        if pipeline.round + 1 >= max_rounds {
            return Err(StoreError::RetryExhausted {
                claim: claim_id.to_string(),
                round: pipeline.round,
            });
        }

        pipeline.status = PipelineStatus::Active;
        pipeline.phase = PipelinePhase::Work;
        pipeline.round += 1;
        pipeline.touch();
        Self::put_raw(&db, schema::CF_PIPELINES, &key, &pipeline)?;
        Ok(pipeline)
    }

    /// Backfill the on-chain transaction reference after a registry commit
    ///
    /// The only write permitted on a `complete` pipeline.
    pub fn set_commit_tx(&self, claim_id: &str, tx_ref: &str) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::pipeline(claim_id);

        let mut pipeline: PipelineState = Self::get_raw(&db, schema::CF_PIPELINES, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("pipeline: {}", claim_id)))?;
        pipeline.commit_tx = Some(tx_ref.to_string());
        Self::put_raw(&db, schema::CF_PIPELINES, &key, &pipeline)
    }

    // =========================================================================
    // Slot operations
    // =========================================================================

    /// Create a full slot set for one (claim, layer, round, phase) atomically
    ///
    /// Guarded against double-open: fails with `Conflict` if any slot for
    /// that combination already exists. All slots land in one write batch,
    /// so agents never observe a partial layer.
    pub fn create_slots(
        &self,
        claim_id: &str,
        layer: u32,
        round: u32,
        slot_type: SlotType,
        slots: &[StageSlot],
    ) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let prefix = schema::keys::slot_phase_prefix(claim_id, layer, round, slot_type);

        if !Self::prefix_keys(&db, schema::CF_SLOTS, &prefix)?.is_empty() {
            return Err(StoreError::Conflict(format!(
                "slots already opened for claim {} layer {} round {} ({})",
                claim_id, layer, round, slot_type
            )));
        }

        let cf = db
            .cf_handle(schema::CF_SLOTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_SLOTS.to_string()))?;

        let mut batch = WriteBatch::default();
        for slot in slots {
            batch.put_cf(&cf, slot.id.as_bytes(), Self::encode(slot)?);
        }
        db.write(batch)?;
        Ok(())
    }

    /// Get a slot by id
    pub fn get_slot(&self, slot_id: &str) -> StoreResult<Option<StageSlot>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::get_raw(&db, schema::CF_SLOTS, slot_id)
    }

    /// All slots for a claim, in creation order
    pub fn claim_slots(&self, claim_id: &str) -> StoreResult<Vec<StageSlot>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::prefix_values(&db, schema::CF_SLOTS, &schema::keys::slot_claim_prefix(claim_id))
    }

    /// Slots for one (claim, layer, round, phase) set, in creation order
    pub fn phase_slots(
        &self,
        claim_id: &str,
        layer: u32,
        round: u32,
        slot_type: SlotType,
    ) -> StoreResult<Vec<StageSlot>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::prefix_values(
            &db,
            schema::CF_SLOTS,
            &schema::keys::slot_phase_prefix(claim_id, layer, round, slot_type),
        )
    }

    /// Every slot in the store, in key order
    ///
    /// Used by cross-claim open-slot matching; the slot population is
    /// bounded by protocol size times live claims.
    pub fn all_slots(&self) -> StoreResult<Vec<StageSlot>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::prefix_values(&db, schema::CF_SLOTS, "slot:")
    }

    /// Atomically claim a slot for an agent
    ///
    /// Verifies the slot is still `open` and the agent's balance covers
    /// the stake, then flips to `taken`, all under the write lock - two
    /// agents racing on the same slot can never both succeed.
    pub fn take_slot(&self, slot_id: &str, agent: &str, stake: u64) -> StoreResult<StageSlot> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;

        let mut slot: StageSlot = Self::get_raw(&db, schema::CF_SLOTS, slot_id)?
            .ok_or_else(|| StoreError::NotFound(format!("slot: {}", slot_id)))?;

        if slot.status != SlotStatus::Open {
            return Err(StoreError::Conflict(format!(
                "slot {} is {}, not open",
                slot_id, slot.status
            )));
        }

        let balance: u64 =
            Self::get_raw(&db, schema::CF_BALANCES, &schema::keys::balance(agent))?.unwrap_or(0);
        if balance < stake {
            return Err(StoreError::InsufficientStake {
                required: stake,
                available: balance,
            });
        }

        slot.status = SlotStatus::Taken;
        slot.agent = Some(agent.to_string());
        slot.taken_at = Some(Utc::now());
        Self::put_raw(&db, schema::CF_SLOTS, slot_id, &slot)?;
        Ok(slot)
    }

    /// Record a submission, flipping `taken -> done`
    ///
    /// Only the agent holding the slot may complete it.
    #[allow(clippy::too_many_arguments)]
    pub fn complete_slot(
        &self,
        slot_id: &str,
        agent: &str,
        output: &str,
        confidence: Option<f32>,
        structured_output: Option<serde_json::Value>,
        signature: Option<String>,
    ) -> StoreResult<StageSlot> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;

        let mut slot: StageSlot = Self::get_raw(&db, schema::CF_SLOTS, slot_id)?
            .ok_or_else(|| StoreError::NotFound(format!("slot: {}", slot_id)))?;

        if slot.status != SlotStatus::Taken {
            return Err(StoreError::Conflict(format!(
                "slot {} is {}, not taken",
                slot_id, slot.status
            )));
        }
        if slot.agent.as_deref() != Some(agent) {
            return Err(StoreError::Ownership(format!(
                "slot {} is held by another agent",
                slot_id
            )));
        }

        slot.status = SlotStatus::Done;
        slot.output = Some(output.to_string());
        slot.confidence = confidence;
        slot.structured_output = structured_output;
        slot.signature = signature;
        slot.done_at = Some(Utc::now());
        Self::put_raw(&db, schema::CF_SLOTS, slot_id, &slot)?;
        Ok(slot)
    }

    /// Reclaim `taken` slots whose holder went silent
    ///
    /// Flips every slot taken before `cutoff` back to `open`, clearing the
    /// holder. Returns the pre-reset slots so callers can report who lost
    /// their hold.
    pub fn reclaim_taken_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageSlot>> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let expired: Vec<StageSlot> = Self::prefix_values::<StageSlot>(&db, schema::CF_SLOTS, "slot:")?
            .into_iter()
            .filter(|s| s.status == SlotStatus::Taken && s.taken_at.map_or(false, |t| t < cutoff))
            .collect();

        if expired.is_empty() {
            return Ok(expired);
        }

        let cf = db
            .cf_handle(schema::CF_SLOTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_SLOTS.to_string()))?;

        let mut batch = WriteBatch::default();
        for slot in &expired {
            let mut reopened = slot.clone();
            reopened.status = SlotStatus::Open;
            reopened.agent = None;
            reopened.taken_at = None;
            batch.put_cf(&cf, reopened.id.as_bytes(), Self::encode(&reopened)?);
        }
        db.write(batch)?;
        Ok(expired)
    }

    // =========================================================================
    // Flag operations
    // =========================================================================

    /// Append a consensus-failure flag
    pub fn put_flag(&self, flag: &Flag) -> StoreResult<()> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::flag(&flag.claim_id, flag.layer, flag.round, &flag.id);
        Self::put_raw(&db, schema::CF_FLAGS, &key, flag)
    }

    /// All flags accumulated by a claim, oldest layer first
    pub fn claim_flags(&self, claim_id: &str) -> StoreResult<Vec<Flag>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::prefix_values(&db, schema::CF_FLAGS, &schema::keys::flag_claim_prefix(claim_id))
    }

    // =========================================================================
    // Ledger and balance operations
    // =========================================================================

    /// Credit a reward, exactly once per (agent, dedup scope)
    ///
    /// The ledger insert and the balance increment happen in the same
    /// write section; returns `false` without touching the balance when an
    /// entry for the same qualifying event already exists.
    pub fn credit(&self, entry: &RewardEntry) -> StoreResult<bool> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::ledger(&entry.agent, &entry.dedup_scope());

        if Self::get_raw::<RewardEntry>(&db, schema::CF_LEDGER, &key)?.is_some() {
            return Ok(false);
        }

        Self::put_raw(&db, schema::CF_LEDGER, &key, entry)?;

        let balance_key = schema::keys::balance(&entry.agent);
        let balance: u64 = Self::get_raw(&db, schema::CF_BALANCES, &balance_key)?.unwrap_or(0);
        Self::put_raw(
            &db,
            schema::CF_BALANCES,
            &balance_key,
            &(balance + entry.amount),
        )?;
        Ok(true)
    }

    /// Deposit tokens into an agent's balance (top-up / test funding)
    pub fn deposit(&self, agent: &str, amount: u64) -> StoreResult<u64> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = schema::keys::balance(agent);
        let balance: u64 = Self::get_raw(&db, schema::CF_BALANCES, &key)?.unwrap_or(0);
        let updated = balance + amount;
        Self::put_raw(&db, schema::CF_BALANCES, &key, &updated)?;
        Ok(updated)
    }

    /// Current token balance for an agent
    pub fn balance(&self, agent: &str) -> StoreResult<u64> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(Self::get_raw(&db, schema::CF_BALANCES, &schema::keys::balance(agent))?.unwrap_or(0))
    }

    /// Ledger entries for an agent, in scope order
    pub fn agent_ledger(&self, agent: &str) -> StoreResult<Vec<RewardEntry>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::prefix_values(&db, schema::CF_LEDGER, &format!("led:{}:", agent))
    }

    // =========================================================================
    // Event operations (for replay)
    // =========================================================================

    /// Store an event (serialized as JSON for debuggability)
    pub fn put_event(
        &self,
        timestamp_nanos: i64,
        event_id: &str,
        event: &impl Serialize,
    ) -> StoreResult<()> {
        let key = schema::keys::event(timestamp_nanos, event_id);
        let bytes =
            serde_json::to_vec(event).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;

        db.put_cf(&cf, key.as_bytes(), bytes)?;
        Ok(())
    }

    /// Get events in a time range
    pub fn get_events_range<T: DeserializeOwned>(
        &self,
        start_nanos: i64,
        end_nanos: i64,
    ) -> StoreResult<Vec<(i64, T)>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(schema::CF_EVENTS)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(schema::CF_EVENTS.to_string()))?;

        let start_key = schema::keys::event(start_nanos, "");
        let iter = db.iterator_cf(
            &cf,
            rocksdb::IteratorMode::From(start_key.as_bytes(), rocksdb::Direction::Forward),
        );

        let mut events = Vec::new();
        for result in iter {
            let (key, value) = result?;
            let key_str = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;

            if let Some(ts) = schema::keys::parse_event_timestamp(&key_str) {
                if ts > end_nanos {
                    break;
                }
                let event: T = serde_json::from_slice(&value)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                events.push((ts, event));
            }
        }

        Ok(events)
    }
}
