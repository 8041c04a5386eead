//! Column family definitions for the RocksDB pipeline store
//!
//! Each column family provides logical separation of the five durable
//! record kinds (protocols, pipeline states, stage slots, flags, reward
//! ledger) plus balances and event history, while sharing one RocksDB
//! instance.

/// Column family for protocol templates
pub const CF_PROTOCOLS: &str = "protocols";

/// Column family for per-claim pipeline states
pub const CF_PIPELINES: &str = "pipelines";

/// Column family for stage slots
pub const CF_SLOTS: &str = "slots";

/// Column family for consensus-failure flags
pub const CF_FLAGS: &str = "flags";

/// Column family for reward ledger entries
pub const CF_LEDGER: &str = "ledger";

/// Column family for agent token balances
pub const CF_BALANCES: &str = "balances";

/// Column family for event history
pub const CF_EVENTS: &str = "events";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_PROTOCOLS,
    CF_PIPELINES,
    CF_SLOTS,
    CF_FLAGS,
    CF_LEDGER,
    CF_BALANCES,
    CF_EVENTS,
];

/// Key builders for compound keys
///
/// Slot keys are zero-padded so that lexicographic key order equals
/// creation order within a claim: layer ascending, round ascending, work
/// phase before consensus phase, slot index ascending. The PoI digest and
/// "oldest open slot" matching both rely on this ordering.
pub mod keys {
    use crate::state::types::SlotType;

    /// Key under which the default protocol id is stored
    pub const DEFAULT_PROTOCOL: &str = "default";

    /// Create a protocol key
    pub fn protocol(protocol_id: &str) -> String {
        format!("proto:{}", protocol_id)
    }

    /// Create a pipeline key (one pipeline per claim)
    pub fn pipeline(claim_id: &str) -> String {
        format!("pipe:{}", claim_id)
    }

    /// Phase marker digit: work sorts before consensus
    fn phase_marker(slot_type: SlotType) -> u8 {
        match slot_type {
            SlotType::Work => 0,
            SlotType::Consensus => 1,
        }
    }

    /// Prefix covering every slot of a claim, in creation order
    pub fn slot_claim_prefix(claim_id: &str) -> String {
        format!("slot:{}:", claim_id)
    }

    /// Prefix covering one (claim, layer, round, phase) slot set
    pub fn slot_phase_prefix(
        claim_id: &str,
        layer: u32,
        round: u32,
        slot_type: SlotType,
    ) -> String {
        format!(
            "slot:{}:{:04}:{:02}:{}:",
            claim_id,
            layer,
            round,
            phase_marker(slot_type)
        )
    }

    /// Create a slot key; this string is also the slot's public id
    pub fn slot(claim_id: &str, layer: u32, round: u32, slot_type: SlotType, index: u32) -> String {
        format!(
            "{}{:02}",
            slot_phase_prefix(claim_id, layer, round, slot_type),
            index
        )
    }

    /// Create a flag key
    pub fn flag(claim_id: &str, layer: u32, round: u32, flag_id: &str) -> String {
        format!("flag:{}:{:04}:{:02}:{}", claim_id, layer, round, flag_id)
    }

    /// Prefix covering every flag of a claim
    pub fn flag_claim_prefix(claim_id: &str) -> String {
        format!("flag:{}:", claim_id)
    }

    /// Create a ledger key from an agent and a dedup scope
    ///
    /// The scope encodes the qualifying event identity, so reinserting the
    /// same (agent, scope) pair is a no-op - this is the exactly-once
    /// reward guard.
    pub fn ledger(agent: &str, scope: &str) -> String {
        format!("led:{}:{}", agent, scope)
    }

    /// Create a balance key
    pub fn balance(agent: &str) -> String {
        format!("bal:{}", agent)
    }

    /// Create an event key (timestamp-based for ordering)
    pub fn event(timestamp_nanos: i64, event_id: &str) -> String {
        format!("evt:{:020}:{}", timestamp_nanos, event_id)
    }

    /// Parse event timestamp from key
    pub fn parse_event_timestamp(key: &str) -> Option<i64> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() >= 2 && parts[0] == "evt" {
            parts[1].parse().ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::SlotType;

    #[test]
    fn test_key_generation() {
        assert_eq!(keys::protocol("standard"), "proto:standard");
        assert_eq!(keys::pipeline("claim-1"), "pipe:claim-1");
        assert_eq!(
            keys::slot("claim-1", 2, 0, SlotType::Work, 1),
            "slot:claim-1:0002:00:0:01"
        );
        assert_eq!(keys::ledger("agent-a", "pipeline:claim-1"), "led:agent-a:pipeline:claim-1");
    }

    #[test]
    fn test_slot_key_creation_order() {
        // Work before consensus within a layer, layers ascending.
        let w0 = keys::slot("c", 0, 0, SlotType::Work, 0);
        let w1 = keys::slot("c", 0, 0, SlotType::Work, 1);
        let c0 = keys::slot("c", 0, 0, SlotType::Consensus, 0);
        let next_layer = keys::slot("c", 1, 0, SlotType::Work, 0);

        assert!(w0 < w1);
        assert!(w1 < c0);
        assert!(c0 < next_layer);
    }

    #[test]
    fn test_slot_key_round_ordering() {
        let r0 = keys::slot("c", 3, 0, SlotType::Work, 0);
        let r1 = keys::slot("c", 3, 1, SlotType::Work, 0);
        assert!(r0 < r1);
    }

    #[test]
    fn test_parse_event_timestamp() {
        let key = keys::event(12345, "evt-1");
        assert_eq!(keys::parse_event_timestamp(&key), Some(12345));
    }
}
