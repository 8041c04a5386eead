//! Proof-of-intelligence commit - hash and on-chain registry seam
//!
//! When a pipeline completes, the engine digests every `done` slot's
//! output in creation order into a SHA-256 hash and requests an on-chain
//! commit of (claim, hash, agent count, layer count). The commit is
//! best-effort: deliberation state never rolls back because a chain call
//! failed or no registry is configured.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::state::StageSlot;

/// Error type for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Registry not configured")]
    NotConfigured,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Registry rejected commit: {0}")]
    Rejected(String),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Digest of a completed pipeline's outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoiDigest {
    /// Hex SHA-256 over the done slots' outputs, in creation order
    pub output_hash: String,
    /// Distinct agents that completed any slot
    pub agent_count: u32,
    /// Distinct layers the done slots span
    pub layer_count: u32,
    /// Number of done slots hashed
    pub slot_count: u32,
}

/// Compute the proof-of-intelligence digest over a claim's slots
///
/// Callers pass the claim's slots in creation order (the store returns
/// them that way); only `done` slots contribute, so the hash is
/// reproducible from the permanent audit trail alone.
pub fn digest_outputs(slots: &[StageSlot]) -> PoiDigest {
    let mut hasher = Sha256::new();
    let mut agents: HashSet<&str> = HashSet::new();
    let mut layers: HashSet<u32> = HashSet::new();
    let mut slot_count = 0u32;

    for slot in slots.iter().filter(|s| s.is_done()) {
        hasher.update(slot.id.as_bytes());
        hasher.update(b":");
        hasher.update(slot.output.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"\n");

        if let Some(agent) = slot.agent.as_deref() {
            agents.insert(agent);
        }
        layers.insert(slot.layer);
        slot_count += 1;
    }

    let output_hash = format!("{:x}", hasher.finalize());
    debug!(slot_count, hash = %output_hash, "Computed PoI digest");

    PoiDigest {
        output_hash,
        agent_count: agents.len() as u32,
        layer_count: layers.len() as u32,
        slot_count,
    }
}

/// External-collaborator seam for the on-chain registry
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Request an on-chain commit; returns the transaction reference
    async fn commit_pipeline_hash(&self, claim_id: &str, digest: &PoiDigest)
        -> RegistryResult<String>;
}

/// HTTP client for a registry gateway endpoint
pub struct HttpRegistryClient {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpRegistryClient {
    /// Create a client for the given commit endpoint
    pub fn new(endpoint: impl Into<String>) -> RegistryResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| RegistryError::HttpError(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }
}

#[derive(Serialize)]
struct CommitRequest<'a> {
    claim_id: &'a str,
    output_hash: &'a str,
    agent_count: u32,
    layer_count: u32,
}

#[derive(Deserialize)]
struct CommitResponse {
    tx_ref: String,
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn commit_pipeline_hash(
        &self,
        claim_id: &str,
        digest: &PoiDigest,
    ) -> RegistryResult<String> {
        let request = CommitRequest {
            claim_id,
            output_hash: &digest.output_hash,
            agent_count: digest.agent_count,
            layer_count: digest.layer_count,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| RegistryError::HttpError(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Rejected(format!("HTTP {}: {}", status, body)));
        }

        let commit: CommitResponse = response
            .json()
            .await
            .map_err(|e| RegistryError::HttpError(e.to_string()))?;
        Ok(commit.tx_ref)
    }
}

/// Registry stand-in used when no endpoint is configured
///
/// Always defers; the pipeline still completes and the hash remains
/// stored for later auditing.
pub struct DisabledRegistry;

#[async_trait]
impl RegistryClient for DisabledRegistry {
    async fn commit_pipeline_hash(
        &self,
        _claim_id: &str,
        _digest: &PoiDigest,
    ) -> RegistryResult<String> {
        Err(RegistryError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SlotStatus, SlotType};

    fn done_slot(idx: u32, layer: u32, agent: &str, output: &str) -> StageSlot {
        let mut slot = StageSlot::new(
            format!("slot:c:{:04}:00:0:{:02}", layer, idx),
            "c".to_string(),
            "standard".to_string(),
            layer,
            0,
            SlotType::Work,
            "critic",
        );
        slot.status = SlotStatus::Done;
        slot.agent = Some(agent.to_string());
        slot.output = Some(output.to_string());
        slot
    }

    #[test]
    fn test_digest_counts_and_reproducibility() {
        let slots = vec![
            done_slot(0, 0, "agent-a", "first"),
            done_slot(1, 0, "agent-b", "second"),
            done_slot(0, 1, "agent-a", "third"),
        ];

        let digest = digest_outputs(&slots);
        assert_eq!(digest.slot_count, 3);
        assert_eq!(digest.agent_count, 2);
        assert_eq!(digest.layer_count, 2);
        assert_eq!(digest.output_hash.len(), 64);

        // Same inputs, same hash
        let again = digest_outputs(&slots);
        assert_eq!(digest.output_hash, again.output_hash);
    }

    #[test]
    fn test_digest_skips_unfinished_slots() {
        let mut open = done_slot(0, 0, "agent-a", "ignored");
        open.status = SlotStatus::Open;
        open.output = None;

        let done = vec![done_slot(1, 0, "agent-b", "kept")];
        let with_open = vec![open, done[0].clone()];

        assert_eq!(
            digest_outputs(&with_open).output_hash,
            digest_outputs(&done).output_hash
        );
        assert_eq!(digest_outputs(&with_open).slot_count, 1);
    }

    #[test]
    fn test_digest_is_order_sensitive() {
        let a = done_slot(0, 0, "agent-a", "first");
        let b = done_slot(1, 0, "agent-b", "second");

        let forward = digest_outputs(&[a.clone(), b.clone()]);
        let reversed = digest_outputs(&[b, a]);
        assert_ne!(forward.output_hash, reversed.output_hash);
    }

    #[tokio::test]
    async fn test_disabled_registry_defers() {
        let digest = digest_outputs(&[]);
        let result = DisabledRegistry.commit_pipeline_hash("c", &digest).await;
        assert!(matches!(result, Err(RegistryError::NotConfigured)));
    }
}
