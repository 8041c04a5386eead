//! Structured-output interpretation - role-keyed side effects
//!
//! Some work roles carry typed structured payloads whose meaning depends
//! on the role name: a classification layer's output sets the claim's
//! domain. Dispatch is an explicit enum keyed by role rather than untyped
//! payload inspection, so adding a role means adding a variant and its
//! schema.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::state::StageSlot;

/// Error type for claim directory operations
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("Claim not found: {0}")]
    NotFound(String),

    #[error("Directory unavailable: {0}")]
    Unavailable(String),
}

/// External-collaborator seam for writing back to the claim record
#[async_trait]
pub trait ClaimDirectory: Send + Sync {
    /// Set the claim's domain tag from a classification output
    async fn set_domain(&self, claim_id: &str, domain: &str) -> Result<(), DirectoryError>;
}

/// Directory stand-in when no claim service is wired up
pub struct NullClaimDirectory;

#[async_trait]
impl ClaimDirectory for NullClaimDirectory {
    async fn set_domain(&self, claim_id: &str, domain: &str) -> Result<(), DirectoryError> {
        debug!(claim_id, domain, "Claim directory not wired; domain write skipped");
        Ok(())
    }
}

/// Typed payload of a classifier role's structured output
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierOutput {
    /// Domain tag to write back to the claim
    pub domain: String,
}

/// Interpreters for role-tagged structured outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputInterpreter {
    /// "classifier" role: payload sets the claim's domain
    Classifier,
    /// Role has no structured-output semantics
    Inert,
}

impl OutputInterpreter {
    /// Select the interpreter for a role name
    pub fn for_role(role: &str) -> Self {
        match role {
            "classifier" => OutputInterpreter::Classifier,
            _ => OutputInterpreter::Inert,
        }
    }

    /// Apply this interpreter to a completed slot's structured output
    ///
    /// Malformed payloads and directory failures are logged and absorbed;
    /// side-channel writes never fail the submission that produced them.
    pub async fn apply(&self, slot: &StageSlot, directory: &dyn ClaimDirectory) {
        let payload = match &slot.structured_output {
            Some(p) => p,
            None => return,
        };

        match self {
            OutputInterpreter::Inert => {}
            OutputInterpreter::Classifier => {
                match serde_json::from_value::<ClassifierOutput>(payload.clone()) {
                    Ok(output) => {
                        if let Err(e) = directory.set_domain(&slot.claim_id, &output.domain).await {
                            warn!(
                                claim_id = %slot.claim_id,
                                slot_id = %slot.id,
                                "Domain write-back failed: {}", e
                            );
                        } else {
                            debug!(
                                claim_id = %slot.claim_id,
                                domain = %output.domain,
                                "Claim domain set from classifier output"
                            );
                        }
                    }
                    Err(e) => {
                        warn!(
                            slot_id = %slot.id,
                            "Classifier payload did not match schema: {}", e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SlotStatus, SlotType};
    use std::sync::Mutex;

    struct RecordingDirectory {
        writes: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ClaimDirectory for RecordingDirectory {
        async fn set_domain(&self, claim_id: &str, domain: &str) -> Result<(), DirectoryError> {
            self.writes
                .lock()
                .unwrap()
                .push((claim_id.to_string(), domain.to_string()));
            Ok(())
        }
    }

    fn classified_slot(role: &str, payload: Option<serde_json::Value>) -> StageSlot {
        let mut slot = StageSlot::new(
            "slot:c:0000:00:0:00".to_string(),
            "c".to_string(),
            "standard".to_string(),
            0,
            0,
            SlotType::Work,
            role,
        );
        slot.status = SlotStatus::Done;
        slot.structured_output = payload;
        slot
    }

    #[test]
    fn test_interpreter_selection() {
        assert_eq!(
            OutputInterpreter::for_role("classifier"),
            OutputInterpreter::Classifier
        );
        assert_eq!(OutputInterpreter::for_role("critic"), OutputInterpreter::Inert);
    }

    #[tokio::test]
    async fn test_classifier_sets_domain() {
        let directory = RecordingDirectory {
            writes: Mutex::new(Vec::new()),
        };
        let slot = classified_slot(
            "classifier",
            Some(serde_json::json!({ "domain": "economics" })),
        );

        OutputInterpreter::for_role(&slot.role)
            .apply(&slot, &directory)
            .await;

        let writes = directory.writes.lock().unwrap();
        assert_eq!(writes.as_slice(), &[("c".to_string(), "economics".to_string())]);
    }

    #[tokio::test]
    async fn test_inert_role_and_bad_payload_do_nothing() {
        let directory = RecordingDirectory {
            writes: Mutex::new(Vec::new()),
        };

        let inert = classified_slot("critic", Some(serde_json::json!({ "domain": "x" })));
        OutputInterpreter::for_role(&inert.role)
            .apply(&inert, &directory)
            .await;

        let malformed = classified_slot("classifier", Some(serde_json::json!({ "other": 1 })));
        OutputInterpreter::for_role(&malformed.role)
            .apply(&malformed, &directory)
            .await;

        assert!(directory.writes.lock().unwrap().is_empty());
    }
}
