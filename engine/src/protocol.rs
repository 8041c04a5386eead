//! Protocol templates - ordered layer definitions for deliberation
//!
//! A protocol is an immutable, ordered list of layers. Each layer names
//! the worker roles it needs (with counts), how many consensus reviews
//! gate it, and the confidence threshold those reviews must average.
//! Protocols are write-once in the store: a live pipeline may reference
//! them, and mutation would corrupt in-flight pipelines.

use serde::{Deserialize, Serialize};

use crate::state::ProtocolId;

/// Error type for protocol validation
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Protocol has no layers")]
    Empty,

    #[error("Layer {position} has index {index}; indices must start at 0 and increase by 1")]
    NonMonotonicLayers { position: usize, index: u32 },

    #[error("Layer {index} has no work roles")]
    NoRoles { index: u32 },

    #[error("Layer {index} role '{role}' has zero count")]
    ZeroRoleCount { index: u32, role: String },

    #[error("Layer {index} threshold {threshold} outside [0, 1]")]
    ThresholdOutOfRange { index: u32, threshold: f32 },
}

/// One required worker role within a layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRequirement {
    /// Role name, e.g. "critic", "supporter", "classifier"
    pub role: String,
    /// How many slots of this role the layer needs
    pub count: u32,
}

impl RoleRequirement {
    pub fn new(role: impl Into<String>, count: u32) -> Self {
        Self {
            role: role.into(),
            count,
        }
    }
}

/// One ordered stage of a protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    /// Layer index, unique and monotonically increasing within the protocol
    pub index: u32,

    /// Human-readable layer name
    pub name: String,

    /// Required worker roles with counts
    pub roles: Vec<RoleRequirement>,

    /// Number of consensus review slots; 0 skips peer review for this layer
    pub consensus_count: u32,

    /// Average confidence the consensus reviews must reach, in [0, 1]
    pub consensus_threshold: f32,
}

impl LayerSpec {
    /// Total number of work slots this layer opens
    pub fn work_slot_count(&self) -> u32 {
        self.roles.iter().map(|r| r.count).sum()
    }

    /// Expand role requirements into one role name per slot instance
    pub fn role_instances(&self) -> Vec<String> {
        let mut roles = Vec::with_capacity(self.work_slot_count() as usize);
        for req in &self.roles {
            for _ in 0..req.count {
                roles.push(req.role.clone());
            }
        }
        roles
    }
}

/// An ordered, immutable template of deliberation layers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Protocol {
    /// Protocol id, referenced by pipelines
    pub id: ProtocolId,

    /// Human-readable name
    pub name: String,

    /// Short description of what the protocol deliberates
    pub description: String,

    /// Ordered layers
    pub layers: Vec<LayerSpec>,
}

impl Protocol {
    /// Validate structural invariants before storing
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.layers.is_empty() {
            return Err(ProtocolError::Empty);
        }
        for (position, layer) in self.layers.iter().enumerate() {
            if layer.index as usize != position {
                return Err(ProtocolError::NonMonotonicLayers {
                    position,
                    index: layer.index,
                });
            }
            if layer.roles.is_empty() {
                return Err(ProtocolError::NoRoles { index: layer.index });
            }
            for req in &layer.roles {
                if req.count == 0 {
                    return Err(ProtocolError::ZeroRoleCount {
                        index: layer.index,
                        role: req.role.clone(),
                    });
                }
            }
            if !(0.0..=1.0).contains(&layer.consensus_threshold) {
                return Err(ProtocolError::ThresholdOutOfRange {
                    index: layer.index,
                    threshold: layer.consensus_threshold,
                });
            }
        }
        Ok(())
    }

    /// Look up a layer by index
    pub fn layer(&self, index: u32) -> Option<&LayerSpec> {
        self.layers.get(index as usize)
    }

    /// Whether the given layer is the last one
    pub fn is_last_layer(&self, index: u32) -> bool {
        index as usize + 1 == self.layers.len()
    }

    /// Number of layers
    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    /// Built-in default: classify, then critique under consensus review
    pub fn standard_review() -> Self {
        Self {
            id: "standard-review".to_string(),
            name: "Standard Review".to_string(),
            description: "Classification followed by adversarial critique with peer consensus"
                .to_string(),
            layers: vec![
                LayerSpec {
                    index: 0,
                    name: "classification".to_string(),
                    roles: vec![RoleRequirement::new("classifier", 1)],
                    consensus_count: 0,
                    consensus_threshold: 0.0,
                },
                LayerSpec {
                    index: 1,
                    name: "critique".to_string(),
                    roles: vec![
                        RoleRequirement::new("critic", 2),
                        RoleRequirement::new("supporter", 1),
                    ],
                    consensus_count: 2,
                    consensus_threshold: 0.7,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_review_is_valid() {
        let protocol = Protocol::standard_review();
        protocol.validate().unwrap();
        assert_eq!(protocol.layer_count(), 2);
        assert!(protocol.is_last_layer(1));
        assert!(!protocol.is_last_layer(0));
    }

    #[test]
    fn test_role_instances_expand_counts() {
        let protocol = Protocol::standard_review();
        let roles = protocol.layer(1).unwrap().role_instances();
        assert_eq!(roles, vec!["critic", "critic", "supporter"]);
        assert_eq!(protocol.layer(1).unwrap().work_slot_count(), 3);
    }

    #[test]
    fn test_validate_rejects_bad_indices() {
        let mut protocol = Protocol::standard_review();
        protocol.layers[1].index = 5;
        assert!(matches!(
            protocol.validate(),
            Err(ProtocolError::NonMonotonicLayers { position: 1, .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_and_threshold() {
        let empty = Protocol {
            id: "x".into(),
            name: "x".into(),
            description: String::new(),
            layers: vec![],
        };
        assert!(matches!(empty.validate(), Err(ProtocolError::Empty)));

        let mut protocol = Protocol::standard_review();
        protocol.layers[1].consensus_threshold = 1.5;
        assert!(matches!(
            protocol.validate(),
            Err(ProtocolError::ThresholdOutOfRange { index: 1, .. })
        ));
    }
}
