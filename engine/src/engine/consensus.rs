//! Consensus evaluation - threshold gating of a layer's reviews
//!
//! Aggregates the confidence scores of a layer's completed consensus
//! slots with a plain arithmetic mean (no weighting) and compares the
//! result against the layer's configured threshold.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::state::StageSlot;

/// Outcome of evaluating one layer's consensus phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    /// Whether the average cleared the threshold
    pub passed: bool,
    /// Arithmetic mean of review confidences; 1.0 for a vacuous pass
    pub average: f32,
    /// The threshold the layer required
    pub threshold: f32,
    /// How many reviews were aggregated
    pub reviews: usize,
}

/// Evaluate the done consensus slots of a layer against its threshold
///
/// A layer with zero consensus slots passes vacuously: the protocol may
/// define `consensus_count = 0` for a layer that needs no peer review.
pub fn evaluate(slots: &[StageSlot], threshold: f32) -> ConsensusOutcome {
    if slots.is_empty() {
        return ConsensusOutcome {
            passed: true,
            average: 1.0,
            threshold,
            reviews: 0,
        };
    }

    let sum: f32 = slots.iter().filter_map(|s| s.confidence).sum();
    let average = sum / slots.len() as f32;
    let passed = average >= threshold;

    debug!(
        reviews = slots.len(),
        average, threshold, passed, "Consensus evaluated"
    );

    ConsensusOutcome {
        passed,
        average,
        threshold,
        reviews: slots.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SlotStatus, SlotType, StageSlot};

    fn review(idx: u32, confidence: f32) -> StageSlot {
        let mut slot = StageSlot::new(
            format!("slot:c:0000:00:1:{:02}", idx),
            "c".to_string(),
            "standard".to_string(),
            0,
            0,
            SlotType::Consensus,
            "consensus",
        );
        slot.status = SlotStatus::Done;
        slot.confidence = Some(confidence);
        slot
    }

    #[test]
    fn test_average_clears_threshold() {
        let slots = vec![review(0, 0.9), review(1, 0.8), review(2, 0.7)];

        let outcome = evaluate(&slots, 0.75);
        assert!(outcome.passed);
        assert!((outcome.average - 0.8).abs() < 1e-6);
        assert_eq!(outcome.reviews, 3);
    }

    #[test]
    fn test_average_below_threshold_fails() {
        let slots = vec![review(0, 0.9), review(1, 0.8), review(2, 0.7)];

        let outcome = evaluate(&slots, 0.85);
        assert!(!outcome.passed);
        assert!((outcome.average - 0.8).abs() < 1e-6);
        assert!((outcome.threshold - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_exact_threshold_passes() {
        let slots = vec![review(0, 0.7), review(1, 0.7)];
        let outcome = evaluate(&slots, 0.7);
        assert!(outcome.passed);
    }

    #[test]
    fn test_zero_reviews_pass_vacuously() {
        let outcome = evaluate(&[], 0.9);
        assert!(outcome.passed);
        assert_eq!(outcome.reviews, 0);
        assert!((outcome.average - 1.0).abs() < f32::EPSILON);
    }
}
