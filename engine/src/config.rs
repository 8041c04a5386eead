//! Engine configuration

/// Configuration for the pipeline engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Token balance an agent must hold before taking any slot
    pub stake_per_slot: u64,

    /// Reward for completing a work slot
    pub work_slot_reward: u64,

    /// Reward for completing a consensus slot
    pub consensus_slot_reward: u64,

    /// Bonus per contributing agent when a layer passes consensus
    pub layer_bonus: u64,

    /// Bonus per contributing agent when the pipeline completes
    pub pipeline_bonus: u64,

    /// Seconds a `taken` slot may sit without submission before it is
    /// eligible for reclaim
    pub taken_ttl_secs: i64,

    /// Maximum work rounds per layer, counting the initial one; bounds
    /// flagged-layer retries
    pub max_layer_rounds: u32,

    /// On-chain registry endpoint for proof-of-intelligence commits;
    /// unset disables the commit (the pipeline still completes)
    pub registry_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stake_per_slot: 10,
            work_slot_reward: 25,
            consensus_slot_reward: 15,
            layer_bonus: 50,
            pipeline_bonus: 100,
            taken_ttl_secs: 1800,
            max_layer_rounds: 3,
            registry_url: std::env::var("AGORA_REGISTRY_URL").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = EngineConfig {
            registry_url: None,
            ..Default::default()
        };
        assert!(config.stake_per_slot > 0);
        assert!(config.pipeline_bonus > config.layer_bonus);
        assert!(config.max_layer_rounds >= 1);
    }
}
