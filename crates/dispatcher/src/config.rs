use std::{
    fmt,
    str::FromStr,
    time::Duration,
};

use crate::knobs::{
    BATCH_PROBE_CHANNEL_CAPACITY,
    BATCH_PROBE_DEADLINE,
};

/// What the random fallback does when every agent is at the load ceiling.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Dispatch to the last agent drawn, overfilling it.
    #[default]
    LastDraw,
    /// Dispatch to the agent with the fewest in-flight requests, lowest id on
    /// ties.
    LeastLoaded,
}

impl FromStr for FallbackPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "last-draw" | "last_draw" => Ok(Self::LastDraw),
            "least-loaded" | "least_loaded" => Ok(Self::LeastLoaded),
            _ => anyhow::bail!("Unknown fallback policy {s:?}, expected last-draw or least-loaded"),
        }
    }
}

impl fmt::Display for FallbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastDraw => write!(f, "last-draw"),
            Self::LeastLoaded => write!(f, "least-loaded"),
        }
    }
}

/// Which placement cache, if any, steers repeat requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlacementMode {
    Disabled,
    ByFunction,
    ByFingerprint,
}

/// Startup configuration of the dispatcher. The agent table is fixed for the
/// lifetime of the process; an agent's id is its index in `agents`.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub use_result_cache: bool,
    pub result_cache_size: usize,
    pub use_placement_cache_by_function: bool,
    pub use_placement_cache_by_fingerprint: bool,
    pub placement_cache_size: usize,
    pub use_batch_probe: bool,
    pub batch_probe_period: Duration,
    pub batch_probe_deadline: Duration,
    pub batch_probe_channel_capacity: usize,
    pub file_caching_mode: bool,
    pub per_agent_load_ceiling: usize,
    pub fallback_policy: FallbackPolicy,
    pub agents: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            use_result_cache: false,
            result_cache_size: 5,
            use_placement_cache_by_function: false,
            use_placement_cache_by_fingerprint: false,
            placement_cache_size: 5,
            use_batch_probe: false,
            batch_probe_period: Duration::from_millis(50),
            batch_probe_deadline: *BATCH_PROBE_DEADLINE,
            batch_probe_channel_capacity: *BATCH_PROBE_CHANNEL_CAPACITY,
            file_caching_mode: false,
            per_agent_load_ceiling: 6,
            fallback_policy: FallbackPolicy::default(),
            agents: vec![],
        }
    }
}

impl DispatcherConfig {
    pub fn placement_mode(&self) -> PlacementMode {
        if self.use_placement_cache_by_function {
            PlacementMode::ByFunction
        } else if self.use_placement_cache_by_fingerprint {
            PlacementMode::ByFingerprint
        } else {
            PlacementMode::Disabled
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.agents.is_empty(), "At least one agent address is required");
        for (id, address) in self.agents.iter().enumerate() {
            anyhow::ensure!(!address.trim().is_empty(), "Agent {id} has an empty address");
        }
        anyhow::ensure!(
            !(self.use_placement_cache_by_function && self.use_placement_cache_by_fingerprint),
            "At most one placement cache can be active"
        );
        if self.use_result_cache {
            anyhow::ensure!(self.result_cache_size > 0, "result_cache_size must be positive");
        }
        if self.placement_mode() != PlacementMode::Disabled {
            anyhow::ensure!(
                self.placement_cache_size > 0,
                "placement_cache_size must be positive"
            );
        }
        if self.use_batch_probe {
            anyhow::ensure!(
                !self.batch_probe_period.is_zero(),
                "batch_probe_period must be positive"
            );
            anyhow::ensure!(
                self.batch_probe_channel_capacity > 0,
                "batch_probe_channel_capacity must be positive"
            );
        }
        anyhow::ensure!(
            self.per_agent_load_ceiling > 0,
            "per_agent_load_ceiling must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        DispatcherConfig,
        FallbackPolicy,
        PlacementMode,
    };

    fn four_agents() -> DispatcherConfig {
        DispatcherConfig {
            agents: (0..4).map(|i| format!("10.0.0.{i}:8080")).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_match_reference_values() {
        let config = DispatcherConfig::default();
        assert_eq!(config.result_cache_size, 5);
        assert_eq!(config.placement_cache_size, 5);
        assert_eq!(config.per_agent_load_ceiling, 6);
        assert_eq!(config.batch_probe_period.as_millis(), 50);
        assert_eq!(config.fallback_policy, FallbackPolicy::LastDraw);
        assert_eq!(config.placement_mode(), PlacementMode::Disabled);
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(DispatcherConfig::default().validate().is_err());
        four_agents().validate().unwrap();

        let both = DispatcherConfig {
            use_placement_cache_by_function: true,
            use_placement_cache_by_fingerprint: true,
            ..four_agents()
        };
        assert!(both.validate().is_err());

        let zero_ceiling = DispatcherConfig {
            per_agent_load_ceiling: 0,
            ..four_agents()
        };
        assert!(zero_ceiling.validate().is_err());

        let empty_cache = DispatcherConfig {
            use_result_cache: true,
            result_cache_size: 0,
            ..four_agents()
        };
        assert!(empty_cache.validate().is_err());
    }

    #[test]
    fn test_fallback_policy_parses() -> anyhow::Result<()> {
        assert_eq!("least-loaded".parse::<FallbackPolicy>()?, FallbackPolicy::LeastLoaded);
        assert_eq!("last_draw".parse::<FallbackPolicy>()?, FallbackPolicy::LastDraw);
        assert!("round-robin".parse::<FallbackPolicy>().is_err());
        Ok(())
    }
}
