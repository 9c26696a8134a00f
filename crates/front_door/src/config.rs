use std::{
    fmt,
    net::Ipv4Addr,
    time::Duration,
};

use clap::Parser;
use dispatcher::{
    knobs::{
        BATCH_PROBE_CHANNEL_CAPACITY,
        BATCH_PROBE_DEADLINE,
    },
    DispatcherConfig,
    FallbackPolicy,
};

#[derive(Parser, Clone)]
#[clap(version, about = "HTTP front door dispatching function invocations to agents")]
pub struct FrontDoorConfig {
    /// Host interface to bind to
    #[clap(short, long, env = "FRONT_DOOR_INTERFACE", default_value = "0.0.0.0")]
    pub interface: Ipv4Addr,

    /// Host port to bind to
    #[clap(short, long, env = "FRONT_DOOR_PORT", default_value = "8080")]
    pub port: u16,

    /// Agent address (host:port). Repeat the flag or pass a comma-separated
    /// list; an agent's id is its position in the list.
    #[clap(
        long = "agent",
        env = "FRONT_DOOR_AGENTS",
        value_delimiter = ',',
        required = true
    )]
    pub agents: Vec<String>,

    /// Answer repeated invocations from an in-memory cache of replies
    #[clap(long, env = "FRONT_DOOR_USE_RESULT_CACHE")]
    pub use_result_cache: bool,

    #[clap(long, env = "FRONT_DOOR_RESULT_CACHE_SIZE", default_value = "5")]
    pub result_cache_size: usize,

    /// Keep sending a function to the agent that last ran it
    #[clap(
        long,
        env = "FRONT_DOOR_USE_PLACEMENT_CACHE_BY_FUNCTION",
        conflicts_with = "use_placement_cache_by_fingerprint"
    )]
    pub use_placement_cache_by_function: bool,

    /// Keep sending identical requests to the agent that last ran them
    #[clap(long, env = "FRONT_DOOR_USE_PLACEMENT_CACHE_BY_FINGERPRINT")]
    pub use_placement_cache_by_fingerprint: bool,

    #[clap(long, env = "FRONT_DOOR_PLACEMENT_CACHE_SIZE", default_value = "5")]
    pub placement_cache_size: usize,

    /// Ask every agent whether it already holds a reply before dispatching
    #[clap(long, env = "FRONT_DOOR_USE_BATCH_PROBE")]
    pub use_batch_probe: bool,

    /// How long probe requests are coalesced before a round is sent
    #[clap(long, env = "FRONT_DOOR_BATCH_PROBE_PERIOD_MS", default_value = "50")]
    pub batch_probe_period_ms: u64,

    /// How long an invocation waits for probe replies. Defaults to the
    /// BATCH_PROBE_DEADLINE_MS knob.
    #[clap(long, env = "FRONT_DOOR_BATCH_PROBE_DEADLINE_MS")]
    pub batch_probe_deadline_ms: Option<u64>,

    /// Treat request bodies as content identifiers and route to the agent
    /// holding them
    #[clap(long, env = "FRONT_DOOR_FILE_CACHING_MODE")]
    pub file_caching_mode: bool,

    /// In-flight invocations per agent above which cache hits are ignored
    #[clap(long, env = "FRONT_DOOR_PER_AGENT_LOAD_CEILING", default_value = "6")]
    pub per_agent_load_ceiling: usize,

    /// What to do when every agent is at its ceiling: last-draw or
    /// least-loaded
    #[clap(
        long,
        env = "FRONT_DOOR_FALLBACK_POLICY",
        default_value_t = FallbackPolicy::LastDraw
    )]
    pub fallback_policy: FallbackPolicy,
}

impl fmt::Debug for FrontDoorConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FrontDoorConfig")
            .field("interface", &self.interface)
            .field("port", &self.port)
            .field("agents", &self.agents)
            .finish_non_exhaustive()
    }
}

impl FrontDoorConfig {
    pub fn http_bind_address(&self) -> ([u8; 4], u16) {
        (self.interface.octets(), self.port)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            use_result_cache: self.use_result_cache,
            result_cache_size: self.result_cache_size,
            use_placement_cache_by_function: self.use_placement_cache_by_function,
            use_placement_cache_by_fingerprint: self.use_placement_cache_by_fingerprint,
            placement_cache_size: self.placement_cache_size,
            use_batch_probe: self.use_batch_probe,
            batch_probe_period: Duration::from_millis(self.batch_probe_period_ms),
            batch_probe_deadline: self
                .batch_probe_deadline_ms
                .map_or(*BATCH_PROBE_DEADLINE, Duration::from_millis),
            batch_probe_channel_capacity: *BATCH_PROBE_CHANNEL_CAPACITY,
            file_caching_mode: self.file_caching_mode,
            per_agent_load_ceiling: self.per_agent_load_ceiling,
            fallback_policy: self.fallback_policy,
            agents: self
                .agents
                .iter()
                .map(|agent| agent.trim().to_owned())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use clap::Parser;
    use dispatcher::{
        FallbackPolicy,
        PlacementMode,
    };
    use pretty_assertions::assert_eq;

    use super::FrontDoorConfig;

    #[test]
    fn test_agents_from_repeated_and_comma_separated_flags() -> anyhow::Result<()> {
        let config = FrontDoorConfig::try_parse_from([
            "front-door",
            "--agent",
            "10.0.0.1:50051,10.0.0.2:50051",
            "--agent",
            "10.0.0.3:50051",
            "--use-placement-cache-by-function",
            "--fallback-policy",
            "least-loaded",
        ])?;
        let dispatcher_config = config.dispatcher_config();
        assert_eq!(
            dispatcher_config.agents,
            vec!["10.0.0.1:50051", "10.0.0.2:50051", "10.0.0.3:50051"]
        );
        assert_eq!(dispatcher_config.placement_mode(), PlacementMode::ByFunction);
        assert_eq!(dispatcher_config.fallback_policy, FallbackPolicy::LeastLoaded);
        assert_eq!(dispatcher_config.per_agent_load_ceiling, 6);
        assert_eq!(dispatcher_config.batch_probe_period, Duration::from_millis(50));
        dispatcher_config.validate()?;
        Ok(())
    }

    #[test]
    fn test_rejects_both_placement_caches() {
        assert!(FrontDoorConfig::try_parse_from([
            "front-door",
            "--agent",
            "a:1",
            "--use-placement-cache-by-function",
            "--use-placement-cache-by-fingerprint",
        ])
        .is_err());
    }

    #[test]
    fn test_requires_an_agent() {
        assert!(FrontDoorConfig::try_parse_from(["front-door"]).is_err());
    }
}
