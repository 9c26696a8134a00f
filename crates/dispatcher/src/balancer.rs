use std::{
    fmt,
    num::NonZeroUsize,
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use bytes::Bytes;
use pb::agent::TaskRequest;

use crate::{
    agents::{
        AgentId,
        AgentTable,
        LoadGuard,
    },
    metrics::log_decision_latency,
    probe::{
        BatchProber,
        ProbeConfig,
        ProbeOutcome,
    },
    wire::parse_response,
    AgentRpc,
    DispatchStats,
    DispatcherConfig,
    Fingerprint,
    PlacementMode,
    ResultCache,
};

/// One function invocation, already serialized for the agents.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub function_name: String,
    pub extra_path: String,
    /// The inbound HTTP request in HTTP/1.1 wire format.
    pub request: Bytes,
    pub fingerprint: Fingerprint,
}

/// Where a reply came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    ResultCache,
    BatchProbe,
    Agent(AgentId),
}

impl fmt::Display for ResponseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResultCache => write!(f, "result_cache"),
            Self::BatchProbe => write!(f, "batch_probe"),
            Self::Agent(_) => write!(f, "agent"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Dispatched {
    /// The agent's HTTP reply in HTTP/1.1 wire format.
    pub response: Bytes,
    pub source: ResponseSource,
}

enum ProbeHit {
    Cached(Bytes),
    Holder(LoadGuard),
}

/// Chooses an agent for each invocation, forwards it, and caches what comes
/// back.
pub struct Dispatcher {
    config: DispatcherConfig,
    agents: Arc<AgentTable>,
    result_cache: Option<ResultCache>,
    prober: Option<BatchProber>,
    rpc: Arc<dyn AgentRpc>,
    stats: DispatchStats,
}

impl Dispatcher {
    /// Builds a dispatcher over `config.agents`. Must be called inside a tokio
    /// runtime when batch probing is on, since the probe worker is spawned
    /// here.
    pub fn new(config: DispatcherConfig, rpc: Arc<dyn AgentRpc>) -> anyhow::Result<Self> {
        config.validate()?;
        let placement_capacity = match config.placement_mode() {
            PlacementMode::Disabled => None,
            PlacementMode::ByFunction | PlacementMode::ByFingerprint => {
                NonZeroUsize::new(config.placement_cache_size)
            },
        };
        let agents = AgentTable::new(
            config.agents.clone(),
            config.per_agent_load_ceiling,
            config.fallback_policy,
            placement_capacity,
        );
        let result_cache = config
            .use_result_cache
            .then(|| NonZeroUsize::new(config.result_cache_size).map(ResultCache::new))
            .flatten();
        let prober = config.use_batch_probe.then(|| {
            BatchProber::start(
                rpc.clone(),
                config.agents.clone(),
                ProbeConfig {
                    period: config.batch_probe_period,
                    deadline: config.batch_probe_deadline,
                    channel_capacity: config.batch_probe_channel_capacity,
                    file_caching_mode: config.file_caching_mode,
                },
            )
        });
        tracing::info!(
            "Dispatching to {} agents (placement {:?}, result cache {}, batch probe {}, file \
             caching {})",
            agents.len(),
            config.placement_mode(),
            result_cache.is_some(),
            prober.is_some(),
            config.file_caching_mode,
        );
        Ok(Self {
            config,
            agents,
            result_cache,
            prober,
            rpc,
            stats: DispatchStats::default(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn agents(&self) -> &Arc<AgentTable> {
        &self.agents
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    pub fn result_cache(&self) -> Option<&ResultCache> {
        self.result_cache.as_ref()
    }

    /// Fingerprint of an invocation under this dispatcher's mode.
    pub fn fingerprint(&self, function_name: &str, body: &[u8]) -> anyhow::Result<Fingerprint> {
        Fingerprint::compute(function_name, body, self.config.file_caching_mode)
    }

    /// Answers an invocation from the result cache, a batch probe hit, or an
    /// agent, in that order. The agent's load slot is held for exactly the
    /// duration of the RPC, including when this future is dropped midway.
    pub async fn invoke(&self, invocation: Invocation) -> anyhow::Result<Dispatched> {
        let start = Instant::now();

        if let Some(cache) = &self.result_cache {
            if let Some(response) = cache.lookup(&invocation.fingerprint) {
                self.stats.record_result_cache_hit();
                return Ok(self.finish(
                    &invocation,
                    start,
                    start.elapsed(),
                    response,
                    ResponseSource::ResultCache,
                ));
            }
        }

        let mut guard = None;
        if let Some(prober) = &self.prober {
            match self.probe_stage(prober, &invocation.fingerprint).await? {
                Some(ProbeHit::Cached(response)) => {
                    self.stats.record_batch_probe_hit();
                    self.cache_reply(&invocation.fingerprint, &response);
                    return Ok(self.finish(
                        &invocation,
                        start,
                        start.elapsed(),
                        response,
                        ResponseSource::BatchProbe,
                    ));
                },
                Some(ProbeHit::Holder(holder)) => {
                    self.stats.record_batch_probe_hit();
                    guard = Some(holder);
                },
                None => {},
            }
        }
        let guard = match guard {
            Some(guard) => guard,
            None => {
                let placement_key = match self.config.placement_mode() {
                    PlacementMode::Disabled => None,
                    PlacementMode::ByFunction => Some(invocation.function_name.as_str()),
                    PlacementMode::ByFingerprint => Some(invocation.fingerprint.as_str()),
                };
                let (guard, _) = self.agents.acquire(placement_key, &self.stats)?;
                guard
            },
        };
        let decision_latency = start.elapsed();
        let agent = guard.agent_id();

        let task = TaskRequest::execution(
            invocation.function_name.clone(),
            invocation.extra_path.clone(),
            invocation.request.clone(),
        );
        let result = self.rpc.execute(guard.address(), task).await;
        drop(guard);
        let response = result?;

        self.cache_reply(&invocation.fingerprint, &response);
        Ok(self.finish(
            &invocation,
            start,
            decision_latency,
            response,
            ResponseSource::Agent(agent),
        ))
    }

    /// Waits for probe replies until one is usable. A holder at its load
    /// ceiling is skipped in favor of later replies. When several agents hold
    /// a cached reply, the first to answer wins.
    async fn probe_stage(
        &self,
        prober: &BatchProber,
        fingerprint: &Fingerprint,
    ) -> anyhow::Result<Option<ProbeHit>> {
        let mut ticket = prober.submit(fingerprint.as_str().to_owned()).await?;
        while let Some((agent, outcome)) = ticket.next().await {
            match outcome {
                ProbeOutcome::Cached(response) => return Ok(Some(ProbeHit::Cached(response))),
                ProbeOutcome::Holder(holder) => match self.agents.try_acquire(holder) {
                    Some(guard) => return Ok(Some(ProbeHit::Holder(guard))),
                    None => {
                        tracing::debug!("Agent {agent} holds {fingerprint} but is at its ceiling");
                        self.stats.record_load_rejected();
                    },
                },
                ProbeOutcome::Miss | ProbeOutcome::Unreachable => {},
            }
        }
        Ok(None)
    }

    /// Caches `response` if it parses as an HTTP reply.
    fn cache_reply(&self, fingerprint: &Fingerprint, response: &Bytes) {
        let Some(cache) = &self.result_cache else {
            return;
        };
        if let Err(e) = parse_response(response) {
            tracing::warn!("Not caching the reply for {fingerprint}: {e}");
            return;
        }
        cache.insert(fingerprint.clone(), response.clone());
    }

    fn finish(
        &self,
        invocation: &Invocation,
        start: Instant,
        decision_latency: Duration,
        response: Bytes,
        source: ResponseSource,
    ) -> Dispatched {
        let total_latency = start.elapsed();
        let accumulated = self.stats.accumulate_latency(total_latency);
        log_decision_latency(decision_latency.as_secs_f64());
        let agent = match source {
            ResponseSource::Agent(id) => Some(id),
            ResponseSource::ResultCache | ResponseSource::BatchProbe => None,
        };
        tracing::info!(
            function = %invocation.function_name,
            source = %source,
            agent = ?agent,
            decision_latency_us = decision_latency.as_micros() as u64,
            total_latency_us = total_latency.as_micros() as u64,
            accumulated_latency_us = accumulated.as_micros() as u64,
            "Invocation complete"
        );
        Dispatched { response, source }
    }
}
