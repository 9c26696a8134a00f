//! Front-door dispatch core for a serverless function platform.
//!
//! Picks the worker agent for each invocation, forwards it over gRPC and
//! caches replies and placements in memory.

mod agents;
mod balancer;
mod client;
mod config;
mod fingerprint;
pub mod knobs;
mod metrics;
pub mod probe;
mod result_cache;
mod stats;
pub mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::{
    agents::{
        Agent,
        AgentId,
        AgentTable,
        LoadGuard,
        Selection,
    },
    balancer::{
        Dispatched,
        Dispatcher,
        Invocation,
        ResponseSource,
    },
    client::{
        AgentRpc,
        GrpcAgentRpc,
    },
    config::{
        DispatcherConfig,
        FallbackPolicy,
        PlacementMode,
    },
    fingerprint::Fingerprint,
    result_cache::ResultCache,
    stats::{
        DispatchStats,
        DispatchStatsSnapshot,
    },
};
