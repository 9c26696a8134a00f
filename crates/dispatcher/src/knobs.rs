//! Tunable limits and parameters for the dispatcher.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. These are operational bounds rather than deployment choices; the
//! latter live in [`crate::DispatcherConfig`].
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Deadline for a single invocation RPC to an agent, dial included.
pub static AGENT_RPC_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("AGENT_RPC_TIMEOUT_SECS", 20)));

/// Deadline for one agent's batch probe RPC, dial included.
pub static AGENT_PROBE_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("AGENT_PROBE_TIMEOUT_SECS", 5)));

/// Connect timeout used when dialing an agent.
pub static AGENT_CONNECT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("AGENT_CONNECT_TIMEOUT_SECS", 5)));

/// How long a dispatching request waits for batch probe replies before
/// falling through to placement and random selection.
pub static BATCH_PROBE_DEADLINE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("BATCH_PROBE_DEADLINE_MS", 5000)));

/// Number of probe requests that can be queued for the next round before
/// submitters block.
pub static BATCH_PROBE_CHANNEL_CAPACITY: LazyLock<usize> =
    LazyLock::new(|| env_config("BATCH_PROBE_CHANNEL_CAPACITY", 100));

/// Largest inbound request body buffered for forwarding. 32MiB.
pub static MAX_REQUEST_BODY_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_REQUEST_BODY_BYTES", 1 << 25));

/// Largest agent reply accepted over gRPC. 64MiB.
pub static MAX_AGENT_REPLY_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("MAX_AGENT_REPLY_BYTES", 1 << 26));
