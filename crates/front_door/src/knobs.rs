//! HTTP server limits, overridable from the environment.
use std::sync::LazyLock;

use cmd_util::env::env_config;

/// Accept backlog of the listening socket.
pub static HTTP_SERVER_TCP_BACKLOG: LazyLock<u32> =
    LazyLock::new(|| env_config("HTTP_SERVER_TCP_BACKLOG", 256));

/// Requests handled at once. Further requests wait for a slot rather than
/// being rejected.
pub static HTTP_SERVER_MAX_CONCURRENT_REQUESTS: LazyLock<usize> =
    LazyLock::new(|| env_config("HTTP_SERVER_MAX_CONCURRENT_REQUESTS", 1024));

/// Tokio worker threads. Zero uses one per core.
pub static RUNTIME_WORKER_THREADS: LazyLock<usize> =
    LazyLock::new(|| env_config("RUNTIME_WORKER_THREADS", 0));
