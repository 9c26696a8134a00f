use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution,
    register_front_door_counter,
    register_front_door_histogram,
    MetricLabel,
    StatusTimer,
    STATUS_LABEL,
};

register_front_door_counter!(
    DISPATCHER_RESULT_CACHE_HITS,
    "Invocations answered from the result cache"
);
pub fn log_result_cache_hit() {
    log_counter(&DISPATCHER_RESULT_CACHE_HITS, 1);
}

register_front_door_counter!(
    DISPATCHER_PLACEMENT_CACHE_HITS,
    "Invocations steered to an agent by the placement cache"
);
pub fn log_placement_cache_hit() {
    log_counter(&DISPATCHER_PLACEMENT_CACHE_HITS, 1);
}

register_front_door_counter!(
    DISPATCHER_BATCH_PROBE_HITS,
    "Invocations answered or steered by a batch probe reply"
);
pub fn log_batch_probe_hit() {
    log_counter(&DISPATCHER_BATCH_PROBE_HITS, 1);
}

register_front_door_counter!(
    DISPATCHER_PLACEMENT_MISSES,
    "Invocations placed by the random fallback while a placement cache is active"
);
pub fn log_placement_miss() {
    log_counter(&DISPATCHER_PLACEMENT_MISSES, 1);
}

register_front_door_counter!(
    DISPATCHER_LOAD_REJECTED_TOTAL,
    "Cache or probe hits ignored because the agent was at its load ceiling"
);
pub fn log_load_rejected() {
    log_counter(&DISPATCHER_LOAD_REJECTED_TOTAL, 1);
}

register_front_door_counter!(
    DISPATCHER_FALLBACK_OVERFILL_TOTAL,
    "Random fallback selections made while every agent was at its load ceiling"
);
pub fn log_fallback_overfill() {
    log_counter(&DISPATCHER_FALLBACK_OVERFILL_TOTAL, 1);
}

register_front_door_histogram!(
    DISPATCHER_DECISION_SECONDS,
    "Time from receiving an invocation to selecting an agent or cached reply"
);
pub fn log_decision_latency(seconds: f64) {
    log_distribution(&DISPATCHER_DECISION_SECONDS, seconds);
}

register_front_door_histogram!(
    AGENT_RPC_SECONDS,
    "Duration of an execution RPC to an agent",
    &STATUS_LABEL
);
pub fn agent_rpc_timer() -> StatusTimer {
    StatusTimer::new(&AGENT_RPC_SECONDS)
}

register_front_door_counter!(
    AGENT_RPC_ERRORS,
    "Failed execution RPCs to agents",
    &["kind"]
);
pub fn log_agent_rpc_error(kind: &'static str) {
    log_counter_with_labels(
        &AGENT_RPC_ERRORS,
        1,
        vec![MetricLabel::new_const("kind", kind)],
    );
}

register_front_door_counter!(BATCH_PROBE_ROUNDS, "Batch probe rounds sent to the agents");
pub fn log_probe_round() {
    log_counter(&BATCH_PROBE_ROUNDS, 1);
}

register_front_door_histogram!(
    BATCH_PROBE_FINGERPRINTS_TOTAL,
    "Number of fingerprints coalesced into one batch probe round"
);
pub fn log_probe_round_size(size: usize) {
    log_distribution(&BATCH_PROBE_FINGERPRINTS_TOTAL, size as f64);
}

register_front_door_counter!(
    BATCH_PROBE_AGENT_ERRORS,
    "Per-agent batch probe RPCs that failed"
);
pub fn log_probe_agent_failure() {
    log_counter(&BATCH_PROBE_AGENT_ERRORS, 1);
}

register_front_door_counter!(
    BATCH_PROBE_DEADLINE_TIMEOUTS,
    "Batch probe waits abandoned at the probe deadline"
);
pub fn log_probe_deadline_exceeded() {
    log_counter(&BATCH_PROBE_DEADLINE_TIMEOUTS, 1);
}
