//! Code for interacting with our metrics logging

use std::sync::{
    LazyLock,
    Once,
};

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
    },
    timer::StatusTimer,
};

/// Version baked in at compile time.
pub static SERVER_VERSION_STR: LazyLock<String> = LazyLock::new(|| {
    let version = env!("CARGO_PKG_VERSION").to_owned();
    INIT_VERSION_GAUGE.call_once(|| {
        FRONT_DOOR_BINARY_VERSIONS_TOTAL
            .with_label_values(&[SERVICE_NAME.as_str(), version.as_str()])
            .set(1.0);
    });
    version
});

register_front_door_gauge!(
    FRONT_DOOR_BINARY_VERSIONS_TOTAL,
    "Gauge representing the existence of a certain process at a certain version, as indicated in \
     the labels",
    &["binary", "version"]
);
static INIT_VERSION_GAUGE: Once = Once::new();
