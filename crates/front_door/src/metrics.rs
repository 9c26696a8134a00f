use std::time::Duration;

use metrics::{
    log_counter_with_labels,
    log_distribution_with_labels,
    register_front_door_counter,
    register_front_door_histogram,
    MetricLabel,
    SERVER_VERSION_STR,
};

register_front_door_histogram!(
    HTTP_HANDLE_DURATION_SECONDS,
    "Time to handle an HTTP request",
    &["endpoint", "method", "status", "server_version"]
);
pub fn log_http_request(route: &str, method: &str, status: &str, duration: Duration) {
    let labels = vec![
        MetricLabel::new("endpoint", route.to_owned()),
        MetricLabel::new("method", method.to_owned()),
        MetricLabel::new("status", status.to_owned()),
        MetricLabel::new("server_version", SERVER_VERSION_STR.clone()),
    ];
    log_distribution_with_labels(&HTTP_HANDLE_DURATION_SECONDS, duration.as_secs_f64(), labels);
}

register_front_door_counter!(
    HTTP_ERRORS_REPORTED_TOTAL,
    "Errors returned to HTTP clients, by status",
    &["status"]
);
pub fn log_error_reported(status: &str) {
    log_counter_with_labels(
        &HTTP_ERRORS_REPORTED_TOTAL,
        1,
        vec![MetricLabel::new("status", status.to_owned())],
    );
}
