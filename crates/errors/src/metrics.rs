use metrics::register_front_door_counter;

register_front_door_counter!(pub BAD_REQUEST_ERROR_TOTAL, "Count of bad request errors");
register_front_door_counter!(
    pub METHOD_NOT_ALLOWED_ERROR_TOTAL,
    "Count of requests rejected for using an unsupported method"
);
register_front_door_counter!(pub NOT_FOUND_ERROR_TOTAL, "Count of requests to unknown routes");
