use axum::{
    routing::any,
    Router,
};

use crate::invoke::{
    invoke_function,
    invoke_function_with_path,
    missing_function_name,
    not_found,
    FrontDoorState,
};

/// Invocation routes. Every method is routed so that unsupported ones get a
/// 405 from the handler rather than falling through.
pub fn router(st: FrontDoorState) -> Router {
    Router::new()
        .route("/function", any(missing_function_name))
        .route("/function/", any(missing_function_name))
        .route("/function/{name}", any(invoke_function))
        .route("/function/{name}/", any(invoke_function))
        .route("/function/{name}/{*params}", any(invoke_function_with_path))
        .fallback(not_found)
        .with_state(st)
}
