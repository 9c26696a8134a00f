use std::sync::Arc;

use axum::{
    body::Body,
    extract::{
        Path,
        Request,
        State,
    },
    response::Response,
};
use bytes::Bytes;
use dispatcher::{
    knobs::MAX_REQUEST_BODY_BYTES,
    wire::{
        parse_response,
        serialize_request,
    },
    Dispatcher,
    Invocation,
};
use errors::ErrorMetadata;
use http::{
    header::CONTENT_TYPE,
    HeaderValue,
    Method,
};

use crate::http::HttpResponseError;

#[derive(Clone)]
pub struct FrontDoorState {
    pub dispatcher: Arc<Dispatcher>,
}

impl FrontDoorState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

pub async fn invoke_function(
    State(st): State<FrontDoorState>,
    Path(function_name): Path<String>,
    request: Request,
) -> Result<Response, HttpResponseError> {
    invoke(&st, function_name, String::new(), request).await
}

pub async fn invoke_function_with_path(
    State(st): State<FrontDoorState>,
    Path((function_name, extra_path)): Path<(String, String)>,
    request: Request,
) -> Result<Response, HttpResponseError> {
    invoke(&st, function_name, extra_path, request).await
}

pub async fn missing_function_name() -> Result<Response, HttpResponseError> {
    Err(missing_function_name_error().into())
}

fn missing_function_name_error() -> anyhow::Error {
    anyhow::anyhow!(ErrorMetadata::bad_request(
        "MissingFunctionName",
        "Provide a function name: /function/{name}",
    ))
}

pub async fn not_found(request: Request) -> HttpResponseError {
    anyhow::anyhow!(ErrorMetadata::not_found(
        "RouteNotFound",
        format!("No route for {}", request.uri().path()),
    ))
    .into()
}

fn check_method(method: &Method) -> anyhow::Result<()> {
    match *method {
        Method::GET | Method::POST | Method::PUT | Method::PATCH | Method::DELETE => Ok(()),
        _ => Err(anyhow::anyhow!(ErrorMetadata::method_not_allowed(method))),
    }
}

async fn invoke(
    st: &FrontDoorState,
    function_name: String,
    extra_path: String,
    request: Request,
) -> Result<Response, HttpResponseError> {
    check_method(request.method())?;
    if function_name.is_empty() {
        return Err(missing_function_name_error().into());
    }
    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, *MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| {
            anyhow::anyhow!(ErrorMetadata::internal(
                "RequestBodyUnreadable",
                format!("Failed to read the request body: {e}"),
            ))
        })?;
    let fingerprint = st.dispatcher.fingerprint(&function_name, &body)?;
    let request_content_type = parts.headers.get(CONTENT_TYPE).cloned();
    let request = http::Request::from_parts(parts, body);

    let dispatched = st
        .dispatcher
        .invoke(Invocation {
            function_name,
            extra_path,
            request: serialize_request(&request),
            fingerprint,
        })
        .await?;
    let reply = parse_response(&dispatched.response).map_err(|e| {
        anyhow::anyhow!(ErrorMetadata::internal(
            "UnparsableAgentReply",
            format!("The agent reply could not be parsed: {e}"),
        ))
    })?;
    Ok(client_response(reply, request_content_type))
}

/// The agent's reply with `Content-Type` taken from the reply, else the
/// request, else `text/plain`.
fn client_response(reply: http::Response<Bytes>, request_content_type: Option<HeaderValue>) -> Response {
    let (mut parts, body) = reply.into_parts();
    if !parts.headers.contains_key(CONTENT_TYPE) {
        let content_type =
            request_content_type.unwrap_or_else(|| HeaderValue::from_static("text/plain"));
        parts.headers.insert(CONTENT_TYPE, content_type);
    }
    Response::from_parts(parts, Body::from(body))
}
