use std::{
    borrow::Cow,
    convert::Infallible,
    future::Future,
    net::SocketAddr,
    time::Instant,
};

use axum::{
    extract::{
        MatchedPath,
        Request,
    },
    middleware::Next,
    response::{
        IntoResponse,
        Response,
    },
    routing::get,
    Router,
};
use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use http::{
    header::CONTENT_TYPE,
    HeaderValue,
    StatusCode,
};
use metrics::{
    gather_metrics_text,
    log_counter,
};
use sentry::integrations::tower as sentry_tower;
use tokio::net::TcpSocket;
use tower::ServiceBuilder;

use crate::{
    knobs::HTTP_SERVER_TCP_BACKLOG,
    metrics::{
        log_error_reported,
        log_http_request,
    },
};

/// Client-facing error: a status code and a plain-text message. Built from
/// errors tagged with [`ErrorMetadata`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    status_code: StatusCode,
    /// Human-readable error code, kept for logs and tests.
    error_code: Cow<'static, str>,
    /// Detailed message sent as the response body.
    msg: Cow<'static, str>,
}

impl HttpError {
    pub fn new<S, T>(status_code: StatusCode, error_code: S, msg: T) -> Self
    where
        S: Into<Cow<'static, str>>,
        T: Into<Cow<'static, str>>,
    {
        Self {
            status_code,
            error_code: error_code.into(),
            msg: msg.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn error_code(&self) -> &str {
        &self.error_code
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn into_response(self) -> Response {
        (
            self.status_code,
            [(CONTENT_TYPE, HeaderValue::from_static("text/plain"))],
            self.msg.into_owned(),
        )
            .into_response()
    }

    // Tests parse a response back into a message
    #[cfg(any(test, feature = "testing"))]
    pub async fn from_response(response: Response) -> anyhow::Result<Self> {
        let (parts, body) = response.into_parts();
        let body = axum::body::to_bytes(body, usize::MAX).await?;
        Ok(Self {
            status_code: parts.status,
            error_code: Cow::Borrowed(""),
            msg: String::from_utf8(body.to_vec())?.into(),
        })
    }
}

/// Converts an `anyhow::Error` into the HTTP response. Every handler returns
/// this; errors are reported to Sentry in the `IntoResponse` impl, the exit
/// point of the HTTP layer.
#[derive(Debug)]
pub struct HttpResponseError {
    trace: anyhow::Error,
    http_error: HttpError,
}

impl HttpResponseError {
    pub fn http_error(&self) -> &HttpError {
        &self.http_error
    }
}

impl From<Infallible> for HttpResponseError {
    fn from(x: Infallible) -> Self {
        match x {}
    }
}

impl IntoResponse for HttpResponseError {
    fn into_response(self) -> Response {
        report_error(&self.trace);
        self.http_error.into_response()
    }
}

impl From<anyhow::Error> for HttpResponseError {
    fn from(err: anyhow::Error) -> HttpResponseError {
        let http_error = HttpError {
            status_code: err.http_status(),
            error_code: err.short_msg().to_string().into(),
            msg: err.msg().to_string().into(),
        };
        Self {
            trace: err,
            http_error,
        }
    }
}

/// Logs an error on its way to a client, counts it and, for server-side
/// failures, captures it to Sentry when a DSN is configured.
pub fn report_error(err: &anyhow::Error) {
    let status = err.http_status();
    log_error_reported(status.as_str());
    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    if status.is_server_error() {
        tracing::error!("Caught {status} error: {err_for_tracing}");
    } else {
        tracing::warn!("Caught {status} error: {err_for_tracing}");
    }
    tracing::debug!("{err:?}");

    if let Some(counter) = err.downcast_ref::<ErrorMetadata>().and_then(|e| e.custom_metric()) {
        log_counter(counter, 1);
    }
    let Some((level, _)) = err.should_report_to_sentry() else {
        return;
    };
    let Some(client) = sentry::Hub::current().client() else {
        return;
    };
    if !client.is_enabled() {
        tracing::debug!("Not reporting above error: SENTRY_DSN not set.");
        return;
    }
    let mut event = sentry::integrations::anyhow::event_from_error(err);
    event.level = level;
    event
        .tags
        .insert("short_msg".into(), err.short_msg().to_owned());
    let event_id = sentry::capture_event(event);
    tracing::error!(
        "Reporting above error to sentry with event_id {}",
        event_id.simple()
    );
}

/// Return `Result<(), MainError>` from `main` to report the error that ended
/// the process.
pub struct MainError(anyhow::Error);

impl<T: Into<anyhow::Error>> From<T> for MainError {
    fn from(e: T) -> Self {
        let err: anyhow::Error = e.into();
        report_error(&err);
        Self(err)
    }
}

impl std::fmt::Debug for MainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // `report_error` has already logged the chain.
        write!(f, "{}", self.0)
    }
}

/// Router plus the middleware and service routes of the front door.
pub struct FrontDoorHttpService {
    router: Router,
}

impl FrontDoorHttpService {
    pub fn new(router: Router, version: String, max_concurrency: usize) -> Self {
        let sentry_layer = ServiceBuilder::new()
            .layer(sentry_tower::NewSentryLayer::<_>::new_from_top())
            .layer(sentry_tower::SentryHttpLayer::new());

        let router = router
            .layer(
                ServiceBuilder::new()
                    .layer(axum::middleware::from_fn(stats_middleware))
                    .concurrency_limit(max_concurrency),
            )
            // Middleware needn't apply to these routes
            .route("/version", get(move || async move { version }))
            .route("/metrics", get(metrics))
            .layer(sentry_layer);
        Self { router }
    }

    pub async fn serve<F: Future<Output = ()> + Send + 'static>(
        self,
        addr: SocketAddr,
        shutdown: F,
    ) -> anyhow::Result<()> {
        serve_http(self.router, addr, shutdown).await
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Serves `router` on `addr` until `shutdown` resolves, then drains in-flight
/// requests.
pub async fn serve_http<F>(router: Router, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Set SO_REUSEADDR and a bounded TCP accept backlog for our server's listening
    // socket.
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_nodelay(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(*HTTP_SERVER_TCP_BACKLOG)?;

    tracing::info!("Listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("HTTP server shutdown complete");
    Ok(())
}

async fn stats_middleware(matched_path: Option<MatchedPath>, req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    // 404s lack a matched path and the raw uri is useless for aggregation.
    let route = matched_path
        .map(|r| r.as_str().to_owned())
        .unwrap_or("unknown".to_owned());

    let resp = next.run(req).await;

    log_http_request(
        &route,
        method.as_str(),
        resp.status().as_str(),
        start.elapsed(),
    );
    resp
}

pub async fn metrics() -> Result<impl IntoResponse, HttpResponseError> {
    Ok(gather_metrics_text()?)
}

/// Body of a service-route response, for tests.
#[cfg(any(test, feature = "testing"))]
pub async fn body_text(body: axum::body::Body) -> anyhow::Result<String> {
    let bytes = axum::body::to_bytes(body, usize::MAX).await?;
    Ok(String::from_utf8(bytes.to_vec())?)
}

#[cfg(test)]
mod tests {
    use axum::response::IntoResponse;
    use errors::{
        ErrorMetadata,
        INTERNAL_SERVER_ERROR,
        INTERNAL_SERVER_ERROR_MSG,
    };
    use http::StatusCode;
    use pretty_assertions::assert_eq;

    use super::{
        HttpError,
        HttpResponseError,
    };

    #[tokio::test]
    async fn test_http_response_error_internal_server_error() -> anyhow::Result<()> {
        let err_text = "some random error";
        let http_response_err: HttpResponseError = anyhow::anyhow!(err_text).into();
        assert_eq!(http_response_err.trace.to_string(), err_text);
        assert_eq!(
            HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                INTERNAL_SERVER_ERROR,
                INTERNAL_SERVER_ERROR_MSG,
            ),
            *http_response_err.http_error()
        );

        let response = http_response_err.into_response();
        assert_eq!(response.headers()["content-type"], "text/plain");
        let error = HttpError::from_response(response).await?;
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error.message(), INTERNAL_SERVER_ERROR_MSG);
        Ok(())
    }

    #[tokio::test]
    async fn test_http_error_400() -> anyhow::Result<()> {
        let middle_error = ErrorMetadata::bad_request("ErrorCode", "Nice error message!");
        let err = anyhow::anyhow!("some random error")
            .context(middle_error)
            .context("another random error");

        let http_response_err: HttpResponseError = err.into();
        assert_eq!(
            HttpError::new(StatusCode::BAD_REQUEST, "ErrorCode", "Nice error message!"),
            *http_response_err.http_error()
        );
        // The full chain is kept for reporting.
        assert!(format!("{:#}", http_response_err.trace).contains("some random error"));

        let error = HttpError::from_response(http_response_err.into_response()).await?;
        assert_eq!(error.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(error.message(), "Nice error message!");
        Ok(())
    }
}
