use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::metrics_consts::{HTTP_REQUESTS, HTTP_REQUEST_DURATION, MESSAGE_PROCESSING_DURATION};

/// Handler invocations range from sub-millisecond logging to slow downstream calls
const PROCESSING_SECONDS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

const HTTP_SECONDS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0];

/// Serve `router` on `bind` until `shutdown` is cancelled.
pub async fn serve(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Install the global Prometheus recorder. Fails if one is already installed.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .add_global_label("service", "lambda-consumer")
        .set_buckets_for_metric(
            Matcher::Full(MESSAGE_PROCESSING_DURATION.to_owned()),
            PROCESSING_SECONDS,
        )?
        .set_buckets_for_metric(Matcher::Full(HTTP_REQUEST_DURATION.to_owned()), HTTP_SECONDS)?
        .install_recorder()
}

/// Build a Router exposing `/metrics`. The caller merges in its own routes.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new().route(
        "/metrics",
        get(move || std::future::ready(recorder_handle.render())),
    ))
}

/// Middleware recording request count and latency per route.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    // Unmatched paths share one label so scanners can't inflate cardinality
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_owned(), |matched| matched.as_str().to_owned());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}
