//! Prometheus exposition and the HTTP server the health checks and `/metrics` are served on.
use std::future::Future;
use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets, in seconds. Oracle calls time out after 10s by default.
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Serve `router` on `bind` until `shutdown` resolves.
pub async fn serve<F>(router: Router, bind: &str, shutdown: F) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Install the global Prometheus recorder and expose it on `/metrics`. Requests to every route
/// of `router` are measured.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = setup_metrics_recorder()?;

    Ok(router
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .layer(middleware::from_fn(track_requests)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS)?
        .install_recorder()
}

async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let path = match request.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => request.uri().path().to_owned(),
    };
    let method = request.method().to_string();

    let response = next.run(request).await;

    let labels = [
        ("method", method),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("monitor_http_requests_total", &labels).increment(1);
    metrics::histogram!("monitor_http_request_duration_seconds", &labels)
        .record(started.elapsed().as_secs_f64());

    response
}
