use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build the status Router of a pipeline process: `/metrics` and `/_liveness`.
pub fn setup_status_router(service: &'static str, liveness: HealthRegistry) -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route("/", get(move || ready(service)))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route(
            "/metrics",
            get(move || ready(recorder_handle.render())),
        )
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Per-record latencies sit well below a millisecond, reconnects take seconds
    const BUCKETS: &[f64] = &[
        0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)
        .unwrap()
        .install_recorder()
        .unwrap()
}
