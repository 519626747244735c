use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::sync::watch;

use crate::consumer::ConsumerState;

pub async fn index() -> &'static str {
    "ingest consumer"
}

/// Ready only while the consumer is subscribed and receiving deliveries.
async fn readiness(State(state): State<watch::Receiver<ConsumerState>>) -> impl IntoResponse {
    let current = *state.borrow();
    let status = match current {
        ConsumerState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, current.to_string())
}

pub fn router(state: watch::Receiver<ConsumerState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/_readiness", get(readiness))
        .with_state(state)
}

/// Add the prometheus endpoint. Installs the global recorder, so it can only
/// succeed once per process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router.route(
        "/metrics",
        get(move || ready(recorder_handle.render())),
    ))
}

fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}
