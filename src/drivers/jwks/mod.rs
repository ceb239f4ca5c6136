use std::sync::Arc;

use anyhow::bail;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::TextEncoder;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    domain::signing_key::manager::SigningKeyManager, driven::prometheus::metrics::MetricsDriven,
};

#[derive(Clone)]
struct AppState {
    manager: Arc<SigningKeyManager>,
    metrics: Arc<MetricsDriven>,
}

pub fn router(manager: Arc<SigningKeyManager>, metrics: Arc<MetricsDriven>) -> Router {
    Router::new()
        .route("/.well-known/jwks.json", get(jwks))
        .route("/metrics", get(metrics_collected))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { manager, metrics })
}

pub async fn server(
    addr: &str,
    manager: Arc<SigningKeyManager>,
    metrics: Arc<MetricsDriven>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(manager, metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(address = addr, "JWKS server running");
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
    {
        bail!(err);
    }

    Ok(())
}

async fn jwks(State(state): State<AppState>) -> Response {
    match state.manager.public_key_set().await {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(error) => {
            error!(error = error.to_string(), "failed to serialize key set");
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}

async fn metrics_collected(State(state): State<AppState>) -> Response {
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&state.metrics.metrics_collected()) {
        Ok(v) => v.into_response(),
        Err(error) => {
            error!(?error);
            (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
        }
    }
}
