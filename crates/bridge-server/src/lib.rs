//! Host process for the voice-AI bridge: the switch-facing axum WebSocket
//! listener, the FreeSWITCH ESL control-channel client, and `/metrics`.
//! All per-call behavior lives in `bridge-core`; this crate owns the
//! sockets and process lifecycle.

pub mod config;
pub mod esl;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use state::AppState;

/// The service's route table, shared by the main listener and any
/// per-transfer b-leg listeners.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/stream/:secretary_uuid/:call_uuid/:caller_id", get(ws::stream_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    let encoder = TextEncoder::new();
    let families = state.metrics.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        tracing::warn!(error = %e, "failed to encode metrics");
    }
    String::from_utf8_lossy(&buf).into_owned()
}
