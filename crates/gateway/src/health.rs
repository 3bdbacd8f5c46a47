//! `/healthz`/`/readyz` — the only routes every service shell gets for
//! free, since they touch a core contract (ReadDB's lifecycle state)
//! rather than any concrete resource schema.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use kilnforge_readdb::{ReadDb, ReadDbState};
use std::sync::Arc;

/// Build a router exposing liveness (`/healthz`, always 200 once the
/// process is up) and readiness (`/readyz`, 200 only while `readdb` is
/// `Tailing`) for one service.
pub fn health_router(readdb: Arc<ReadDb>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(readdb)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn readyz(State(readdb): State<Arc<ReadDb>>) -> StatusCode {
    match readdb.state() {
        ReadDbState::Tailing => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    }
}
