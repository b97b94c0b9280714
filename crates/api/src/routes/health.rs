//! Health check endpoint.

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: &'static str,
    /// Service version.
    pub version: &'static str,
    /// Transport kinds, reporting transport first.
    pub transports: Vec<&'static str>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uploads = &state.uploads;
    let transports = std::iter::once(uploads.reporting())
        .chain(uploads.shadows())
        .map(|transport| transport.kind())
        .collect();

    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        transports,
    })
}

/// Creates health check routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
