//! HTTP API layer with Axum routes.
//!
//! This crate provides:
//! - The `/files` routes (list, upload, delete) and `/health`
//! - The adapter turning axum's multipart extractor into upload events
//! - Error to response mapping

pub mod error;
pub mod multipart;
pub mod routes;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{Method, header};
use stowage_core::UploadService;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Upload pipeline over every configured transport.
    pub uploads: Arc<UploadService>,
    /// Directory receiving in-flight uploads.
    pub tmp_dir: Arc<PathBuf>,
    /// URL path prefix of the files routes.
    pub upload_url: Arc<str>,
    /// Build `https` URLs.
    pub use_ssl: bool,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(uploads: UploadService, tmp_dir: PathBuf, upload_url: &str, use_ssl: bool) -> Self {
        Self {
            uploads: Arc::new(uploads),
            tmp_dir: Arc::new(tmp_dir),
            upload_url: Arc::from(upload_url),
            use_ssl,
        }
    }
}

/// Creates the main application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::api_routes(&state.upload_url))
        // Body size is enforced by the upload pipeline's post size cutoff.
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([
                    Method::OPTIONS,
                    Method::HEAD,
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::DELETE,
                ])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::CONTENT_RANGE,
                    header::CONTENT_DISPOSITION,
                ]),
        )
        .with_state(state)
}
