//! File collection routes: list, upload and delete.

use std::pin::pin;

use axum::{
    Json, Router,
    extract::{Multipart, State},
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use futures::channel::mpsc;
use futures::future::{self, Either};
use serde::Serialize;
use serde_json::json;
use stowage_core::urls::encode_component;
use stowage_core::{Artifact, RequestContext, UploadStatus};
use tracing::{debug, info, warn};

use crate::{AppState, error::ApiError, multipart};

/// Events buffered between the multipart reader and the upload pipeline.
const EVENT_BUFFER: usize = 32;

/// Creates the file routes under `base` (empty for the root).
pub fn routes(base: &str) -> Router<AppState> {
    let collection = get(list_files).post(upload_files).put(upload_files);
    let item = format!("{base}/{{name}}");

    let router = Router::new().route(&item, delete(delete_file));
    if base.is_empty() {
        router.route("/", collection)
    } else {
        router
            .route(base, collection.clone())
            .route(&format!("{base}/"), collection)
    }
}

/// Response body of list and upload.
#[derive(Debug, Serialize)]
pub struct FilesResponse {
    /// One entry per file.
    pub files: Vec<Artifact>,
}

async fn list_files(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, ApiError> {
    let ctx = request_context(&state, &headers);
    let files = state.uploads.list(&ctx).await?;
    Ok(no_cache(FilesResponse { files }))
}

async fn upload_files(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Multipart,
) -> Result<Response, ApiError> {
    let ctx = request_context(&state, &headers);
    let (events, received) = mpsc::channel(EVENT_BUFFER);

    let pump = pin!(multipart::pump(body, &state.tmp_dir, events));
    let upload = pin!(state.uploads.upload(received, &ctx));
    // The pipeline only finishes after the last event or a cutoff, so the
    // body reader is dropped as soon as it has nothing left to deliver.
    let outcome = match future::select(upload, pump).await {
        Either::Left((outcome, _reader)) => outcome,
        Either::Right(((), upload)) => upload.await,
    }?;

    if outcome.status == UploadStatus::Aborted {
        info!(files = outcome.files.len(), "Upload aborted by client");
    }
    if !outcome.mirrors.is_empty() {
        debug!(tasks = outcome.mirrors.len(), "Shadow stores still running");
    }

    let response = FilesResponse {
        files: outcome.files,
    };
    if let Some(target) = outcome.redirect {
        if let Some(location) = redirect_location(&target, &response) {
            return Ok((StatusCode::SEE_OTHER, [(header::LOCATION, location)]).into_response());
        }
        warn!(redirect = %target, "Ignoring unusable redirect target");
    }
    Ok(no_cache(response))
}

async fn delete_file(State(state): State<AppState>, uri: Uri) -> Result<Json<serde_json::Value>, ApiError> {
    state.uploads.delete(uri.path()).await?;
    info!(path = %uri.path(), "File deleted");
    Ok(Json(json!({ "success": true })))
}

fn request_context(state: &AppState, headers: &HeaderMap) -> RequestContext {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    RequestContext::new(host, state.use_ssl)
}

/// `target` with every `%s` replaced by the encoded JSON result.
fn redirect_location(target: &str, response: &FilesResponse) -> Option<HeaderValue> {
    let location = if target.contains("%s") {
        let encoded = encode_component(&serde_json::to_string(response).ok()?);
        target.replace("%s", &encoded)
    } else {
        target.to_string()
    };
    HeaderValue::from_str(&location).ok()
}

fn no_cache(body: FilesResponse) -> Response {
    (
        [
            (header::PRAGMA, "no-cache"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate"),
            (header::CONTENT_DISPOSITION, "inline; filename=\"files.json\""),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Json(body),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use futures::{StreamExt, stream};
    use http_body_util::BodyExt;
    use regex::Regex;
    use rstest::rstest;
    use serde_json::Value;
    use stowage_core::UploadService;
    use stowage_core::transport::{LocalTransport, Transport, TransportOptions};
    use stowage_core::upload::UploadPolicy;
    use stowage_shared::VersionSpecs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::multipart::MAX_FIELD_SIZE;
    use crate::{AppState, create_router};

    const BOUNDARY: &str = "stowage-test-boundary";

    fn state(root: &Path) -> AppState {
        state_with_policy(
            root,
            UploadPolicy::new(1, 1_000, 10_000, Regex::new(".+").expect("regex")),
        )
    }

    fn state_with_policy(root: &Path, policy: UploadPolicy) -> AppState {
        let upload_dir = root.join("files");
        let tmp_dir = root.join("tmp");
        std::fs::create_dir_all(&upload_dir).expect("upload dir");
        std::fs::create_dir_all(&tmp_dir).expect("tmp dir");

        let local: Arc<dyn Transport> = Arc::new(LocalTransport::new(
            upload_dir,
            "/files/".to_string(),
            TransportOptions {
                versions: VersionSpecs::new(),
                image_types: Regex::new(r"(?i)\.(gif|jpe?g|png)$").expect("regex"),
            },
        ));
        let uploads = UploadService::new(vec![local], policy).expect("service");
        AppState::new(uploads, tmp_dir, "/files/", false)
    }

    enum Part<'a> {
        File(&'a str, &'a str),
        Text(&'a str, &'a str),
    }

    fn multipart_body(parts: &[Part<'_>]) -> String {
        let mut body = String::new();
        for part in parts {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match part {
                Part::File(name, contents) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"files[]\"; filename=\"{name}\"\r\n\
                         Content-Type: text/plain\r\n\r\n{contents}\r\n"
                    ));
                }
                Part::Text(name, value) => {
                    body.push_str(&format!(
                        "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n"
                    ));
                }
            }
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body
    }

    fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/files")
            .header("host", "example.test")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .expect("request")
    }

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "example.test")
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn test_upload_returns_files_with_urls() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let response = app
            .oneshot(upload_request(&[Part::File("hello.txt", "hello world")]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CACHE_CONTROL],
            "no-store, no-cache, must-revalidate"
        );
        assert_eq!(response.headers()[header::PRAGMA], "no-cache");

        let body = json_body(response).await;
        let file = &body["files"][0];
        assert_eq!(file["name"], "hello.txt");
        assert_eq!(file["size"], 11);
        assert_eq!(file["deleteType"], "DELETE");
        assert_eq!(file["url"], "http://example.test/files/hello.txt");
        assert!(file.get("error").is_none());
        assert!(root.path().join("files/hello.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected_per_file() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let response = app
            .oneshot(upload_request(&[
                Part::File("empty.txt", ""),
                Part::File("full.txt", "data"),
            ]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let files = body["files"].as_array().expect("files");
        assert_eq!(files.len(), 2);
        assert_eq!(files[0]["error"], "File is too small");
        assert!(files[0].get("url").is_none());
        assert_eq!(files[1]["name"], "full.txt");
        assert!(files[1].get("error").is_none());
    }

    #[tokio::test]
    async fn test_redirect_field_answers_see_other() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let response = app
            .oneshot(upload_request(&[
                Part::Text("redirect", "https://app.example/done?result=%s"),
                Part::File("hello.txt", "hello"),
            ]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = response.headers()[header::LOCATION].to_str().expect("ascii");
        assert!(location.starts_with("https://app.example/done?result=%7B%22files%22"));
        assert!(location.contains("hello.txt"));
    }

    #[tokio::test]
    async fn test_list_then_delete() {
        let root = TempDir::new().expect("tempdir");
        let state = state(root.path());

        let response = create_router(state.clone())
            .oneshot(upload_request(&[Part::File("notes.txt", "some notes")]))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);

        let response = create_router(state.clone())
            .oneshot(request("GET", "/files/"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "inline; filename=\"files.json\""
        );
        let body = json_body(response).await;
        assert_eq!(body["files"][0]["name"], "notes.txt");

        let response = create_router(state.clone())
            .oneshot(request("DELETE", "/files/notes.txt"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["success"], true);
        assert!(!root.path().join("files/notes.txt").exists());

        let response = create_router(state)
            .oneshot(request("DELETE", "/files/notes.txt"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(response).await["message"], "File not found");
    }

    #[tokio::test]
    async fn test_delete_rejects_hidden_names() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let response = app
            .oneshot(request("DELETE", "/files/.htaccess"))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "VALIDATION_ERROR");
        assert_eq!(body["message"], "File name invalid");
    }

    #[tokio::test]
    async fn test_malformed_body_is_rejected() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let request = Request::builder()
            .method("POST")
            .uri("/files")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from("this is not multipart"))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// A body that sends `head` plus `chunks` blocks of 8 KiB, then stalls.
    fn stalled_request(head: &str, chunks: usize) -> Request<Body> {
        let mut parts: Vec<Result<String, std::io::Error>> = vec![Ok(head.to_string())];
        parts.extend((0..chunks).map(|_| Ok("a".repeat(8 * 1024))));
        let body = stream::iter(parts).chain(stream::pending());

        Request::builder()
            .method("POST")
            .uri("/files")
            .header("host", "example.test")
            .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
            .body(Body::from_stream(body))
            .expect("request")
    }

    #[rstest]
    #[case::file_part(
        "Content-Disposition: form-data; name=\"files[]\"; filename=\"big.bin\"\r\n\
         Content-Type: application/octet-stream\r\n\r\n"
    )]
    #[case::text_field("Content-Disposition: form-data; name=\"notes\"\r\n\r\n")]
    #[tokio::test]
    async fn test_oversized_body_is_cut_off_while_client_stalls(#[case] part_headers: &str) {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));
        let head = format!("--{BOUNDARY}\r\n{part_headers}");

        let response = tokio::time::timeout(
            Duration::from_secs(5),
            app.oneshot(stalled_request(&head, 4)),
        )
        .await
        .expect("answered without waiting for the rest of the body")
        .expect("response");

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(json_body(response).await["error"], "PAYLOAD_TOO_LARGE");
        let leftovers = std::fs::read_dir(root.path().join("tmp")).expect("tmp dir").count();
        assert_eq!(leftovers, 0, "temp files are removed");
    }

    #[tokio::test]
    async fn test_oversized_text_field_is_rejected() {
        let root = TempDir::new().expect("tempdir");
        let open = UploadPolicy::new(0, 0, 0, Regex::new(".+").expect("regex"));
        let app = create_router(state_with_policy(root.path(), open));
        let notes = "a".repeat(MAX_FIELD_SIZE + 1);

        let response = app
            .oneshot(upload_request(&[Part::Text("notes", &notes)]))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_lists_transports() {
        let root = TempDir::new().expect("tempdir");
        let app = create_router(state(root.path()));

        let response = app.oneshot(request("GET", "/health")).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["transports"][0], "local");
    }

}
