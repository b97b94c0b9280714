//! API route definitions.

use axum::Router;

use crate::AppState;

pub mod files;
pub mod health;

/// Creates the API router, mounting the files routes under `upload_url`.
pub fn api_routes(upload_url: &str) -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(files::routes(&mount_point(upload_url)))
}

/// `upload_url` without its trailing slash, always rooted.
fn mount_point(upload_url: &str) -> String {
    let trimmed = upload_url.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/files/", "/files")]
    #[case("files", "/files")]
    #[case("/api/v1/files", "/api/v1/files")]
    #[case("/", "")]
    #[case("", "")]
    fn test_mount_point(#[case] upload_url: &str, #[case] expected: &str) {
        assert_eq!(mount_point(upload_url), expected);
    }
}
