//! Media upload and download.
//!
//! - PUT /api/upload/:filename - Store a media blob, returns its durable URL
//! - GET /api/files/:filename - Serve a stored blob
//!
//! Uploads are capped in size, restricted to a media extension allow-list,
//! and stored under a server-chosen name (original stem plus a millisecond
//! timestamp) so concurrent uploads of the same filename never collide.
//! The returned URL is what clients pass as `mediaRef` in `sendMessage`.

use std::path::Path as FilePath;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;
use tokio::fs;
use tracing::{error, info, warn};

use crate::server::AppState;

use super::ErrorResponse;

/// Extensions accepted for upload.
const ALLOWED_EXTENSIONS: &[&str] = &["jpeg", "jpg", "png", "gif", "mp4", "avi", "mov"];

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_upload_bytes as usize;
    Router::new()
        .route("/api/upload/:filename", put(upload_handler))
        .route("/api/files/:filename", get(download_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    url: String,
}

/// Splits a client filename into (stem, extension), rejecting anything that
/// could escape the upload directory.
fn split_filename(filename: &str) -> Option<(&str, &str)> {
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return None;
    }
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some((stem, ext))
}

fn content_type_for(ext: &str) -> &'static str {
    match ext {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        _ => "application/octet-stream",
    }
}

/// PUT /api/upload/:filename
async fn upload_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    body: Bytes,
) -> impl IntoResponse {
    let Some((stem, ext)) = split_filename(&filename) else {
        warn!(filename = %filename, "rejected upload filename");
        return ErrorResponse::new("invalid_request", "invalid filename").into_response();
    };
    let ext = ext.to_ascii_lowercase();
    if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
        return ErrorResponse::new(
            "invalid_request",
            format!("extension '{ext}' is not an accepted media type"),
        )
        .into_response();
    }
    if body.len() as u64 > state.config.max_upload_bytes {
        return ErrorResponse::new(
            "payload_too_large",
            format!("upload exceeds {} bytes", state.config.max_upload_bytes),
        )
        .into_response();
    }

    if let Err(e) = fs::create_dir_all(&state.config.upload_dir).await {
        error!(error = %e, "failed to create upload directory");
        return ErrorResponse::new("storage_error", e.to_string()).into_response();
    }

    let stored_name = format!("{stem}-{}.{ext}", chrono::Utc::now().timestamp_millis());
    let path = state.config.upload_dir.join(&stored_name);
    if let Err(e) = fs::write(&path, &body).await {
        error!(error = %e, path = %path.display(), "failed to write upload");
        return ErrorResponse::new("storage_error", e.to_string()).into_response();
    }

    info!(bytes = body.len(), file = %stored_name, "upload stored");
    (
        StatusCode::CREATED,
        Json(UploadResponse {
            url: format!("/api/files/{stored_name}"),
        }),
    )
        .into_response()
}

/// GET /api/files/:filename
async fn download_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> impl IntoResponse {
    if split_filename(&filename).is_none() {
        return ErrorResponse::new("invalid_request", "invalid filename").into_response();
    }

    let path = state.config.upload_dir.join(&filename);
    let contents = match fs::read(&path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return ErrorResponse::new("not_found", format!("file '{filename}' not found"))
                .into_response();
        }
        Err(e) => {
            error!(error = %e, path = %path.display(), "failed to read file");
            return ErrorResponse::new("storage_error", e.to_string()).into_response();
        }
    };

    let ext = FilePath::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    let mut headers = HeaderMap::new();
    if let Ok(value) = content_type_for(&ext).parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = "public, max-age=31536000, immutable".parse() {
        headers.insert(header::CACHE_CONTROL, value);
    }

    (StatusCode::OK, headers, contents).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::server::routes::test_support;

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let state = test_support::state();
        let app = router(state.clone());
        let content = b"\x89PNG fake image bytes";

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/upload/cat.png")
                    .body(Body::from(content.to_vec()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let url = json["url"].as_str().unwrap().to_string();
        assert!(url.starts_with("/api/files/cat-"));
        assert!(url.ends_with(".png"));

        let response = app
            .oneshot(Request::builder().uri(&url).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "image/png"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), content);

        std::fs::remove_dir_all(&state.config.upload_dir).ok();
    }

    #[tokio::test]
    async fn rejects_disallowed_extensions() {
        let app = router(test_support::state());

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/api/upload/payload.sh")
                    .body(Body::from("echo pwned"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rejects_path_traversal() {
        let app = router(test_support::state());

        // %2e%2e%2f decodes to "../" inside the path segment.
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/files/%2e%2e%2fsecret.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_file_is_404() {
        let app = router(test_support::state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/files/never-uploaded.png")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
