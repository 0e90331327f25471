//! Route modules. Each exposes `router(state)` and is merged by
//! [`super::create_router`].

pub mod conversations;
pub mod uploads;
pub mod users;
pub mod websocket;

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

/// JSON error body shared by the REST endpoints.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: impl Into<String>) -> (StatusCode, Json<Self>) {
        let status = match error {
            "invalid_request" => StatusCode::BAD_REQUEST,
            "not_found" => StatusCode::NOT_FOUND,
            "payload_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(Self {
                error: error.to_string(),
                message: message.into(),
            }),
        )
    }
}
