//! Account endpoints.
//!
//! - POST /signup - Find-or-create an account keyed by email
//! - GET /users - List all accounts with their presence

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::{error, info};

use crate::server::AppState;
use crate::store::NewUser;

use super::ErrorResponse;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/signup", post(signup_handler))
        .route("/users", get(list_users_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignupRequest {
    username: String,
    email: String,
    #[serde(default)]
    google_id: Option<String>,
    #[serde(default)]
    image_url: Option<String>,
}

/// POST /signup
///
/// Idempotent on email: an existing account comes back with 200, a fresh
/// one with 201.
async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SignupRequest>,
) -> impl IntoResponse {
    let username = request.username.trim();
    let email = request.email.trim();
    if username.is_empty() || email.is_empty() {
        return ErrorResponse::new("invalid_request", "username and email are required")
            .into_response();
    }

    match state.store.find_user_by_email(email).await {
        Ok(Some(existing)) => (StatusCode::OK, Json(existing)).into_response(),
        Ok(None) => {
            let new = NewUser {
                username: username.to_string(),
                email: email.to_string(),
                google_id: request.google_id,
                image_url: request.image_url,
            };
            match state.store.create_user(new).await {
                Ok(user) => {
                    info!(user = %user.id, "account created");
                    (StatusCode::CREATED, Json(user)).into_response()
                }
                Err(e) => {
                    error!(error = %e, "failed to create account");
                    ErrorResponse::new("database_error", e.to_string()).into_response()
                }
            }
        }
        Err(e) => {
            error!(error = %e, "account lookup failed");
            ErrorResponse::new("database_error", e.to_string()).into_response()
        }
    }
}

/// GET /users
async fn list_users_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_users().await {
        Ok(users) => (StatusCode::OK, Json(users)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to list users");
            ErrorResponse::new("database_error", e.to_string()).into_response()
        }
    }
}
