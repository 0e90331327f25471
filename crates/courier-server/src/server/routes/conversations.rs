//! Conversation provisioning.
//!
//! - POST /conversations - Find-or-create the conversation for a user pair

use std::sync::Arc;

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};
use serde::Deserialize;
use tracing::error;

use courier_core::model::UserId;

use crate::server::AppState;

use super::ErrorResponse;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversations", post(create_conversation_handler))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest {
    user_a: UserId,
    user_b: UserId,
}

/// POST /conversations
///
/// Idempotent and order-independent: {A,B} and {B,A} resolve to the same
/// conversation row.
async fn create_conversation_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateConversationRequest>,
) -> impl IntoResponse {
    if request.user_a.0 <= 0 || request.user_b.0 <= 0 {
        return ErrorResponse::new("invalid_request", "user ids must be positive").into_response();
    }
    if request.user_a == request.user_b {
        return ErrorResponse::new("invalid_request", "a conversation needs two distinct users")
            .into_response();
    }

    match state
        .store
        .find_or_create_conversation(request.user_a, request.user_b)
        .await
    {
        Ok(conversation) => (StatusCode::OK, Json(conversation)).into_response(),
        Err(e) => {
            error!(error = %e, "failed to resolve conversation");
            ErrorResponse::new("database_error", e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::server::routes::test_support;

    fn request(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/conversations")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn pair_resolves_to_one_conversation_either_way_round() {
        let app = router(test_support::state());

        let response = app
            .clone()
            .oneshot(request(serde_json::json!({"userA": 1, "userB": 2})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let first: serde_json::Value = serde_json::from_slice(&body).unwrap();

        let response = app
            .oneshot(request(serde_json::json!({"userA": 2, "userB": 1})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let second: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(first["id"], second["id"]);
    }

    #[tokio::test]
    async fn rejects_self_conversations_and_bad_ids() {
        let app = router(test_support::state());

        for body in [
            serde_json::json!({"userA": 1, "userB": 1}),
            serde_json::json!({"userA": 0, "userB": 2}),
            serde_json::json!({"userA": -3, "userB": 2}),
        ] {
            let response = app.clone().oneshot(request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }
}
