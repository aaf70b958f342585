use crate::model::{ApiResponse, CustomerId, Rover, RoverId};
use crate::registry::SharedRegistry;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

#[derive(Clone)]
struct AppState {
    registry: SharedRegistry,
}

#[derive(Debug, Deserialize)]
pub struct RoverQuery {
    #[serde(alias = "customerId")]
    customer_id: Option<CustomerId>,
}

pub fn create_router(registry: SharedRegistry) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/api/rovers", get(list_rovers))
        .route("/api/rovers/:id", get(get_rover))
        .with_state(state)
}

async fn list_rovers(
    State(state): State<AppState>,
    Query(params): Query<RoverQuery>,
) -> Json<ApiResponse<Vec<Rover>>> {
    let rovers = state.registry.list_by_customer(params.customer_id).await;
    Json(ApiResponse::ok(rovers))
}

async fn get_rover(
    State(state): State<AppState>,
    Path(id): Path<RoverId>,
) -> Result<Json<ApiResponse<Rover>>, AppError> {
    state
        .registry
        .get(id)
        .await
        .map(|rover| Json(ApiResponse::ok(rover)))
        .ok_or_else(|| AppError::not_found(id))
}

struct AppError(StatusCode, String);

impl AppError {
    fn not_found(id: RoverId) -> Self {
        Self(StatusCode::NOT_FOUND, format!("Rover {} not found", id))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        debug!("API error {}: {}", self.0, self.1);
        (self.0, Json(json!({ "success": false, "error": self.1 }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::RoverRegistry;
    use crate::store::MemoryRoverStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn setup() -> (Router, SharedRegistry) {
        let registry = Arc::new(RoverRegistry::new(
            Arc::new(MemoryRoverStore::new()),
            Arc::new(SystemClock),
        ));
        registry.resolve_or_create("R_A", 1).await.unwrap();
        registry.resolve_or_create("R_B", 2).await.unwrap();
        (create_router(registry.clone()), registry)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_list_all_rovers() {
        let (app, _) = setup().await;
        let (status, body) = get_json(app, "/api/rovers").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"].as_array().unwrap().len(), 2);
        assert_eq!(body["data"][0]["identifier"], "R_A");
        assert!(body["data"][0]["last_seen"].is_null());
    }

    #[tokio::test]
    async fn test_filter_by_customer() {
        let (app, _) = setup().await;
        let (_, body) = get_json(app.clone(), "/api/rovers?customer_id=2").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["identifier"], "R_B");

        let (_, body) = get_json(app, "/api/rovers?customerId=1").await;
        assert_eq!(body["data"][0]["identifier"], "R_A");
    }

    #[tokio::test]
    async fn test_get_single_rover() {
        let (app, registry) = setup().await;
        let id = registry.resolve_or_create("R_A", 1).await.unwrap();

        let (status, body) = get_json(app, &format!("/api/rovers/{}", id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "REGISTERED");
    }

    #[tokio::test]
    async fn test_unknown_rover_is_404() {
        let (app, _) = setup().await;
        let (status, body) = get_json(app, "/api/rovers/999").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }
}
