use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::Serialize;

use crate::blocks::routes as block_routes;
use crate::error::Error;
use crate::p2p::routes as network_routes;
use crate::state::AppState;
use crate::storage::routes as model_routes;

/// Tagged response envelope used by every JSON endpoint.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: String::new(),
            data: Some(data),
            error: None,
        })
    }

    pub fn ok_with_message(message: impl Into<String>, data: T) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        })
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        })
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Error::Connect { .. } | Error::MaxBackoff { .. } => StatusCode::BAD_GATEWAY,
            Error::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        }
        let body = ApiResponse::<()> {
            success: false,
            message: String::new(),
            data: None,
            error: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub time: chrono::DateTime<chrono::Utc>,
}

/// GET /health
async fn health_check() -> Json<ApiResponse<HealthStatus>> {
    ApiResponse::ok(HealthStatus {
        status: "healthy",
        time: chrono::Utc::now(),
    })
}

/// Build the full axum Router with all routes.
pub fn build_router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.max_upload_bytes());

    let health = Router::new().route("/health", get(health_check));

    let models = Router::new()
        .route(
            "/models",
            get(model_routes::list_models).post(model_routes::upload_model),
        )
        .route(
            "/models/{id}",
            get(model_routes::download_model).delete(model_routes::delete_model),
        )
        .route("/models/{id}/metadata", get(model_routes::get_model_metadata))
        .route("/storage/status", get(model_routes::storage_status));

    let network = Router::new()
        .route("/network/status", get(network_routes::network_status))
        .route("/network/peers", get(network_routes::list_peers));

    let blocks = Router::new()
        .route("/blocks", put(block_routes::put_block_route))
        .route(
            "/blocks/{hash}",
            get(block_routes::get_block_route).delete(block_routes::delete_block_route),
        );

    Router::new()
        .merge(health)
        .merge(models)
        .merge(network)
        .merge(blocks)
        .layer(body_limit)
        .with_state(state)
}
