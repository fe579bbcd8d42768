//! HTTP API.
//!
//! A thin axum layer over the orchestrator and the store. Handlers do
//! no business logic: they parse parameters, call into the engine, and
//! map [`PipelineError`] onto status codes.

pub mod routes;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::engine::Orchestrator;
use crate::error::PipelineError;
use crate::storage::CardStore;

/// Shared state handed to every handler.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub store: CardStore,
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/cards", get(routes::list_cards))
        .route("/cards/scrape_and_save", get(routes::scrape_and_save))
        .route("/cards/:id/refresh", get(routes::refresh_card))
        .route("/cards/scrape_all_sets", post(routes::scrape_all_sets))
        .route("/logs/:id", get(routes::get_run_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error wrapper mapping the pipeline taxonomy to HTTP statuses.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError(PipelineError::Persistence(e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}
