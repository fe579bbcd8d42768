//! Route handlers and their request/response shapes.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use super::{ApiError, AppState};
use crate::engine::RunOutcome;
use crate::error::PipelineError;
use crate::storage::CardFilter;
use crate::types::{Language, RunLog, StoredCard};

// ---------------------------------------------------------------------------
// Request / response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ScrapeParams {
    #[serde(rename = "searchQuery", default)]
    pub search_query: String,
    pub set_name: Option<String>,
    #[serde(default = "default_language")]
    pub language: Language,
}

fn default_language() -> Language {
    Language::English
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub card_name: Option<String>,
    pub set_name: Option<String>,
    pub language: Option<Language>,
    pub market_price_min: Option<Decimal>,
    pub market_price_max: Option<Decimal>,
    pub graded_price_min: Option<Decimal>,
    pub graded_price_max: Option<Decimal>,
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    50
}

#[derive(Debug, Serialize)]
pub struct CardListResponse {
    pub cards: Vec<StoredCard>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    /// Whether any stored card was updated within the last 24 hours.
    pub is_fresh: bool,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /cards/scrape_and_save?searchQuery=...&set_name=...&language=...
pub async fn scrape_and_save(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ScrapeParams>,
) -> Result<Json<RunOutcome>, ApiError> {
    info!(search_query = %params.search_query, language = %params.language, "Scrape requested");
    let outcome = state
        .orchestrator
        .scrape_and_save(&params.search_query, params.set_name, params.language)
        .await?;
    Ok(Json(outcome))
}

/// GET /cards/:id/refresh
pub async fn refresh_card(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RunOutcome>, ApiError> {
    let outcome = state.orchestrator.refresh_card(id).await?;
    Ok(Json(outcome))
}

/// POST /cards/scrape_all_sets — kicks off a background bulk run and
/// returns immediately with the run log id to poll.
pub async fn scrape_all_sets(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let log_id = state.orchestrator.start_scrape_all_sets().await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "log_id": log_id, "message": "scrape started" })),
    ))
}

/// GET /cards with optional filters and pagination.
pub async fn list_cards(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<CardListResponse>, ApiError> {
    let filter = CardFilter {
        card_name: params.card_name,
        set_name: params.set_name,
        language: params.language,
        market_price_min: params.market_price_min,
        market_price_max: params.market_price_max,
        graded_price_min: params.graded_price_min,
        graded_price_max: params.graded_price_max,
    };
    let page = state
        .store
        .list_cards(&filter, params.page, params.page_size)
        .await?;
    Ok(Json(CardListResponse {
        cards: page.cards,
        total: page.total,
        page: params.page,
        page_size: params.page_size,
        is_fresh: page.is_fresh,
    }))
}

/// GET /logs/:id
pub async fn get_run_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<RunLog>, ApiError> {
    let log = state
        .store
        .get_run(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("run log {id}")))?;
    Ok(Json(log))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
