use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MATCH_LISTING_LIMIT;
use crate::db::models::MatchListingRow;
use crate::error::AppError;
use crate::fetcher::SourceStatus;
use crate::monitor::{FixtureReport, MonitorReport, MonitorService, OddsReport, StatsReport};

#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<MonitorService>,
}

/// Operator hooks: trigger each cycle by hand, send a test message,
/// read counters, the source quota and the recent match listing.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/admin/fetch-fixtures", post(fetch_fixtures))
        .route("/admin/fetch-odds", post(fetch_odds))
        .route("/admin/monitor-matches", post(monitor_matches))
        .route("/admin/test-notification", post(test_notification))
        .route("/admin/stats", get(get_stats))
        .route("/admin/matches", get(get_matches))
        .route("/admin/source-status", get(get_source_status))
        .route("/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FixturesQuery {
    /// YYYY-MM-DD, defaults to today (UTC).
    pub date: Option<NaiveDate>,
}

#[derive(Deserialize)]
pub struct MatchesQuery {
    #[serde(default)]
    pub monitored_only: bool,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub message: String,
}

#[derive(Serialize)]
pub struct MatchesResponse {
    pub count: usize,
    pub matches: Vec<MatchListingRow>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn fetch_fixtures(
    State(state): State<ApiState>,
    Query(params): Query<FixturesQuery>,
) -> Result<Json<FixtureReport>, AppError> {
    let now = Utc::now();
    let date = params.date.unwrap_or_else(|| now.date_naive());
    Ok(Json(state.monitor.refresh_fixtures(date, now).await?))
}

async fn fetch_odds(State(state): State<ApiState>) -> Result<Json<OddsReport>, AppError> {
    Ok(Json(state.monitor.refresh_odds(Utc::now()).await?))
}

async fn monitor_matches(State(state): State<ApiState>) -> Result<Json<MonitorReport>, AppError> {
    Ok(Json(state.monitor.run_monitor_cycle(Utc::now()).await?))
}

async fn test_notification(State(state): State<ApiState>) -> Result<Json<StatusResponse>, AppError> {
    state.monitor.send_test_notification().await?;
    Ok(Json(StatusResponse {
        status: "success",
        message: "Test message sent".to_string(),
    }))
}

async fn get_stats(State(state): State<ApiState>) -> Result<Json<StatsReport>, AppError> {
    Ok(Json(state.monitor.stats().await?))
}

async fn get_matches(
    State(state): State<ApiState>,
    Query(params): Query<MatchesQuery>,
) -> Result<Json<MatchesResponse>, AppError> {
    let matches = state
        .monitor
        .store()
        .list_matches(params.monitored_only, MATCH_LISTING_LIMIT)
        .await?;
    Ok(Json(MatchesResponse { count: matches.len(), matches }))
}

async fn get_source_status(State(state): State<ApiState>) -> Result<Json<SourceStatus>, AppError> {
    Ok(Json(state.monitor.source_status().await?))
}

async fn health() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok",
        message: "favorite-alerts running".to_string(),
    })
}
