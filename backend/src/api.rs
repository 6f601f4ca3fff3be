//! Read-only HTTP API over bars, factors and recorded alerts.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use corelib::time::parse_timestamp;
use corelib::{Alert, AlertDetails, Bar, Factor, Symbol, TimeRange};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, instrument};

use crate::error::{AppError, StoreError};
use crate::store::{AlertQuery, AlertSink, TimeSeriesStore};

pub const DEFAULT_SERIES_LIMIT: usize = 100;
pub const DEFAULT_ALERT_LIMIT: usize = 200;
pub const MAX_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn TimeSeriesStore>,
    pub sink: Arc<dyn AlertSink>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bars/:symbol", get(bars))
        .route("/factors/:symbol", get(factors))
        .route("/alerts", get(alerts))
        .with_state(state)
}

/// Serves until ctrl-c.
pub async fn serve(addr: &str, state: ApiState) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "api", addr, "read api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(target: "api", error = %e, "failed to listen for shutdown signal");
            }
        })
        .await?;

    info!(target: "api", "read api stopped");
    Ok(())
}

/* =========================
Errors
========================= */

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        error!(target: "api", error = %e, "store request failed");
        ApiError::Internal(e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

/* =========================
Wire types
========================= */

#[derive(Clone, Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AlertParams {
    #[serde(alias = "sym")]
    pub symbol: Option<String>,
    pub since: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BarRow {
    pub symbol: Symbol,
    pub ts: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<Bar> for BarRow {
    fn from(b: Bar) -> Self {
        Self {
            symbol: b.symbol,
            ts: b.timestamp,
            open: b.open,
            high: b.high,
            low: b.low,
            close: b.close,
            volume: b.volume,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FactorRow {
    pub symbol: Symbol,
    pub ts: DateTime<Utc>,
    pub spread_bp: f64,
    pub vol_5m: Option<f64>,
    pub vol_30m: Option<f64>,
    pub fair_value: Option<f64>,
}

impl From<Factor> for FactorRow {
    fn from(f: Factor) -> Self {
        Self {
            symbol: f.symbol,
            ts: f.timestamp,
            spread_bp: f.spread_bp,
            vol_5m: f.vol_5m,
            vol_30m: f.vol_30m,
            fair_value: f.fair_value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertRow {
    pub id: i64,
    pub symbol: Symbol,
    pub ts: DateTime<Utc>,
    pub rule: String,
    pub score: f64,
    pub details: AlertDetails,
}

impl From<Alert> for AlertRow {
    fn from(a: Alert) -> Self {
        Self {
            id: a.id,
            symbol: a.symbol,
            ts: a.timestamp,
            rule: a.rule,
            score: a.score,
            details: a.details,
        }
    }
}

/// Missing → `default`; anything else is clamped to `[1, MAX_LIMIT]`.
pub fn clamp_limit(limit: Option<i64>, default: usize) -> usize {
    match limit {
        None => default,
        Some(n) => n.clamp(1, MAX_LIMIT as i64) as usize,
    }
}

/* =========================
Handlers
========================= */

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

#[instrument(skip(state), target = "api")]
pub async fn bars(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<BarRow>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_SERIES_LIMIT);
    let rows = state.store.recent_bars(&Symbol::from(symbol), limit).await?;
    Ok(Json(rows.into_iter().map(BarRow::from).collect()))
}

#[instrument(skip(state), target = "api")]
pub async fn factors(
    State(state): State<ApiState>,
    Path(symbol): Path<String>,
    Query(params): Query<LimitParams>,
) -> Result<Json<Vec<FactorRow>>, ApiError> {
    let limit = clamp_limit(params.limit, DEFAULT_SERIES_LIMIT);
    let rows = state
        .store
        .recent_factors(&Symbol::from(symbol), limit)
        .await?;
    Ok(Json(rows.into_iter().map(FactorRow::from).collect()))
}

/// Most recent first. `since` is inclusive.
#[instrument(skip(state), target = "api")]
pub async fn alerts(
    State(state): State<ApiState>,
    Query(params): Query<AlertParams>,
) -> Result<Json<Vec<AlertRow>>, ApiError> {
    let mut query = AlertQuery::default().limit(clamp_limit(params.limit, DEFAULT_ALERT_LIMIT));

    if let Some(symbol) = params.symbol.filter(|s| !s.is_empty()) {
        query = query.for_symbol(symbol);
    }
    if let Some(raw) = params.since.as_deref().filter(|s| !s.is_empty()) {
        let since = parse_timestamp(raw)
            .map_err(|e| ApiError::BadRequest(format!("invalid since: {e}")))?;
        query = query.in_range(TimeRange::since(since));
    }

    let rows = state.sink.query(&query).await?;
    Ok(Json(rows.into_iter().map(AlertRow::from).collect()))
}
