//! Conventional REST handlers: config, watchlist, history, alerts, demand
//! intelligence, session management, and portfolio analytics.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::AppState;
use crate::config::Config;
use crate::engine::{history, portfolio, risk};
use crate::error::FlipperError;
use crate::esi::auth::Token;
use crate::esi::Deadline;
use crate::storage::{AlertMetric, DemandRegion, WatchlistItem};

fn error_response(err: FlipperError) -> Response {
    let status = match &err {
        FlipperError::BadInput(_) => StatusCode::BAD_REQUEST,
        FlipperError::NotFound(_) => StatusCode::NOT_FOUND,
        FlipperError::Unauthorized(_) | FlipperError::AuthExpired => StatusCode::UNAUTHORIZED,
        FlipperError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

// ---- config ----

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<Config> {
    Json(state.config.read().await.clone())
}

pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Json(config): Json<Config>,
) -> Response {
    if let Err(e) = state.db.save_config(&config) {
        return error_response(e);
    }
    *state.config.write().await = config.clone();
    Json(config).into_response()
}

// ---- watchlist ----

pub async fn list_watchlist(State(state): State<Arc<AppState>>) -> Response {
    match state.db.watchlist() {
        Ok(items) => Json(items).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn add_watchlist(
    State(state): State<Arc<AppState>>,
    Json(item): Json<WatchlistItem>,
) -> Response {
    match state.db.add_watchlist_item(&item) {
        Ok(true) => (StatusCode::CREATED, Json(json!({"added": true}))).into_response(),
        Ok(false) => (
            StatusCode::CONFLICT,
            Json(json!({"added": false, "error": "already tracked"})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn remove_watchlist(
    State(state): State<Arc<AppState>>,
    Path(type_id): Path<i32>,
) -> Response {
    match state.db.remove_watchlist_item(type_id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => {
            error_response(FlipperError::NotFound(format!("type {type_id} not tracked")))
        }
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct AlertSettings {
    pub enabled: bool,
    pub metric: AlertMetric,
    pub threshold: f64,
}

pub async fn update_watchlist_alert(
    State(state): State<Arc<AppState>>,
    Path(type_id): Path<i32>,
    Json(settings): Json<AlertSettings>,
) -> Response {
    match state.db.update_watchlist_alert(
        type_id,
        settings.enabled,
        settings.metric,
        settings.threshold,
    ) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => {
            error_response(FlipperError::NotFound(format!("type {type_id} not tracked")))
        }
        Err(e) => error_response(e),
    }
}

// ---- scan history ----

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn list_scans(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    match state.db.scan_history(query.limit.min(200)) {
        Ok(records) => Json(records).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_scan(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    let record = match state.db.scan_by_id(id) {
        Ok(Some(r)) => r,
        Ok(None) => return error_response(FlipperError::NotFound(format!("scan {id}"))),
        Err(e) => return error_response(e),
    };
    match state.db.scan_results(id) {
        Ok(results) => Json(json!({
            "record": record,
            "results": results,
        }))
        .into_response(),
        Err(e) => error_response(e),
    }
}

// ---- alert history ----

#[derive(Deserialize)]
pub struct AlertsQuery {
    #[serde(default)]
    pub type_id: i32,
    #[serde(default = "default_alerts_limit")]
    pub limit: usize,
}

fn default_alerts_limit() -> usize {
    100
}

pub async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> Response {
    match state.db.alert_history(query.type_id, query.limit) {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => error_response(e),
    }
}

// ---- demand intelligence ----

pub async fn list_demand(State(state): State<Arc<AppState>>) -> Response {
    match state.db.demand_regions() {
        Ok(regions) => Json(regions).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn upsert_demand(
    State(state): State<Arc<AppState>>,
    Json(region): Json<DemandRegion>,
) -> Response {
    match state.db.upsert_demand_region(&region) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ---- session ----

#[derive(Deserialize)]
pub struct TokenRequest {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub character_id: i64,
}

/// Accepts the token pair produced by the browser-side OAuth flow, makes it
/// the live session, and persists it so a restart stays signed in.
pub async fn store_token(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TokenRequest>,
) -> Response {
    let expires_at = Utc::now() + ChronoDuration::seconds(request.expires_in.max(0));
    let token = Token {
        access_token: request.access_token.clone(),
        refresh_token: request.refresh_token.clone(),
        expires_at,
        character_name: request.character_name.clone(),
        character_id: request.character_id,
    };
    state.scanner.esi.session.install(token).await;

    let mut config = state.config.write().await;
    config.access_token = request.access_token;
    config.refresh_token = request.refresh_token;
    config.token_expires_at = expires_at.to_rfc3339();
    config.character_name = request.character_name;
    config.character_id = request.character_id;
    if let Err(e) = state.db.save_config(&config) {
        warn!(error = %e, "session persisted in memory only");
    }
    StatusCode::NO_CONTENT.into_response()
}

pub async fn auth_status(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let session = state.scanner.esi.session.snapshot().await;
    match session {
        Some(token) => Json(json!({
            "authenticated": true,
            "character_name": token.character_name,
            "character_id": token.character_id,
        })),
        None => Json(json!({"authenticated": false})),
    }
}

// ---- market impact ----

#[derive(Deserialize)]
pub struct ImpactQuery {
    pub region_id: i32,
    pub type_id: i32,
    pub quantity: f64,
    #[serde(default)]
    pub reference_price: f64,
}

/// Calibrates the impact model for one type and prices a hypothetical
/// order against it.
pub async fn impact_estimate(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ImpactQuery>,
) -> Response {
    if query.quantity <= 0.0 {
        return error_response(FlipperError::BadInput("quantity must be positive".into()));
    }

    let cancel = CancellationToken::new();
    let deadline = Deadline::after(std::time::Duration::from_secs(30));
    let scanner = &state.scanner;
    let esi = scanner.esi.clone();
    let entries = match scanner
        .caches
        .history
        .get_or_fetch((query.region_id, query.type_id), || async move {
            let entries = esi
                .fetch_market_history(query.region_id, query.type_id, &cancel, deadline)
                .await?;
            Ok(Arc::new(entries))
        })
        .await
    {
        Ok(entries) => entries,
        Err(e) => return error_response(e),
    };

    let params = history::calibrate_impact(&entries, 30);
    let impact_pct = history::recommended_impact_pct(&params, query.quantity);
    let impact_isk = if query.reference_price > 0.0 {
        query.reference_price * impact_pct / 100.0
    } else {
        0.0
    };
    let slices = history::optimal_slices(query.quantity, params.avg_daily_volume);
    let stats = history::market_stats(&entries, 0);

    Json(json!({
        "params": params,
        "recommended_impact_pct": impact_pct,
        "recommended_impact_isk": impact_isk,
        "optimal_slices": slices,
        "daily_volume_7d": stats.daily_volume,
        "price_trend_pct": stats.price_trend_pct,
    }))
    .into_response()
}

// ---- portfolio ----

#[derive(Deserialize)]
pub struct PortfolioQuery {
    #[serde(default = "default_lookback")]
    pub days: u32,
}

fn default_lookback() -> u32 {
    30
}

/// Realized P&L plus risk metrics for the signed-in character.
pub async fn portfolio_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PortfolioQuery>,
) -> Response {
    let (character_id, tax, broker) = {
        let config = state.config.read().await;
        (
            config.character_id,
            config.sales_tax_percent,
            config.broker_fee_percent,
        )
    };
    if character_id == 0 {
        return error_response(FlipperError::Unauthorized("no character signed in".into()));
    }

    let cancel = CancellationToken::new();
    let deadline = Deadline::after(std::time::Duration::from_secs(60));
    let mut transactions = match state
        .scanner
        .esi
        .fetch_wallet_transactions(character_id, &cancel, deadline)
        .await
    {
        Ok(txns) => txns,
        Err(e) => return error_response(e),
    };
    for tx in &mut transactions {
        tx.type_name = state.scanner.catalog.item_name(tx.type_id);
        tx.location_name = state.scanner.catalog.station_name(tx.location_id);
    }

    let report = portfolio::compute(
        &transactions,
        portfolio::PortfolioOptions {
            lookback_days: query.days,
            sales_tax_percent: tax,
            broker_fee_percent: broker,
            ledger_limit: 500,
        },
    );
    let risk = risk::assess(&report.daily);

    Json(json!({
        "portfolio": report,
        "risk": risk,
    }))
    .into_response()
}
