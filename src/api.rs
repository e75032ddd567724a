//! Read-only dashboard API.
//!
//! UTF-8 JSON over axum. The dashboard's static assets live elsewhere;
//! this module only serves the data endpoints, behind a permissive CORS
//! layer and an inbound rate limit.

use axum::{
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::application::health::HealthAggregator;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::persistence::repository::Store;

/// Server-side cache window for /api/prices.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(5);

pub type ApiRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

pub fn create_rate_limiter(requests_per_minute: u32) -> ApiRateLimiter {
    let quota = Quota::per_minute(
        NonZeroU32::new(requests_per_minute).expect("Requests per minute must be non-zero"),
    );
    Arc::new(RateLimiter::direct(quota))
}

async fn rate_limit_middleware(
    limiter: ApiRateLimiter,
    request: Request,
    next: Next,
) -> Response {
    match limiter.check() {
        Ok(_) => next.run(request).await,
        Err(_) => {
            warn!("dashboard rate limit exceeded");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response()
        }
    }
}

pub struct ApiState {
    pub store: Arc<Store>,
    pub health: Arc<HealthAggregator>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub symbols: Vec<String>,
    prices: DashMap<String, (f64, Instant)>,
}

impl ApiState {
    pub fn new(
        store: Arc<Store>,
        health: Arc<HealthAggregator>,
        exchange: Arc<dyn ExchangeClient>,
        symbols: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(ApiState {
            store,
            health,
            exchange,
            symbols,
            prices: DashMap::new(),
        })
    }
}

pub fn router(state: Arc<ApiState>, limiter: ApiRateLimiter) -> Router {
    Router::new()
        .route("/api/account", get(account_handler))
        .route("/api/positions", get(positions_handler))
        .route("/api/history", get(history_handler))
        .route("/api/trades", get(trades_handler))
        .route("/api/completed-trades", get(completed_trades_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/stats", get(stats_handler))
        .route("/api/prices", get(prices_handler))
        .route("/api/price-orders", get(price_orders_handler))
        .route("/api/health", get(health_handler))
        .layer(axum::middleware::from_fn(move |request: Request, next: Next| {
            let limiter = Arc::clone(&limiter);
            async move { rate_limit_middleware(limiter, request, next).await }
        }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, String);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
    symbol: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PricesQuery {
    symbols: Option<String>,
}

#[derive(Debug, Serialize)]
struct AccountResponse {
    #[serde(rename = "totalBalance")]
    total_balance: f64,
    #[serde(rename = "availableBalance")]
    available_balance: f64,
    #[serde(rename = "positionMargin")]
    position_margin: f64,
    /// Spelled the way the dashboard expects it.
    #[serde(rename = "unrealisedPnl")]
    unrealised_pnl: f64,
    #[serde(rename = "returnPercent")]
    return_percent: f64,
    #[serde(rename = "initialBalance")]
    initial_balance: f64,
    timestamp: chrono::DateTime<Utc>,
}

/// GET /api/account
async fn account_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let account = state.exchange.get_account().await.map_err(internal)?;
    let initial = state
        .store
        .history
        .initial_balance()
        .await
        .map_err(internal)?
        .unwrap_or(account.total);
    let return_percent = if initial > 0.0 {
        (account.equity() - initial) / initial * 100.0
    } else {
        0.0
    };
    Ok(Json(AccountResponse {
        total_balance: account.total,
        available_balance: account.available,
        position_margin: account.position_margin,
        unrealised_pnl: account.unrealized_pnl,
        return_percent,
        initial_balance: initial,
        timestamp: Utc::now(),
    }))
}

/// GET /api/positions
async fn positions_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let positions = state.store.positions.all().await.map_err(internal)?;
    let count = positions.len();
    Ok(Json(serde_json::json!({
        "positions": positions,
        "count": count,
    })))
}

/// GET /api/history?limit=N — chronological, oldest first.
async fn history_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .history
        .recent(query.limit.unwrap_or(500))
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

/// GET /api/trades?limit=N&symbol=BTC
async fn trades_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .trades
        .recent(query.limit.unwrap_or(100), query.symbol.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

/// GET /api/completed-trades?limit=N
async fn completed_trades_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .trades
        .completed(query.limit.unwrap_or(100))
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

/// GET /api/logs?limit=N — the decision log.
async fn logs_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state
        .store
        .decisions
        .recent(query.limit.unwrap_or(50))
        .await
        .map_err(internal)?;
    Ok(Json(records))
}

/// GET /api/stats
async fn stats_handler(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let stats = state.store.close_events.stats().await.map_err(internal)?;
    let win_rate = if stats.total > 0 {
        stats.wins as f64 / stats.total as f64 * 100.0
    } else {
        0.0
    };
    Ok(Json(serde_json::json!({
        "totalTrades": stats.total,
        "winningTrades": stats.wins,
        "winRate": win_rate,
        "totalPnl": stats.total_pnl,
        "maxWin": stats.max_win,
        "maxLoss": stats.max_loss,
    })))
}

/// GET /api/prices?symbols=BTC,ETH — 5-second server-side cache; serves the
/// last cached value while the coordinator has the venue blocked.
async fn prices_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<PricesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let symbols: Vec<String> = match &query.symbols {
        Some(csv) => csv
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => state.symbols.clone(),
    };

    let mut prices = HashMap::new();
    for symbol in symbols {
        if let Some(entry) = state.prices.get(&symbol) {
            let (price, at) = *entry;
            if at.elapsed() <= PRICE_CACHE_TTL {
                prices.insert(symbol, price);
                continue;
            }
        }
        match state.exchange.get_ticker(&symbol, false).await {
            Ok(ticker) => {
                state.prices.insert(symbol.clone(), (ticker.last, Instant::now()));
                prices.insert(symbol, ticker.last);
            }
            Err(e) => {
                // penalty window: fall back to whatever we had
                if let Some(entry) = state.prices.get(&symbol) {
                    prices.insert(symbol.clone(), entry.0);
                } else {
                    warn!("no price for {}: {}", symbol, e);
                }
            }
        }
    }
    Ok(Json(serde_json::json!({ "prices": prices })))
}

/// GET /api/price-orders — active triggers only.
async fn price_orders_handler(
    State(state): State<Arc<ApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let records = state.store.triggers.all_active().await.map_err(internal)?;
    Ok(Json(records))
}

/// GET /api/health
async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(state.health.check().await)
}
