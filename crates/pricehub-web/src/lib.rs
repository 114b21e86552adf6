//! JSON search API over the aggregator.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pricehub_core::{Marketplace, SearchQuery};
use pricehub_search::{Aggregator, SearchConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "pricehub-web";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
}

impl AppState {
    pub fn new(aggregator: Aggregator) -> Self {
        Self {
            aggregator: Arc::new(aggregator),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct SearchParams {
    q: Option<String>,
    /// Comma-separated marketplace names.
    marketplaces: Option<String>,
    max_price: Option<String>,
}

#[derive(Debug, Serialize)]
struct ApiError {
    success: bool,
    message: String,
}

#[derive(Debug, Serialize)]
pub struct MarketplaceRow {
    pub id: &'static str,
    pub name: &'static str,
    pub currency: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/search", get(search_handler))
        .route("/api/marketplaces", get(marketplaces_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("PRICEHUB_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

pub async fn serve(aggregator: Aggregator, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, marketplaces = ?aggregator.marketplaces(), "pricehub api listening");
    axum::serve(listener, app(AppState::new(aggregator))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SearchConfig::from_env()?;
    serve(Aggregator::from_config(&config)?, port_from_env()).await
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn marketplaces_handler(State(state): State<Arc<AppState>>) -> Json<Vec<MarketplaceRow>> {
    let rows = state
        .aggregator
        .marketplaces()
        .into_iter()
        .map(|m| MarketplaceRow {
            id: m.slug(),
            name: m.display_name(),
            currency: m.currency(),
        })
        .collect();
    Json(rows)
}

async fn search_handler(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> Response {
    let query = match build_query(&params) {
        Ok(query) => query,
        Err(message) => return api_error(StatusCode::BAD_REQUEST, message),
    };
    let result = state.aggregator.search_all(&query).await;
    if result.all_failed() {
        return api_error(StatusCode::BAD_GATEWAY, "search failed".to_string());
    }
    Json(result).into_response()
}

fn build_query(params: &SearchParams) -> Result<SearchQuery, String> {
    let mut query = SearchQuery::new(params.q.as_deref().unwrap_or_default()).map_err(|e| e.to_string())?;
    if let Some(list) = params.marketplaces.as_deref() {
        let marketplaces = list
            .split(',')
            .filter(|name| !name.trim().is_empty())
            .map(str::parse::<Marketplace>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?;
        query = query.with_marketplaces(marketplaces);
    }
    if let Some(raw) = params.max_price.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        let max_price: f64 = raw.parse().map_err(|_| format!("invalid max_price `{raw}`"))?;
        query = query.with_max_price(max_price).map_err(|e| e.to_string())?;
    }
    Ok(query)
}

fn api_error(status: StatusCode, message: String) -> Response {
    (status, Json(ApiError { success: false, message })).into_response()
}
