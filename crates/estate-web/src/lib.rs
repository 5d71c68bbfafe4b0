//! Read-only JSON API over the stored listings.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use estate_core::IdentityKey;
use estate_storage::{
    ListingQuery, ListingStore, MarketFilter, StorageError, DEFAULT_OVERVIEW_DAYS,
};
use estate_sync::{open_store, IngestConfig};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "estate-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ListingStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OverviewQuery {
    city: Option<String>,
    postal_code: Option<String>,
    /// Window in days; `0` covers every stored listing.
    days: Option<u32>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/listings", get(listings_handler))
        .route("/api/v1/properties/search", get(listings_handler))
        .route("/api/v1/listings/{source}/{source_id}", get(listing_detail_handler))
        .route("/api/v1/market/overview", get(market_overview_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = IngestConfig::from_env();
    let store = open_store(&config)?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving listings api");
    axum::serve(listener, app(AppState::new(Arc::new(store)))).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.count().await {
        Ok(listings) => Json(json!({ "status": "ok", "listings": listings })).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn listings_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListingQuery>,
) -> Response {
    match state.store.recent(&query).await {
        Ok(rows) => Json(json!({
            "count": rows.len(),
            "limit": query.effective_limit(),
            "offset": query.effective_offset(),
            "listings": rows,
        }))
        .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn listing_detail_handler(
    State(state): State<Arc<AppState>>,
    Path((source, source_id)): Path<(String, String)>,
) -> Response {
    let key = IdentityKey::new(source, source_id);
    match state.store.get(&key).await {
        Ok(Some(row)) => Json(row).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("listing {}:{} not found", key.source, key.source_id) })),
        )
            .into_response(),
        Err(err) => storage_error(err),
    }
}

async fn market_overview_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OverviewQuery>,
) -> Response {
    let filter = MarketFilter::recent(
        non_blank(query.city),
        non_blank(query.postal_code),
        query.days.unwrap_or(DEFAULT_OVERVIEW_DAYS),
        Utc::now(),
    );
    match state.store.market_overview(&filter).await {
        Ok(overview) => Json(overview).into_response(),
        Err(err) => storage_error(err),
    }
}

fn storage_error(err: StorageError) -> Response {
    error!("listing query failed: {err}");
    let status = if err.is_connection_level() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
