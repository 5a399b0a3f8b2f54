//! Read-only JSON API over brands and active promotions.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use promowatch_core::{ActivePromotion, Brand};
use promowatch_sync::IngestConfig;
use sqlx::{Row, SqlitePool};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "promowatch-web";

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/brands", get(brands_handler))
        .route("/api/brands", get(brands_handler))
        .route("/promotions", get(promotions_handler))
        .route("/api/promotions", get(promotions_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&IngestConfig::from_env()).await
}

pub async fn serve(config: &IngestConfig) -> anyhow::Result<()> {
    let pool = promowatch_storage::connect(&config.database_url).await?;
    promowatch_storage::migrate(&pool).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "read api listening");
    axum::serve(listener, app(AppState::new(pool))).await?;
    Ok(())
}

async fn health_handler() -> &'static str {
    "promowatch read api"
}

async fn brands_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_brands(&state.pool).await {
        Ok(brands) => Json(brands).into_response(),
        Err(err) => server_error(err),
    }
}

async fn promotions_handler(State(state): State<Arc<AppState>>) -> Response {
    match load_active_promotions(&state.pool, Utc::now()).await {
        Ok(promotions) => Json(promotions).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %err, "read api query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

pub async fn load_brands(pool: &SqlitePool) -> anyhow::Result<Vec<Brand>> {
    let rows = sqlx::query("SELECT brand_id, brand_name FROM brands ORDER BY brand_id")
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| -> anyhow::Result<Brand> {
            Ok(Brand {
                brand_id: row.try_get("brand_id")?,
                brand_name: row.try_get("brand_name")?,
            })
        })
        .collect()
}

/// Promotions whose end date has not passed at `now`, earliest start first.
pub async fn load_active_promotions(
    pool: &SqlitePool,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<ActivePromotion>> {
    let rows = sqlx::query(
        r#"
        SELECT p.id, b.brand_name, p.promotion_type, p.start_date, p.end_date, w.content_title
        FROM promotions p
        LEFT JOIN brands b ON b.brand_id = p.brand_id
        LEFT JOIN web_scraping w ON w.scraping_id = p.scraping_id
        WHERE p.end_date >= ? AND p.start_date IS NOT NULL
        ORDER BY p.start_date, p.id
        "#,
    )
    .bind(now.timestamp())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|row| -> anyhow::Result<ActivePromotion> {
            Ok(ActivePromotion {
                id: row.try_get("id")?,
                brand: row.try_get("brand_name")?,
                promotion_type: row.try_get("promotion_type")?,
                start_date: unix_to_utc(row.try_get("start_date")?)?,
                end_date: unix_to_utc(row.try_get("end_date")?)?,
                title: row.try_get("content_title")?,
            })
        })
        .collect()
}

fn unix_to_utc(secs: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| anyhow::anyhow!("timestamp {secs} out of range"))
}
