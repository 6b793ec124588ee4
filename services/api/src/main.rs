//! Valora API - restaurant analytics backend
//!
//! Endpoints:
//! - GET  /health - Health check
//! - POST /uploads - Stage a CSV upload
//! - GET  /uploads - List recent uploads
//! - GET  /data/columns - Columns of one staged upload
//! - GET  /data/mappings - List column mappings
//! - POST /data/mappings - Create or edit a mapping
//! - POST /data/promote/:dataset - Validate + promote staged rows into facts
//! - GET  /kpi/overview - 30-day financial snapshot
//! - GET  /kpi/sales - Sales KPIs + series
//! - GET  /kpi/sales/aov-histogram - Order-value distribution buckets
//! - GET  /kpi/labor - Labor KPIs + series
//! - GET  /kpi/labor/drivers - Ranked labor drivers
//! - GET  /kpi/inventory - Inventory KPIs + detail
//! - GET  /kpi/inventory/drivers - Ranked inventory drivers + actions
//! - GET  /kpi/ops - Combined ops view
//! - GET  /locations - Known locations from promoted facts
//! - GET  /data-status - Ingestion freshness
//! - POST /auth/signup, /auth/signin, /auth/logout - Session lifecycle
//! - GET  /auth/me, /auth/status - Session introspection

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

mod auth;
mod drivers;
mod error;
mod ingest;
mod kpi;
mod mappings;
mod model;
mod promote;
mod uploads;

const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
}

// ============================================================================
// Health
// ============================================================================

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "ok": true, "version": env!("CARGO_PKG_VERSION") }))
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("api=info,tower_http=info")),
        )
        .init();

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());

    tracing::info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("database connected");

    let state = Arc::new(AppState { pool });

    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/uploads",
            get(uploads::list_uploads_handler).post(uploads::create_upload_handler),
        )
        .route("/data/columns", get(uploads::columns_handler))
        .route(
            "/data/mappings",
            get(mappings::list_mappings_handler).post(mappings::save_mapping_handler),
        )
        .route("/data/promote/:dataset", post(promote::promote_handler))
        .route("/kpi/overview", get(kpi::overview_handler))
        .route("/kpi/sales", get(kpi::sales_handler))
        .route("/kpi/sales/aov-histogram", get(kpi::aov_histogram_handler))
        .route("/kpi/labor", get(kpi::labor_handler))
        .route("/kpi/labor/drivers", get(drivers::labor_drivers_handler))
        .route("/kpi/inventory", get(kpi::inventory_handler))
        .route(
            "/kpi/inventory/drivers",
            get(drivers::inventory_drivers_handler),
        )
        .route("/kpi/ops", get(kpi::ops_handler))
        .route("/locations", get(kpi::locations_handler))
        .route("/data-status", get(kpi::data_status_handler))
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/signin", post(auth::signin_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/auth/me", get(auth::me_handler))
        .route("/auth/status", get(auth::status_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    tracing::info!(%bind, "api listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
