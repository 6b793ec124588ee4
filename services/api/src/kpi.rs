//! KPI read endpoints.
//!
//! GET /kpi/overview   30-day financial snapshot from the fact tables
//! GET /kpi/sales      revenue/orders/AOV/margin/discount KPIs + series
//! GET /kpi/labor      labor cost/hours/ratio/productivity KPIs + series
//! GET /kpi/inventory  DIH/on-hand/excess-cash KPIs + driver detail rows
//! GET /kpi/ops        combined ops view (labor KPIs + top actions)
//! GET /locations      known locations from promoted facts
//! GET /data-status    ingestion freshness summary
//!
//! The heavy aggregation lives in analytics.* SQL functions; these handlers
//! validate query parameters, call the functions, and reshape rows into the
//! dashboard contract. Numeric columns are cast to float8 in SQL so they map
//! cleanly onto f64. When no anchor data exists the payload degrades to empty
//! KPIs instead of failing.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::drivers;
use crate::error::{ApiError, ApiResult};
use crate::model::{Kpi, LocationInfo, Severity, Unit};
use crate::AppState;

pub const WINDOWS: &[&str] = &["7d", "30d", "90d", "ytd"];

// ---------------------------------------------------------------------------
// Query parameter parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct KpiQuery {
    pub window: Option<String>,
    pub as_of: Option<String>,
    pub location_id: Option<String>,
}

pub fn parse_window(raw: &Option<String>) -> &'static str {
    let w = raw.as_deref().unwrap_or("30d").trim().to_lowercase();
    WINDOWS.iter().find(|x| **x == w).copied().unwrap_or("30d")
}

pub fn parse_as_of(raw: &Option<String>) -> ApiResult<Option<DateTime<Utc>>> {
    match raw.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|_| ApiError::BadRequest(format!("Invalid as_of timestamp: \"{s}\""))),
    }
}

pub fn parse_location(raw: &Option<String>) -> ApiResult<Option<Uuid>> {
    match raw.as_deref().map(str::trim) {
        None | Some("") | Some("all") => Ok(None),
        Some(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|_| ApiError::BadRequest(format!("Invalid location_id: \"{s}\""))),
    }
}

fn safe_div(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) if b != 0.0 && a.is_finite() && b.is_finite() => Some(a / b),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Ops/labor delta + series
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
pub struct OpsDeltaRow {
    pub as_of_ts: Option<DateTime<Utc>>,
    pub revenue: Option<f64>,
    pub labor_cost: Option<f64>,
    pub labor_cost_delta_pct: Option<f64>,
    pub labor_hours: Option<f64>,
    pub labor_hours_delta_pct: Option<f64>,
    pub avg_hourly_rate: Option<f64>,
    pub labor_cost_ratio_pct: Option<f64>,
    pub labor_ratio_delta_pp: Option<f64>,
    pub sales_per_labor_hour: Option<f64>,
    pub sales_per_labor_hour_delta_pct: Option<f64>,
    pub overtime_hours: Option<f64>,
    pub overtime_hours_delta_pct: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct OpsSeriesRow {
    day: NaiveDate,
    revenue: Option<f64>,
    labor_cost: Option<f64>,
    labor_hours: Option<f64>,
    labor_cost_ratio_pct: Option<f64>,
    sales_per_labor_hour: Option<f64>,
}

pub async fn fetch_ops_delta(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Option<OpsDeltaRow>> {
    let row = sqlx::query_as(
        r#"
        select as_of_ts,
               revenue::float8 as revenue,
               labor_cost::float8 as labor_cost,
               labor_cost_delta_pct::float8 as labor_cost_delta_pct,
               labor_hours::float8 as labor_hours,
               labor_hours_delta_pct::float8 as labor_hours_delta_pct,
               avg_hourly_rate::float8 as avg_hourly_rate,
               labor_cost_ratio_pct::float8 as labor_cost_ratio_pct,
               labor_ratio_delta_pp::float8 as labor_ratio_delta_pp,
               sales_per_labor_hour::float8 as sales_per_labor_hour,
               sales_per_labor_hour_delta_pct::float8 as sales_per_labor_hour_delta_pct,
               overtime_hours::float8 as overtime_hours,
               overtime_hours_delta_pct::float8 as overtime_hours_delta_pct
        from analytics.get_ops_kpis_delta($1, $2, $3)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// KPI tiles for the labor view, preserving nulls from the delta row.
pub fn labor_kpis_from_delta(k: &OpsDeltaRow) -> Vec<Kpi> {
    let mut kpis = vec![
        Kpi::new(
            "LABOR_COST",
            "Labor Cost",
            k.labor_cost,
            Unit::Usd,
            k.labor_cost_delta_pct,
            "Total labor cost vs previous window (%).",
        ),
        Kpi::new(
            "LABOR_HOURS",
            "Labor Hours",
            k.labor_hours,
            Unit::Hours,
            k.labor_hours_delta_pct,
            "Total labor hours vs previous window (%).",
        ),
        Kpi::new(
            "AVG_HOURLY_RATE",
            "Avg Hourly Rate",
            k.avg_hourly_rate,
            Unit::Usd,
            None,
            "Labor cost / labor hours.",
        ),
        Kpi::new(
            "LABOR_COST_RATIO",
            "Labor Cost Ratio",
            k.labor_cost_ratio_pct,
            Unit::Pct,
            k.labor_ratio_delta_pp,
            "Labor % of revenue (delta in pp).",
        ),
        Kpi::new(
            "SALES_PER_LABOR_HOUR",
            "Sales per Labor Hour",
            k.sales_per_labor_hour,
            Unit::Usd,
            k.sales_per_labor_hour_delta_pct,
            "Revenue / labor hours vs previous window (%).",
        ),
    ];
    // Overtime share only when both sides are present.
    if let Some(pct) = safe_div(k.overtime_hours, k.labor_hours).map(|r| r * 100.0) {
        kpis.push(Kpi::new(
            "OVERTIME_PCT",
            "Overtime %",
            Some(pct),
            Unit::Pct,
            k.overtime_hours_delta_pct,
            "Overtime hours as % of total labor hours.",
        ));
    }
    kpis
}

async fn fetch_ops_series(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Vec<OpsSeriesRow>> {
    let rows = sqlx::query_as(
        r#"
        select day,
               revenue::float8 as revenue,
               labor_cost::float8 as labor_cost,
               labor_hours::float8 as labor_hours,
               labor_cost_ratio_pct::float8 as labor_cost_ratio_pct,
               sales_per_labor_hour::float8 as sales_per_labor_hour
        from analytics.get_ops_timeseries_daily($1, $2, $3)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

fn ops_series_json(rows: &[OpsSeriesRow]) -> serde_json::Value {
    json!({
        "day": rows.iter().map(|r| r.day.to_string()).collect::<Vec<_>>(),
        "revenue": rows.iter().map(|r| r.revenue.unwrap_or(0.0)).collect::<Vec<_>>(),
        "labor_cost": rows.iter().map(|r| r.labor_cost.unwrap_or(0.0)).collect::<Vec<_>>(),
        "labor_hours": rows.iter().map(|r| r.labor_hours.unwrap_or(0.0)).collect::<Vec<_>>(),
        "labor_cost_ratio_pct": rows.iter().map(|r| r.labor_cost_ratio_pct).collect::<Vec<_>>(),
        "sales_per_labor_hour": rows.iter().map(|r| r.sales_per_labor_hour).collect::<Vec<_>>(),
    })
}

/// GET /kpi/labor
pub async fn labor_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = parse_window(&params.window);
    let as_of = parse_as_of(&params.as_of)?.unwrap_or(refreshed_at);
    let location_id = parse_location(&params.location_id)?;

    let delta = fetch_ops_delta(&state.pool, as_of, window, location_id).await?;
    let series_rows = fetch_ops_series(&state.pool, as_of, window, location_id).await?;

    let (as_of_ts, kpis) = match &delta {
        Some(k) => (k.as_of_ts, labor_kpis_from_delta(k)),
        None => (None, Vec::new()),
    };

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of_ts,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "kpis": kpis,
        "series": ops_series_json(&series_rows),
    })))
}

/// GET /kpi/ops
///
/// Labor KPIs under OPS_ codes plus the current top 3 inventory actions.
pub async fn ops_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = parse_window(&params.window);
    let as_of = parse_as_of(&params.as_of)?.unwrap_or(refreshed_at);
    let location_id = parse_location(&params.location_id)?;

    let delta = fetch_ops_delta(&state.pool, as_of, window, location_id).await?;
    let series_rows = fetch_ops_series(&state.pool, as_of, window, location_id).await?;
    let slow_movers = fetch_inventory_slow_movers(&state.pool, as_of, window, location_id).await?;

    let (as_of_ts, kpis) = match &delta {
        Some(k) => (
            k.as_of_ts,
            labor_kpis_from_delta(k)
                .into_iter()
                .map(|mut kpi| {
                    kpi.code = format!("OPS_{}", kpi.code);
                    kpi
                })
                .collect::<Vec<_>>(),
        ),
        None => (None, Vec::new()),
    };

    let actions = drivers::build_inventory_actions(&slow_movers);

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of_ts,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "kpis": kpis,
        "series": ops_series_json(&series_rows),
        "actions": actions,
    })))
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct SalesDeltaRow {
    as_of_ts: Option<DateTime<Utc>>,
    revenue: Option<f64>,
    revenue_delta_pct: Option<f64>,
    orders: Option<f64>,
    orders_delta_pct: Option<f64>,
    aov: Option<f64>,
    aov_delta_pct: Option<f64>,
    gross_margin_pct: Option<f64>,
    gross_margin_delta_pp: Option<f64>,
    discount_rate_pct: Option<f64>,
    discount_rate_delta_pp: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct SalesSeriesRow {
    day: NaiveDate,
    revenue: Option<f64>,
    orders: Option<f64>,
    aov: Option<f64>,
    gross_margin_pct: Option<f64>,
    discount_rate_pct: Option<f64>,
}

fn severity_from_delta(delta_pct: Option<f64>) -> Severity {
    match delta_pct {
        None => Severity::Good,
        Some(d) if d < -5.0 => Severity::Risk,
        Some(d) if d < 0.0 => Severity::Warn,
        _ => Severity::Good,
    }
}

fn severity_from_margin(margin_pct: Option<f64>) -> Severity {
    match margin_pct {
        None => Severity::Good,
        Some(m) if m < 50.0 => Severity::Risk,
        Some(m) if m < 60.0 => Severity::Warn,
        _ => Severity::Good,
    }
}

fn severity_from_discount(rate_pct: Option<f64>) -> Severity {
    match rate_pct {
        None => Severity::Good,
        Some(r) if r > 12.0 => Severity::Risk,
        Some(r) if r > 8.0 => Severity::Warn,
        _ => Severity::Good,
    }
}

/// GET /kpi/sales
pub async fn sales_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = parse_window(&params.window);
    let as_of = parse_as_of(&params.as_of)?.unwrap_or(refreshed_at);
    let location_id = parse_location(&params.location_id)?;

    let delta: Option<SalesDeltaRow> = sqlx::query_as(
        r#"
        select as_of_ts,
               revenue::float8 as revenue,
               revenue_delta_pct::float8 as revenue_delta_pct,
               orders::float8 as orders,
               orders_delta_pct::float8 as orders_delta_pct,
               aov::float8 as aov,
               aov_delta_pct::float8 as aov_delta_pct,
               gross_margin_pct::float8 as gross_margin_pct,
               gross_margin_delta_pp::float8 as gross_margin_delta_pp,
               discount_rate_pct::float8 as discount_rate_pct,
               discount_rate_delta_pp::float8 as discount_rate_delta_pp
        from analytics.get_sales_kpis_delta($1, $2, $3)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_optional(&state.pool)
    .await?;

    let series_rows: Vec<SalesSeriesRow> = sqlx::query_as(
        r#"
        select day,
               revenue::float8 as revenue,
               orders::float8 as orders,
               aov::float8 as aov,
               gross_margin_pct::float8 as gross_margin_pct,
               discount_rate_pct::float8 as discount_rate_pct
        from analytics.get_sales_timeseries_daily($1, $2, $3)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_all(&state.pool)
    .await?;

    let (as_of_ts, kpis) = match &delta {
        Some(k) => {
            let win_upper = window.to_uppercase();
            let mut kpis = vec![
                Kpi::new(
                    "SALES_REVENUE",
                    &format!("Revenue ({win_upper})"),
                    k.revenue,
                    Unit::Usd,
                    k.revenue_delta_pct,
                    "Total sales for selected window vs previous window.",
                ),
                Kpi::new(
                    "SALES_ORDERS",
                    &format!("Orders ({win_upper})"),
                    k.orders,
                    Unit::Count,
                    k.orders_delta_pct,
                    "Orders for selected window vs previous window.",
                ),
                Kpi::new(
                    "SALES_AOV",
                    "Average Order Value",
                    k.aov,
                    Unit::Usd,
                    k.aov_delta_pct,
                    "AOV vs previous window.",
                ),
                Kpi::new(
                    "SALES_GROSS_MARGIN",
                    "Gross Margin",
                    k.gross_margin_pct,
                    Unit::Pct,
                    k.gross_margin_delta_pp,
                    "Gross margin % and change (pp) vs previous window.",
                ),
                Kpi::new(
                    "SALES_DISCOUNT_RATE",
                    "Discount Rate",
                    k.discount_rate_pct,
                    Unit::Pct,
                    k.discount_rate_delta_pp,
                    "Discount rate % and change (pp) vs previous window.",
                ),
            ];
            kpis[0].severity = severity_from_delta(k.revenue_delta_pct);
            kpis[1].severity = severity_from_delta(k.orders_delta_pct);
            kpis[2].severity = severity_from_delta(k.aov_delta_pct);
            kpis[3].severity = severity_from_margin(k.gross_margin_pct);
            kpis[4].severity = severity_from_discount(k.discount_rate_pct);
            (k.as_of_ts, kpis)
        }
        None => (None, Vec::new()),
    };

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of_ts,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "kpis": kpis,
        "series": {
            "day": series_rows.iter().map(|r| r.day.to_string()).collect::<Vec<_>>(),
            "revenue": series_rows.iter().map(|r| r.revenue.unwrap_or(0.0)).collect::<Vec<_>>(),
            "orders": series_rows.iter().map(|r| r.orders.unwrap_or(0.0)).collect::<Vec<_>>(),
            "aov": series_rows.iter().map(|r| r.aov).collect::<Vec<_>>(),
            "gross_margin_pct": series_rows.iter().map(|r| r.gross_margin_pct).collect::<Vec<_>>(),
            "discount_rate_pct": series_rows.iter().map(|r| r.discount_rate_pct).collect::<Vec<_>>(),
        },
    })))
}

// ---------------------------------------------------------------------------
// AOV histogram
// ---------------------------------------------------------------------------

const DEFAULT_BUCKET_SIZE: f64 = 10.0;
const DEFAULT_MAX_VALUE: f64 = 200.0;

#[derive(Debug, Deserialize)]
pub struct AovHistogramQuery {
    pub window: Option<String>,
    pub as_of: Option<String>,
    pub location_id: Option<String>,
    pub bucket_size: Option<String>,
    pub max_value: Option<String>,
}

/// Positive finite number or the default; anything else falls back.
fn parse_bucket_param(raw: &Option<String>, default: f64) -> f64 {
    raw.as_deref()
        .map(str::trim)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct AovBucket {
    pub bucket_from: Option<f64>,
    pub bucket_to: Option<f64>,
    pub orders: Option<i64>,
}

/// GET /kpi/sales/aov-histogram
///
/// Order-value distribution for the sales view: fixed-width buckets up to
/// `max_value`, aggregated by the store.
pub async fn aov_histogram_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AovHistogramQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = parse_window(&params.window);
    let as_of = parse_as_of(&params.as_of)?.unwrap_or(refreshed_at);
    let location_id = parse_location(&params.location_id)?;
    let bucket_size = parse_bucket_param(&params.bucket_size, DEFAULT_BUCKET_SIZE);
    let max_value = parse_bucket_param(&params.max_value, DEFAULT_MAX_VALUE);

    let buckets: Vec<AovBucket> = sqlx::query_as(
        r#"
        select bucket_from::float8 as bucket_from,
               bucket_to::float8 as bucket_to,
               orders::bigint as orders
        from analytics.get_sales_aov_histogram($1, $2, $3, $4::numeric, $5::numeric)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .bind(bucket_size)
    .bind(max_value)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "bucket_size": bucket_size,
        "max_value": max_value,
        "buckets": buckets,
    })))
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

/// Inventory policy defaults.
pub const TARGET_DIH_DAYS: i32 = 60;
pub const WARN_DIH_DAYS: f64 = 75.0;
pub const RISK_DIH_DAYS: f64 = 100.0;

#[derive(Debug, sqlx::FromRow)]
pub struct InventoryKpisRow {
    pub dih_days: Option<f64>,
    pub avg_on_hand_value: Option<f64>,
    pub excess_cash: Option<f64>,
    pub turns: Option<f64>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct OnhandItem {
    pub menu_item_id: Uuid,
    pub item_name: String,
    pub category: String,
    pub avg_qty: Option<f64>,
    pub avg_unit_cost: Option<f64>,
    pub avg_on_hand_value: Option<f64>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct CategoryMixRow {
    pub category: String,
    pub avg_on_hand_value: Option<f64>,
    pub pct_of_total: Option<f64>,
}

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
pub struct SlowMover {
    pub menu_item_id: Uuid,
    pub item_name: String,
    pub category: String,
    pub avg_on_hand_value: Option<f64>,
    pub sold_qty: Option<f64>,
    pub sold_revenue: Option<f64>,
    pub sell_through_pct: Option<f64>,
    pub slow_score: Option<f64>,
}

/// Latest inventory snapshot date, the anchor for all inventory queries.
pub async fn fetch_inventory_anchor(
    pool: &PgPool,
    location_id: Option<Uuid>,
) -> ApiResult<Option<DateTime<Utc>>> {
    let row: (Option<DateTime<Utc>>,) = sqlx::query_as(
        r#"
        select max(inv_date)::timestamptz as as_of_ts
        from analytics.fact_inventory_daily
        where ($1::uuid is null or location_code = $1::text)
        "#,
    )
    .bind(location_id)
    .fetch_one(pool)
    .await?;
    Ok(row.0)
}

pub async fn fetch_inventory_kpis(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Option<InventoryKpisRow>> {
    let row = sqlx::query_as(
        r#"
        select dih_days::float8 as dih_days,
               avg_on_hand_value::float8 as avg_on_hand_value,
               excess_cash::float8 as excess_cash,
               turns::float8 as turns
        from analytics.get_inventory_kpis($1, $2, $3, $4)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .bind(TARGET_DIH_DAYS)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn fetch_inventory_top_onhand(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Vec<OnhandItem>> {
    let rows = sqlx::query_as(
        r#"
        select menu_item_id, item_name, category,
               avg_qty::float8 as avg_qty,
               avg_unit_cost::float8 as avg_unit_cost,
               avg_on_hand_value::float8 as avg_on_hand_value
        from analytics.get_inventory_top_onhand_items($1, $2, $3, 10)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn fetch_inventory_category_mix(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Vec<CategoryMixRow>> {
    let rows = sqlx::query_as(
        r#"
        select category,
               avg_on_hand_value::float8 as avg_on_hand_value,
               pct_of_total::float8 as pct_of_total
        from analytics.get_inventory_category_mix($1, $2, $3)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn fetch_inventory_slow_movers(
    pool: &PgPool,
    as_of: DateTime<Utc>,
    window: &str,
    location_id: Option<Uuid>,
) -> ApiResult<Vec<SlowMover>> {
    let rows = sqlx::query_as(
        r#"
        select menu_item_id, item_name, category,
               avg_on_hand_value::float8 as avg_on_hand_value,
               sold_qty::float8 as sold_qty,
               sold_revenue::float8 as sold_revenue,
               sell_through_pct::float8 as sell_through_pct,
               slow_score::float8 as slow_score
        from analytics.get_inventory_slow_movers($1, $2, $3, 10)
        "#,
    )
    .bind(as_of)
    .bind(window)
    .bind(location_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub fn inventory_kpi_tiles(k: &InventoryKpisRow) -> Vec<Kpi> {
    vec![
        Kpi::new(
            "INV_DIH",
            "Days Inventory on Hand",
            k.dih_days,
            Unit::Days,
            None,
            "Average days of inventory on hand (target 60d).",
        ),
        Kpi::new(
            "INV_ONHAND_VALUE",
            "On-hand Value",
            k.avg_on_hand_value,
            Unit::Usd,
            None,
            "Average value of inventory on hand.",
        ),
        Kpi::new(
            "INV_EXCESS_CASH",
            "Excess Cash in Inventory",
            k.excess_cash,
            Unit::Usd,
            None,
            "Estimated cash above the target DIH policy.",
        ),
        Kpi::new(
            "INV_TURNS",
            "Inventory Turns",
            k.turns,
            Unit::Ratio,
            None,
            "COGS / average inventory for the window.",
        ),
    ]
}

/// GET /kpi/inventory
pub async fn inventory_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let window = parse_window(&params.window);
    let location_id = parse_location(&params.location_id)?;

    let as_of = match parse_as_of(&params.as_of)? {
        Some(ts) => Some(ts),
        None => fetch_inventory_anchor(&state.pool, location_id).await?,
    };

    // No anchor data: stable empty payload, not an error.
    let Some(as_of) = as_of else {
        return Ok(Json(json!({
            "ok": true,
            "as_of": null,
            "refreshed_at": refreshed_at,
            "window": window,
            "location": LocationInfo::from_param(location_id),
            "kpis": [],
            "drivers": { "top_onhand_items": [], "category_mix": [], "slow_movers": [] },
            "policy": {
                "target_dih_days": TARGET_DIH_DAYS,
                "warn_dih_days": WARN_DIH_DAYS,
                "risk_dih_days": RISK_DIH_DAYS,
            },
        })));
    };

    let kpis_row = fetch_inventory_kpis(&state.pool, as_of, window, location_id).await?;
    let top_onhand = fetch_inventory_top_onhand(&state.pool, as_of, window, location_id).await?;
    let category_mix = fetch_inventory_category_mix(&state.pool, as_of, window, location_id).await?;
    let slow_movers = fetch_inventory_slow_movers(&state.pool, as_of, window, location_id).await?;

    let kpis = kpis_row.as_ref().map(inventory_kpi_tiles).unwrap_or_default();

    Ok(Json(json!({
        "ok": true,
        "as_of": as_of,
        "refreshed_at": refreshed_at,
        "window": window,
        "location": LocationInfo::from_param(location_id),
        "kpis": kpis,
        "drivers": {
            "top_onhand_items": top_onhand,
            "category_mix": category_mix,
            "slow_movers": slow_movers,
        },
        "policy": {
            "target_dih_days": TARGET_DIH_DAYS,
            "warn_dih_days": WARN_DIH_DAYS,
            "risk_dih_days": RISK_DIH_DAYS,
        },
    })))
}

// ---------------------------------------------------------------------------
// Overview
// ---------------------------------------------------------------------------

#[derive(Debug, sqlx::FromRow)]
struct OverviewAggRow {
    revenue_30d: Option<f64>,
    discounts_30d: Option<f64>,
    orders_30d: Option<f64>,
    labor_cost_30d: Option<f64>,
    labor_hours_30d: Option<f64>,
}

/// GET /kpi/overview
///
/// 30-day snapshot anchored on the latest promoted sales date, so backfills
/// and historical loads stay stable.
pub async fn overview_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<KpiQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let refreshed_at = Utc::now();
    let location_id = parse_location(&params.location_id)?;

    let anchor: (Option<NaiveDate>,) = sqlx::query_as(
        r#"
        select max(sales_date) as max_day
        from analytics.fact_sales_daily
        where ($1::text is null or location_code = $1)
        "#,
    )
    .bind(location_id.map(|u| u.to_string()))
    .fetch_one(&state.pool)
    .await?;

    let Some(max_day) = anchor.0 else {
        return Ok(Json(json!({
            "ok": true,
            "as_of": null,
            "refreshed_at": refreshed_at,
            "location": LocationInfo::from_param(location_id),
            "kpis": [],
            "series": {},
            "notes": "No data yet. Upload CSV first.",
        })));
    };

    let agg: OverviewAggRow = sqlx::query_as(
        r#"
        with s as (
            select *
            from analytics.fact_sales_daily
            where sales_date > ($2::date - interval '30 days')
              and sales_date <= $2::date
              and ($1::text is null or location_code = $1)
        ),
        l as (
            select *
            from analytics.fact_labor_daily
            where labor_date > ($2::date - interval '30 days')
              and labor_date <= $2::date
              and ($1::text is null or location_code = $1)
        )
        select
            (select sum(revenue_usd)::float8 from s) as revenue_30d,
            (select sum(discounts_usd)::float8 from s) as discounts_30d,
            (select sum(orders)::float8 from s) as orders_30d,
            (select sum(labor_cost_usd)::float8 from l) as labor_cost_30d,
            (select sum(labor_hours)::float8 from l) as labor_hours_30d
        "#,
    )
    .bind(location_id.map(|u| u.to_string()))
    .bind(max_day)
    .fetch_one(&state.pool)
    .await?;

    let aov = safe_div(agg.revenue_30d, agg.orders_30d);
    let labor_pct = safe_div(agg.labor_cost_30d, agg.revenue_30d).map(|r| r * 100.0);
    let splh = safe_div(agg.revenue_30d, agg.labor_hours_30d);
    let discount_pct = safe_div(agg.discounts_30d, agg.revenue_30d).map(|r| r * 100.0);

    let kpis = vec![
        Kpi::new(
            "OV_REVENUE_30D",
            "Revenue (30d)",
            agg.revenue_30d,
            Unit::Usd,
            None,
            "Total revenue over the trailing 30 days.",
        ),
        Kpi::new(
            "OV_ORDERS_30D",
            "Orders (30d)",
            agg.orders_30d,
            Unit::Count,
            None,
            "Total orders over the trailing 30 days.",
        ),
        Kpi::new(
            "OV_AOV",
            "Average Order Value",
            aov,
            Unit::Usd,
            None,
            "Revenue / orders.",
        ),
        Kpi::new(
            "OV_LABOR_PCT",
            "Labor % of Sales",
            labor_pct,
            Unit::Pct,
            None,
            "Labor cost / revenue.",
        ),
        Kpi::new(
            "OV_SALES_PER_LABOR_HOUR",
            "Sales per Labor Hour",
            splh,
            Unit::Usd,
            None,
            "Revenue / labor hours.",
        ),
        Kpi::new(
            "OV_DISCOUNT_PCT",
            "Discount % of Sales",
            discount_pct,
            Unit::Pct,
            None,
            "Discounts / revenue.",
        ),
    ];

    Ok(Json(json!({
        "ok": true,
        "as_of": max_day,
        "refreshed_at": refreshed_at,
        "location": LocationInfo::from_param(location_id),
        "kpis": kpis,
        "series": {},
    })))
}

// ---------------------------------------------------------------------------
// Locations + data status
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize, sqlx::FromRow)]
struct LocationRow {
    id: String,
    fact_rows: i64,
}

/// GET /locations
pub async fn locations_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let rows: Vec<LocationRow> = sqlx::query_as(
        r#"
        select location_code as id, count(*)::bigint as fact_rows
        from (
            select location_code from analytics.fact_sales_daily
            union all
            select location_code from analytics.fact_labor_daily
            union all
            select location_code from analytics.fact_inventory_daily
        ) f
        where location_code is not null
        group by location_code
        order by location_code asc
        "#,
    )
    .fetch_all(&state.pool)
    .await?;

    let locations: Vec<serde_json::Value> = rows
        .iter()
        .map(|r| json!({ "id": r.id, "name": r.id, "rows": r.fact_rows }))
        .collect();

    Ok(Json(json!({ "ok": true, "locations": locations })))
}

#[derive(Debug, sqlx::FromRow)]
struct DataStatusRow {
    latest_sales_day: Option<NaiveDate>,
    latest_labor_day: Option<NaiveDate>,
    last_ingested_at: Option<DateTime<Utc>>,
    last_source_file: Option<String>,
    total_uploads: i64,
    total_staged_rows: Option<i64>,
    uploads_24h: i64,
}

/// GET /data-status
pub async fn data_status_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let row: DataStatusRow = sqlx::query_as(
        r#"
        select
            (select max(sales_date) from analytics.fact_sales_daily) as latest_sales_day,
            (select max(labor_date) from analytics.fact_labor_daily) as latest_labor_day,
            (select max(created_at) from staging.restaurant_csv_uploads) as last_ingested_at,
            (select filename from staging.restaurant_csv_uploads
             order by created_at desc limit 1) as last_source_file,
            (select count(*)::bigint from staging.restaurant_csv_uploads) as total_uploads,
            (select sum(row_count)::bigint from staging.restaurant_csv_uploads) as total_staged_rows,
            (select count(*)::bigint from staging.restaurant_csv_uploads
             where created_at >= now() - interval '24 hours') as uploads_24h
        "#,
    )
    .fetch_one(&state.pool)
    .await?;

    Ok(Json(json!({
        "ok": true,
        "now": Utc::now(),
        "latest_sales_day": row.latest_sales_day,
        "latest_labor_day": row.latest_labor_day,
        "last_ingested_at": row.last_ingested_at,
        "last_source_file": row.last_source_file,
        "total_uploads": row.total_uploads,
        "total_staged_rows": row.total_staged_rows.unwrap_or(0),
        "uploads_24h": row.uploads_24h,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_and_validates() {
        assert_eq!(parse_window(&None), "30d");
        assert_eq!(parse_window(&Some("7d".to_string())), "7d");
        assert_eq!(parse_window(&Some("YTD".to_string())), "ytd");
        assert_eq!(parse_window(&Some("14d".to_string())), "30d");
    }

    #[test]
    fn location_accepts_all_and_uuid_only() {
        assert_eq!(parse_location(&None).unwrap(), None);
        assert_eq!(parse_location(&Some("all".to_string())).unwrap(), None);
        let id = Uuid::new_v4();
        assert_eq!(
            parse_location(&Some(id.to_string())).unwrap(),
            Some(id)
        );
        assert!(parse_location(&Some("loc_1".to_string())).is_err());
    }

    #[test]
    fn as_of_parses_rfc3339_or_rejects() {
        assert_eq!(parse_as_of(&None).unwrap(), None);
        assert!(parse_as_of(&Some("2024-05-01T00:00:00Z".to_string()))
            .unwrap()
            .is_some());
        assert!(parse_as_of(&Some("yesterday".to_string())).is_err());
    }

    #[test]
    fn bucket_params_default_and_reject_nonsense() {
        assert_eq!(parse_bucket_param(&None, 10.0), 10.0);
        assert_eq!(parse_bucket_param(&Some("25".to_string()), 10.0), 25.0);
        assert_eq!(parse_bucket_param(&Some(" 12.5 ".to_string()), 10.0), 12.5);
        assert_eq!(parse_bucket_param(&Some("0".to_string()), 10.0), 10.0);
        assert_eq!(parse_bucket_param(&Some("-5".to_string()), 200.0), 200.0);
        assert_eq!(parse_bucket_param(&Some("wide".to_string()), 200.0), 200.0);
        assert_eq!(parse_bucket_param(&Some("inf".to_string()), 200.0), 200.0);
    }

    #[test]
    fn safe_div_guards_zero_and_none() {
        assert_eq!(safe_div(Some(10.0), Some(4.0)), Some(2.5));
        assert_eq!(safe_div(Some(10.0), Some(0.0)), None);
        assert_eq!(safe_div(None, Some(4.0)), None);
    }

    #[test]
    fn sales_severities_follow_thresholds() {
        assert_eq!(severity_from_delta(Some(-6.0)), Severity::Risk);
        assert_eq!(severity_from_delta(Some(-1.0)), Severity::Warn);
        assert_eq!(severity_from_delta(Some(2.0)), Severity::Good);
        assert_eq!(severity_from_margin(Some(45.0)), Severity::Risk);
        assert_eq!(severity_from_margin(Some(55.0)), Severity::Warn);
        assert_eq!(severity_from_discount(Some(13.0)), Severity::Risk);
        assert_eq!(severity_from_discount(Some(9.0)), Severity::Warn);
    }

    #[test]
    fn labor_kpis_preserve_nulls_and_derive_overtime_pct() {
        let row = OpsDeltaRow {
            as_of_ts: None,
            revenue: Some(1000.0),
            labor_cost: Some(300.0),
            labor_cost_delta_pct: Some(2.0),
            labor_hours: Some(100.0),
            labor_hours_delta_pct: None,
            avg_hourly_rate: Some(3.0),
            labor_cost_ratio_pct: None,
            labor_ratio_delta_pp: None,
            sales_per_labor_hour: Some(10.0),
            sales_per_labor_hour_delta_pct: None,
            overtime_hours: Some(8.0),
            overtime_hours_delta_pct: None,
        };
        let kpis = labor_kpis_from_delta(&row);
        let ratio = kpis.iter().find(|k| k.code == "LABOR_COST_RATIO").unwrap();
        assert_eq!(ratio.value, None);
        let ot = kpis.iter().find(|k| k.code == "OVERTIME_PCT").unwrap();
        assert_eq!(ot.value, Some(8.0));
    }
}
