//! Promotion Engine: staging rows + mapping -> canonical fact rows.
//!
//! POST /data/promote/{dataset}
//!
//! Per-dataset fact tables are described by a static spec (table name, date
//! column, canonical metric columns). Promotion resolves each staging row
//! through the mapping, collects row-level errors, and either aborts with no
//! writes (any date failure) or upserts every fact row in one transaction.
//!
//! Fact rows are keyed by (date, location-or-sentinel): rows without a
//! location code use the `__na__` sentinel in the conflict target so repeated
//! promotions overwrite instead of duplicating.
//!
//! Concurrent promotions of the same mapping are not serialized; the store's
//! upsert semantics make the last committed writer win per fact row.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult, RowError, ROW_ERROR_STORE_CAP};
use crate::model::{Dataset, MappingRow};
use crate::AppState;

/// Sentinel used in the fact-table uniqueness key when a row has no location.
pub const NO_LOCATION_SENTINEL: &str = "__na__";

/// Shape of one dataset's fact table. Canonical metric names double as the
/// fact column names.
pub struct FactSpec {
    pub dataset: Dataset,
    pub table: &'static str,
    pub date_column: &'static str,
    pub metric_columns: &'static [&'static str],
}

pub const FACT_SPECS: &[FactSpec] = &[
    FactSpec {
        dataset: Dataset::Labor,
        table: "analytics.fact_labor_daily",
        date_column: "labor_date",
        metric_columns: &[
            "labor_hours",
            "labor_cost_usd",
            "overtime_hours",
            "overtime_cost_usd",
            "headcount",
        ],
    },
    FactSpec {
        dataset: Dataset::Sales,
        table: "analytics.fact_sales_daily",
        date_column: "sales_date",
        metric_columns: &["revenue_usd", "orders", "discounts_usd", "covers"],
    },
    FactSpec {
        dataset: Dataset::Inventory,
        table: "analytics.fact_inventory_daily",
        date_column: "inv_date",
        metric_columns: &["on_hand_value_usd", "units_on_hand", "waste_usd", "cogs_usd"],
    },
];

pub fn fact_spec(dataset: Dataset) -> &'static FactSpec {
    match dataset {
        Dataset::Labor => &FACT_SPECS[0],
        Dataset::Sales => &FACT_SPECS[1],
        Dataset::Inventory => &FACT_SPECS[2],
    }
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// Numeric coercion for metric cells: strips currency symbols, thousands
/// separators, percent signs and whitespace. Anything that still doesn't
/// parse to a finite number yields null, never a row error.
pub fn coerce_number(v: Option<&Value>) -> Option<f64> {
    match v {
        Some(Value::Number(n)) => n.as_f64().filter(|x| x.is_finite()),
        Some(Value::String(s)) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | '%') && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return None;
            }
            cleaned.parse::<f64>().ok().filter(|x| x.is_finite())
        }
        _ => None,
    }
}

/// Date coercion: ISO date, ISO datetime (with or without offset) or a
/// US-style locale date. Empty/unparseable values yield None, which is a hard
/// row error at promotion time.
pub fn coerce_date(v: Option<&Value>) -> Option<NaiveDate> {
    let s = v?.as_str()?.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.date());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%m/%d/%Y") {
        return Some(d);
    }
    None
}

// ---------------------------------------------------------------------------
// Row resolution
// ---------------------------------------------------------------------------

/// Column lookup derived from a mapping, ready to resolve staging rows.
pub struct MappingContext {
    pub date_col: String,
    pub location_col: Option<String>,
    /// canonical metric name -> source column name
    pub metric_cols: HashMap<String, String>,
}

impl MappingContext {
    pub fn from_mapping(mapping: &MappingRow) -> MappingContext {
        let metric_cols = mapping
            .metric_list()
            .into_iter()
            .map(|m| (m.metric, m.col))
            .collect();
        MappingContext {
            date_col: mapping.date_col.clone(),
            location_col: mapping.location_col.clone(),
            metric_cols,
        }
    }
}

/// One staging row resolved to canonical values, metrics parallel to the
/// spec's `metric_columns`.
#[derive(Debug, PartialEq)]
pub struct ResolvedRow {
    pub row_num: i64,
    pub date: NaiveDate,
    pub location_code: Option<String>,
    pub metrics: Vec<Option<f64>>,
}

/// Resolve every staging row, or return every row-level error. All-or-nothing:
/// a single date failure fails the batch.
pub fn resolve_rows(
    spec: &FactSpec,
    ctx: &MappingContext,
    rows: &[(i64, Value)],
) -> Result<Vec<ResolvedRow>, Vec<RowError>> {
    let mut resolved = Vec::with_capacity(rows.len());
    let mut errors = Vec::new();

    for (row_num, row) in rows {
        let empty = serde_json::Map::new();
        let obj = row.as_object().unwrap_or(&empty);

        let Some(date) = coerce_date(obj.get(&ctx.date_col)) else {
            errors.push(RowError {
                row_num: *row_num,
                error: format!("Invalid date in column \"{}\"", ctx.date_col),
            });
            continue;
        };

        let location_code = ctx
            .location_col
            .as_ref()
            .and_then(|c| obj.get(c))
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let metrics = spec
            .metric_columns
            .iter()
            .map(|metric| {
                ctx.metric_cols
                    .get(*metric)
                    .and_then(|col| coerce_number(obj.get(col)))
            })
            .collect();

        resolved.push(ResolvedRow {
            row_num: *row_num,
            date,
            location_code,
            metrics,
        });
    }

    if errors.is_empty() {
        Ok(resolved)
    } else {
        Err(errors)
    }
}

/// Upsert statement for one dataset's fact table. Conflict target matches the
/// store's expression index on (date, coalesce(location_code, sentinel)).
pub fn upsert_sql(spec: &FactSpec) -> String {
    let mut columns = vec![spec.date_column, "location_code"];
    columns.extend_from_slice(spec.metric_columns);
    columns.push("upload_id");

    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = spec
        .metric_columns
        .iter()
        .chain(std::iter::once(&"upload_id"))
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();

    format!(
        "insert into {table} ({columns})\n\
         values ({placeholders})\n\
         on conflict ({date_col}, coalesce(location_code, '{sentinel}'))\n\
         do update set {updates}",
        table = spec.table,
        columns = columns.join(", "),
        placeholders = placeholders.join(", "),
        date_col = spec.date_column,
        sentinel = NO_LOCATION_SENTINEL,
        updates = updates.join(", "),
    )
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct PromoteRequest {
    pub mapping_id: Option<Uuid>,
}

/// POST /data/promote/{dataset}
pub async fn promote_handler(
    State(state): State<Arc<AppState>>,
    Path(dataset_raw): Path<String>,
    Json(body): Json<PromoteRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let dataset = Dataset::parse(&dataset_raw).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Invalid dataset: \"{dataset_raw}\". Use labor|sales|inventory."
        ))
    })?;
    let mapping_id = body
        .mapping_id
        .ok_or_else(|| ApiError::BadRequest("mapping_id required".to_string()))?;

    let mapping: MappingRow = sqlx::query_as(
        r#"
        select mapping_id, upload_id, dataset, date_col, location_col, location_mode,
               metrics, status, validation_errors, created_at, updated_at
        from staging.restaurant_csv_mappings
        where mapping_id = $1
        "#,
    )
    .bind(mapping_id)
    .fetch_optional(&state.pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("mapping not found".to_string()))?;

    if mapping.dataset != dataset.as_str() {
        return Err(ApiError::BadRequest(format!(
            "mapping dataset must be {dataset}"
        )));
    }

    let staged: Vec<(i64, Value)> = sqlx::query_as(
        r#"
        select row_num, row
        from staging.restaurant_csv_rows
        where upload_id = $1
        order by row_num asc
        "#,
    )
    .bind(mapping.upload_id)
    .fetch_all(&state.pool)
    .await?;

    if staged.is_empty() {
        return Err(ApiError::BadRequest(
            "No parsed rows for upload_id".to_string(),
        ));
    }

    let spec = fact_spec(dataset);
    let ctx = MappingContext::from_mapping(&mapping);

    let resolved = match resolve_rows(spec, &ctx, &staged) {
        Ok(rows) => rows,
        Err(errors) => {
            let total = errors.len();
            let stored: Vec<&RowError> = errors.iter().take(ROW_ERROR_STORE_CAP).collect();
            let stored_json = serde_json::to_value(&stored).map_err(anyhow::Error::from)?;

            sqlx::query(
                r#"
                update staging.restaurant_csv_mappings
                set status = 'error', validation_errors = $2::jsonb, updated_at = now()
                where mapping_id = $1
                "#,
            )
            .bind(mapping_id)
            .bind(&stored_json)
            .execute(&state.pool)
            .await?;

            tracing::warn!(%mapping_id, dataset = %dataset, errors = total, "promotion validation failed");
            return Err(ApiError::Validation { errors, total });
        }
    };

    // Transactional phase. Any single write failure rolls back everything.
    let sql = upsert_sql(spec);
    let mut tx = state.pool.begin().await?;

    for row in &resolved {
        let mut q = sqlx::query(&sql).bind(row.date).bind(&row.location_code);
        for metric in &row.metrics {
            q = q.bind(metric);
        }
        q = q.bind(mapping.upload_id);
        q.execute(&mut *tx).await?;
    }

    sqlx::query(
        r#"
        update staging.restaurant_csv_mappings
        set status = 'promoted', validation_errors = '[]'::jsonb, updated_at = now()
        where mapping_id = $1
        "#,
    )
    .bind(mapping_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    tracing::info!(%mapping_id, dataset = %dataset, promoted = resolved.len(), "promotion committed");

    Ok(Json(json!({
        "ok": true,
        "promoted": resolved.len(),
        "upload_id": mapping.upload_id,
        "mapping_id": mapping_id,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labor_ctx() -> MappingContext {
        let mut metric_cols = HashMap::new();
        metric_cols.insert("labor_hours".to_string(), "hours".to_string());
        metric_cols.insert("labor_cost_usd".to_string(), "cost".to_string());
        MappingContext {
            date_col: "day".to_string(),
            location_col: Some("location_id".to_string()),
            metric_cols,
        }
    }

    fn row(day: &str, loc: &str, hours: &str) -> Value {
        json!({ "day": day, "location_id": loc, "hours": hours, "cost": "100" })
    }

    #[test]
    fn coerce_number_strips_currency_formatting() {
        assert_eq!(coerce_number(Some(&json!("$1,234.50"))), Some(1234.50));
        assert_eq!(coerce_number(Some(&json!("37.5"))), Some(37.5));
        assert_eq!(coerce_number(Some(&json!(42))), Some(42.0));
        assert_eq!(coerce_number(Some(&json!(" 12 % "))), Some(12.0));
    }

    #[test]
    fn coerce_number_yields_null_not_error() {
        assert_eq!(coerce_number(Some(&json!(""))), None);
        assert_eq!(coerce_number(Some(&json!("n/a"))), None);
        assert_eq!(coerce_number(Some(&Value::Null)), None);
        assert_eq!(coerce_number(None), None);
    }

    #[test]
    fn coerce_date_accepts_iso_and_locale_forms() {
        let expect = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(coerce_date(Some(&json!("2024-01-15"))), Some(expect));
        assert_eq!(
            coerce_date(Some(&json!("2024-01-15T08:30:00Z"))),
            Some(expect)
        );
        assert_eq!(coerce_date(Some(&json!("1/15/2024"))), Some(expect));
        assert_eq!(coerce_date(Some(&json!("01/15/2024"))), Some(expect));
    }

    #[test]
    fn coerce_date_rejects_garbage() {
        assert_eq!(coerce_date(Some(&json!(""))), None);
        assert_eq!(coerce_date(Some(&json!("not-a-date"))), None);
        assert_eq!(coerce_date(Some(&json!("2024-13-40"))), None);
        assert_eq!(coerce_date(None), None);
    }

    #[test]
    fn resolves_mapped_metrics_round_trip() {
        let spec = fact_spec(Dataset::Labor);
        let rows = vec![(2, row("2024-01-15", "loc_1", "37.5"))];
        let resolved = resolve_rows(spec, &labor_ctx(), &rows).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved[0].date,
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
        );
        // labor_hours is the first metric column
        assert_eq!(resolved[0].metrics[0], Some(37.5));
        assert_eq!(resolved[0].metrics[1], Some(100.0));
        // unmapped metrics stay null
        assert_eq!(resolved[0].metrics[2], None);
    }

    #[test]
    fn one_bad_date_fails_the_whole_batch() {
        let spec = fact_spec(Dataset::Labor);
        let rows = vec![
            (2, row("2024-03-01", "loc_1", "8")),
            (3, row("march 2nd", "loc_1", "8")),
            (4, row("2024-03-03", "loc_1", "8")),
        ];
        let errors = resolve_rows(spec, &labor_ctx(), &rows).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].row_num, 3);
        assert!(errors[0].error.contains("\"day\""));
    }

    #[test]
    fn missing_location_resolves_to_none() {
        let spec = fact_spec(Dataset::Labor);
        let rows = vec![(2, json!({ "day": "2024-03-01", "location_id": "  ", "hours": "8" }))];
        let resolved = resolve_rows(spec, &labor_ctx(), &rows).unwrap();
        assert_eq!(resolved[0].location_code, None);
    }

    #[test]
    fn non_numeric_metric_is_null_not_a_row_error() {
        let spec = fact_spec(Dataset::Labor);
        let rows = vec![(2, row("2024-03-01", "loc_1", "eight"))];
        let resolved = resolve_rows(spec, &labor_ctx(), &rows).unwrap();
        assert_eq!(resolved[0].metrics[0], None);
    }

    #[test]
    fn upsert_sql_uses_sentinel_conflict_key() {
        let sql = upsert_sql(fact_spec(Dataset::Labor));
        assert!(sql.contains("insert into analytics.fact_labor_daily"));
        assert!(sql.contains("on conflict (labor_date, coalesce(location_code, '__na__'))"));
        assert!(sql.contains("labor_hours = excluded.labor_hours"));
        assert!(sql.contains("upload_id = excluded.upload_id"));
        // date + location + 5 metrics + upload_id
        assert!(sql.contains("$8"));
        assert!(!sql.contains("$9"));
    }

    #[test]
    fn every_dataset_has_a_spec_with_distinct_table() {
        for d in [Dataset::Labor, Dataset::Sales, Dataset::Inventory] {
            assert_eq!(fact_spec(d).dataset, d);
        }
        let tables: Vec<&str> = FACT_SPECS.iter().map(|s| s.table).collect();
        assert_eq!(tables.len(), 3);
        let mut dedup = tables.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), 3);
    }
}
