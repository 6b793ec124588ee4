//! Mapping Validator + mapping CRUD.
//!
//! GET  /data/mappings   list mappings (optionally for one upload)
//! POST /data/mappings   create a mapping, or re-edit one back to draft
//!
//! Draft-save validation is deliberately soft: metric entries may be empty so
//! the UI can save incrementally. The hard per-row validation happens at
//! promotion time (see promote.rs).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::{Dataset, MappingRow, MetricMap};
use crate::AppState;

pub const LOCATION_MODES: &[&str] = &["code", "id", "name"];

const MAPPING_LIST_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
pub struct MappingPayload {
    pub mapping_id: Option<Uuid>,
    pub upload_id: Option<Uuid>,
    pub dataset: Option<String>,
    pub date_col: Option<String>,
    pub location_col: Option<String>,
    pub location_mode: Option<String>,
    #[serde(default)]
    pub metrics: Vec<MetricMap>,
}

/// A payload that passed draft-save validation.
#[derive(Debug)]
pub struct DraftMapping {
    pub upload_id: Uuid,
    pub dataset: Dataset,
    pub date_col: String,
    pub location_col: Option<String>,
    pub location_mode: String,
    pub metrics: Vec<MetricMap>,
}

fn clean(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Draft-save validation: upload reference, dataset enum, date column and
/// location mode must be sound; metric entries are optional but, if present,
/// need both a metric name and a source column.
pub fn validate_draft(p: &MappingPayload) -> Result<DraftMapping, Vec<String>> {
    let mut errors = Vec::new();

    if p.upload_id.is_none() {
        errors.push("upload_id required".to_string());
    }
    let dataset = match p.dataset.as_deref().and_then(Dataset::parse) {
        Some(d) => Some(d),
        None => {
            errors.push("dataset must be sales|labor|inventory".to_string());
            None
        }
    };
    let date_col = clean(&p.date_col);
    if date_col.is_none() {
        errors.push("date_col required".to_string());
    }
    let location_mode = clean(&p.location_mode).unwrap_or_else(|| "code".to_string());
    if !LOCATION_MODES.contains(&location_mode.as_str()) {
        errors.push("location_mode must be code|id|name".to_string());
    }

    let mut metrics = Vec::new();
    for m in &p.metrics {
        let metric = m.metric.trim();
        let col = m.col.trim();
        if metric.is_empty() || col.is_empty() {
            errors.push("metrics entries require metric + col".to_string());
            continue;
        }
        metrics.push(MetricMap {
            metric: metric.to_string(),
            col: col.to_string(),
        });
    }

    match (p.upload_id, dataset, date_col) {
        (Some(upload_id), Some(dataset), Some(date_col)) if errors.is_empty() => Ok(DraftMapping {
            upload_id,
            dataset,
            date_col,
            location_col: clean(&p.location_col),
            location_mode,
            metrics,
        }),
        _ => Err(errors),
    }
}

#[derive(Deserialize)]
pub struct MappingsQuery {
    pub upload_id: Option<Uuid>,
}

/// GET /data/mappings
pub async fn list_mappings_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<MappingsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let mappings: Vec<MappingRow> = sqlx::query_as(
        r#"
        select mapping_id, upload_id, dataset, date_col, location_col, location_mode,
               metrics, status, validation_errors, created_at, updated_at
        from staging.restaurant_csv_mappings
        where ($1::uuid is null or upload_id = $1)
        order by created_at desc
        limit $2
        "#,
    )
    .bind(params.upload_id)
    .bind(MAPPING_LIST_LIMIT)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({ "ok": true, "mappings": mappings })))
}

/// POST /data/mappings
///
/// Creates a new draft mapping, or updates an existing one. An update always
/// resets status to draft and clears prior validation errors, so an edited
/// mapping must be re-promoted.
pub async fn save_mapping_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MappingPayload>,
) -> ApiResult<Json<serde_json::Value>> {
    let draft = validate_draft(&payload).map_err(|errs| ApiError::BadRequest(errs.join(", ")))?;
    let metrics_json = serde_json::to_value(&draft.metrics).map_err(anyhow::Error::from)?;

    let mapping: MappingRow = if let Some(mapping_id) = payload.mapping_id {
        sqlx::query_as(
            r#"
            update staging.restaurant_csv_mappings
            set dataset = $2,
                date_col = $3,
                location_col = $4,
                location_mode = $5,
                metrics = $6::jsonb,
                status = 'draft',
                validation_errors = '[]'::jsonb,
                updated_at = now()
            where mapping_id = $1
            returning mapping_id, upload_id, dataset, date_col, location_col, location_mode,
                      metrics, status, validation_errors, created_at, updated_at
            "#,
        )
        .bind(mapping_id)
        .bind(draft.dataset.as_str())
        .bind(&draft.date_col)
        .bind(&draft.location_col)
        .bind(&draft.location_mode)
        .bind(&metrics_json)
        .fetch_optional(&state.pool)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("mapping {mapping_id} not found")))?
    } else {
        sqlx::query_as(
            r#"
            insert into staging.restaurant_csv_mappings
              (mapping_id, upload_id, dataset, date_col, location_col, location_mode, metrics)
            values ($1, $2, $3, $4, $5, $6, $7::jsonb)
            returning mapping_id, upload_id, dataset, date_col, location_col, location_mode,
                      metrics, status, validation_errors, created_at, updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(draft.upload_id)
        .bind(draft.dataset.as_str())
        .bind(&draft.date_col)
        .bind(&draft.location_col)
        .bind(&draft.location_mode)
        .bind(&metrics_json)
        .fetch_one(&state.pool)
        .await?
    };

    Ok(Json(json!({ "ok": true, "mapping": mapping })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MappingPayload {
        MappingPayload {
            mapping_id: None,
            upload_id: Some(Uuid::new_v4()),
            dataset: Some("labor".to_string()),
            date_col: Some("day".to_string()),
            location_col: Some("location_id".to_string()),
            location_mode: None,
            metrics: vec![MetricMap {
                metric: "labor_hours".to_string(),
                col: "hours".to_string(),
            }],
        }
    }

    #[test]
    fn accepts_complete_payload_and_defaults_location_mode() {
        let draft = validate_draft(&payload()).unwrap();
        assert_eq!(draft.dataset, Dataset::Labor);
        assert_eq!(draft.location_mode, "code");
        assert_eq!(draft.metrics.len(), 1);
    }

    #[test]
    fn metrics_may_be_empty_in_draft() {
        let mut p = payload();
        p.metrics.clear();
        assert!(validate_draft(&p).is_ok());
    }

    #[test]
    fn missing_fields_collect_every_error() {
        let p = MappingPayload {
            mapping_id: None,
            upload_id: None,
            dataset: Some("payroll".to_string()),
            date_col: Some("  ".to_string()),
            location_col: None,
            location_mode: None,
            metrics: vec![],
        };
        let errs = validate_draft(&p).unwrap_err();
        assert!(errs.iter().any(|e| e.contains("upload_id")));
        assert!(errs.iter().any(|e| e.contains("dataset")));
        assert!(errs.iter().any(|e| e.contains("date_col")));
    }

    #[test]
    fn rejects_bad_location_mode() {
        let mut p = payload();
        p.location_mode = Some("zip".to_string());
        let errs = validate_draft(&p).unwrap_err();
        assert_eq!(errs, vec!["location_mode must be code|id|name"]);
    }

    #[test]
    fn rejects_half_filled_metric_entries() {
        let mut p = payload();
        p.metrics.push(MetricMap {
            metric: "overtime_hours".to_string(),
            col: "".to_string(),
        });
        let errs = validate_draft(&p).unwrap_err();
        assert_eq!(errs, vec!["metrics entries require metric + col"]);
    }
}
