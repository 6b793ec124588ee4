//! Upload handlers + staging store adapter.
//!
//! POST /uploads        multipart CSV -> parse -> stage Upload + StagingRows
//! GET  /uploads        list recent uploads
//! GET  /data/columns   discover the columns of one upload

use std::sync::Arc;

use axum::extract::{Multipart, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::ingest::{parse_upload, IngestError};
use crate::model::{Dataset, UploadRow};
use crate::AppState;

/// Key columns every staged CSV must carry; promotion resolves everything
/// else through the mapping.
pub const REQUIRED_COLUMNS: &[&str] = &["location_id", "day"];

const UPLOAD_LIST_LIMIT: i64 = 25;

/// POST /uploads
///
/// Accepts multipart fields `file` (the CSV), `dataset` (sales|labor|inventory)
/// and optional `location_id`. The upload and all its staging rows are
/// persisted as one atomic unit; a failed parse stages nothing.
pub async fn create_upload_handler(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<serde_json::Value>> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut filename = String::new();
    let mut dataset_raw = String::new();
    let mut location_raw = String::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Malformed multipart body: {e}")))?
    {
        match field.name() {
            Some("file") => {
                filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(format!("Failed to read file: {e}")))?;
                file_bytes = Some(bytes.to_vec());
            }
            Some("dataset") => {
                dataset_raw = field.text().await.unwrap_or_default();
            }
            Some("location_id") => {
                location_raw = field.text().await.unwrap_or_default();
            }
            _ => {}
        }
    }

    let dataset = Dataset::parse(&dataset_raw).ok_or_else(|| {
        ApiError::BadRequest(format!(
            "Invalid dataset: \"{}\". Use labor|sales|inventory.",
            dataset_raw.trim()
        ))
    })?;
    let bytes = file_bytes
        .ok_or_else(|| ApiError::BadRequest("Missing field: file".to_string()))?;
    if !filename.to_lowercase().ends_with(".csv") {
        return Err(ApiError::BadRequest(
            "Only .csv files are supported".to_string(),
        ));
    }

    let location_id: Option<Uuid> = match location_raw.trim() {
        "" | "all" => None,
        raw => Some(
            Uuid::parse_str(raw)
                .map_err(|_| ApiError::BadRequest(format!("Invalid location_id: \"{raw}\"")))?,
        ),
    };

    let size_bytes = bytes.len() as i64;
    let text = String::from_utf8(bytes)
        .map_err(|_| ApiError::BadRequest("File is not valid UTF-8".to_string()))?;

    let parsed = parse_upload(&text, REQUIRED_COLUMNS).map_err(|e| match e {
        IngestError::Csv(inner) => ApiError::BadRequest(format!("CSV parse error: {inner}")),
        other => ApiError::BadRequest(other.to_string()),
    })?;

    let upload_id = Uuid::new_v4();
    let row_count = parsed.rows.len() as i32;
    let columns_json = serde_json::to_value(&parsed.columns).map_err(anyhow::Error::from)?;

    let mut tx = state.pool.begin().await?;

    let created_at: (chrono::DateTime<chrono::Utc>,) = sqlx::query_as(
        r#"
        insert into staging.restaurant_csv_uploads
          (upload_id, filename, size_bytes, row_count, columns, location_id, dataset, csv_text)
        values
          ($1, $2, $3, $4, $5::jsonb, $6, $7, $8)
        returning created_at
        "#,
    )
    .bind(upload_id)
    .bind(&filename)
    .bind(size_bytes)
    .bind(row_count)
    .bind(&columns_json)
    .bind(location_id)
    .bind(dataset.as_str())
    .bind(&text)
    .fetch_one(&mut *tx)
    .await?;

    for row in &parsed.rows {
        sqlx::query(
            r#"
            insert into staging.restaurant_csv_rows (upload_id, row_num, row)
            values ($1, $2, $3::jsonb)
            "#,
        )
        .bind(upload_id)
        .bind(row.row_num)
        .bind(serde_json::Value::Object(row.fields.clone()))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    tracing::info!(
        %upload_id,
        dataset = dataset.as_str(),
        rows = row_count,
        filename = %filename,
        "staged upload"
    );

    Ok(Json(json!({
        "ok": true,
        "upload_id": upload_id,
        "created_at": created_at.0,
        "filename": filename,
        "size_bytes": size_bytes,
        "row_count": row_count,
        "columns": parsed.columns,
        "location_id": location_id,
        "dataset": dataset.as_str(),
    })))
}

/// GET /uploads
pub async fn list_uploads_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let uploads: Vec<UploadRow> = sqlx::query_as(
        r#"
        select upload_id, created_at, filename, size_bytes, row_count,
               columns, location_id, dataset
        from staging.restaurant_csv_uploads
        order by created_at desc
        limit $1
        "#,
    )
    .bind(UPLOAD_LIST_LIMIT)
    .fetch_all(&state.pool)
    .await?;

    Ok(Json(json!({ "ok": true, "uploads": uploads })))
}

#[derive(Deserialize)]
pub struct ColumnsQuery {
    pub upload_id: Option<Uuid>,
}

/// GET /data/columns?upload_id=
///
/// Column discovery reads the first staged row; ordering by row_num makes
/// this deterministic for a given upload.
pub async fn columns_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ColumnsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let upload_id = params
        .upload_id
        .ok_or_else(|| ApiError::BadRequest("upload_id required".to_string()))?;

    let first: Option<(serde_json::Value,)> = sqlx::query_as(
        r#"
        select row
        from staging.restaurant_csv_rows
        where upload_id = $1
        order by row_num asc
        limit 1
        "#,
    )
    .bind(upload_id)
    .fetch_optional(&state.pool)
    .await?;

    let columns: Vec<String> = match first {
        Some((serde_json::Value::Object(map),)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };

    Ok(Json(json!({
        "ok": true,
        "upload_id": upload_id,
        "columns": columns,
    })))
}
