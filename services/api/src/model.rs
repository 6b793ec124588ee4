//! Shared domain types: dataset enum, mapping shapes, KPI payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The three operational datasets a CSV upload can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dataset {
    Sales,
    Labor,
    Inventory,
}

impl Dataset {
    pub fn parse(s: &str) -> Option<Dataset> {
        match s.trim().to_lowercase().as_str() {
            "sales" => Some(Dataset::Sales),
            "labor" => Some(Dataset::Labor),
            "inventory" => Some(Dataset::Inventory),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Dataset::Sales => "sales",
            Dataset::Labor => "labor",
            Dataset::Inventory => "inventory",
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a mapping's metric list: canonical metric name -> source column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricMap {
    pub metric: String,
    pub col: String,
}

/// Upload metadata as stored in staging.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct UploadRow {
    pub upload_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub filename: String,
    pub size_bytes: i64,
    pub row_count: i32,
    pub columns: serde_json::Value,
    pub location_id: Option<Uuid>,
    pub dataset: String,
}

/// Column mapping as stored in staging.
#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct MappingRow {
    pub mapping_id: Uuid,
    pub upload_id: Uuid,
    pub dataset: String,
    pub date_col: String,
    pub location_col: Option<String>,
    pub location_mode: String,
    pub metrics: serde_json::Value,
    pub status: String,
    pub validation_errors: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MappingRow {
    /// Decode the JSON metric list. Malformed entries are dropped.
    pub fn metric_list(&self) -> Vec<MetricMap> {
        serde_json::from_value(self.metrics.clone()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Good,
    Warn,
    Risk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Usd,
    Pct,
    Days,
    Ratio,
    Count,
    Hours,
}

/// One KPI tile as the dashboard consumes it.
#[derive(Debug, Clone, Serialize)]
pub struct Kpi {
    pub code: String,
    pub label: String,
    pub value: Option<f64>,
    pub unit: Unit,
    pub delta: Option<f64>,
    pub severity: Severity,
    pub hint: String,
}

impl Kpi {
    pub fn new(
        code: &str,
        label: &str,
        value: Option<f64>,
        unit: Unit,
        delta: Option<f64>,
        hint: &str,
    ) -> Kpi {
        Kpi {
            code: code.to_string(),
            label: label.to_string(),
            value,
            unit,
            delta,
            severity: Severity::Good,
            hint: hint.to_string(),
        }
    }
}

/// Location descriptor echoed back on KPI responses.
#[derive(Debug, Clone, Serialize)]
pub struct LocationInfo {
    pub id: String,
    pub name: String,
}

impl LocationInfo {
    pub fn from_param(location_id: Option<Uuid>) -> LocationInfo {
        match location_id {
            Some(id) => LocationInfo {
                id: id.to_string(),
                name: "Location".to_string(),
            },
            None => LocationInfo {
                id: "all".to_string(),
                name: "All Locations".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_parse_accepts_known_values() {
        assert_eq!(Dataset::parse("labor"), Some(Dataset::Labor));
        assert_eq!(Dataset::parse(" SALES "), Some(Dataset::Sales));
        assert_eq!(Dataset::parse("inventory"), Some(Dataset::Inventory));
        assert_eq!(Dataset::parse("payroll"), None);
        assert_eq!(Dataset::parse(""), None);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(Severity::Risk).unwrap(),
            serde_json::json!("risk")
        );
        assert_eq!(
            serde_json::to_value(Unit::Usd).unwrap(),
            serde_json::json!("usd")
        );
    }
}
