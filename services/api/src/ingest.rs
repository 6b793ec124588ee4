//! CSV Parser + Row Normalizer.
//!
//! Tokenizes an uploaded CSV body into staging rows:
//! - quoted cells may contain commas, doubled quotes and embedded newlines
//! - CRLF and LF both terminate records; a trailing newline adds no row
//! - header names are normalized (trim, lowercase, spaces -> underscores)
//! - rows keep their original 1-based file line number for error reporting
//!
//! No typed coercion happens here: different datasets interpret the same
//! columns differently, so values stay raw strings (empty cells become null)
//! until the Promotion Engine resolves them.
//!
//! An unterminated quote at end of input is tolerated: the remaining text
//! becomes part of the final cell. See DESIGN.md.

use serde_json::Value;

/// One parsed CSV data row awaiting mapping/promotion.
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    /// Original 1-based line in the uploaded file (header is line 1).
    pub row_num: i64,
    /// field name -> raw trimmed value, null for empty cells.
    pub fields: serde_json::Map<String, Value>,
}

/// Result of parsing one upload body.
#[derive(Debug)]
pub struct ParsedUpload {
    /// Normalized, non-empty column names in file order.
    pub columns: Vec<String>,
    pub rows: Vec<StagingRow>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("CSV must include a header row")]
    Empty,
    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("CSV parse error: {0}")]
    Csv(#[from] csv::Error),
}

/// trim, lowercase, collapse whitespace runs into single underscores.
pub fn normalize_header(h: &str) -> String {
    h.trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

/// Parse an upload body into staging rows, failing the whole upload if any
/// required column is absent from the header. A header-only file stages zero
/// rows; only a body with no header at all is rejected.
pub fn parse_upload(text: &str, required: &[&str]) -> Result<ParsedUpload, IngestError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut records = reader.records();

    // Header is the first non-blank record.
    let header = loop {
        match records.next() {
            Some(rec) => {
                let rec = rec?;
                if rec.iter().any(|c| !c.trim().is_empty()) {
                    break rec;
                }
            }
            None => return Err(IngestError::Empty),
        }
    };

    // Positional header names; empty names keep their slot so indexes line up.
    let headers: Vec<String> = header.iter().map(normalize_header).collect();
    let columns: Vec<String> = headers.iter().filter(|c| !c.is_empty()).cloned().collect();

    let missing: Vec<String> = required
        .iter()
        .filter(|r| !headers.iter().any(|h| h == *r))
        .map(|r| r.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(IngestError::MissingColumns(missing));
    }

    let mut rows = Vec::new();
    for rec in records {
        let rec = rec?;
        if rec.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let row_num = rec.position().map(|p| p.line() as i64).unwrap_or(0);

        let mut fields = serde_json::Map::new();
        for (i, name) in headers.iter().enumerate() {
            if name.is_empty() {
                continue;
            }
            let cell = rec.get(i).map(str::trim).unwrap_or("");
            let value = if cell.is_empty() {
                Value::Null
            } else {
                Value::String(cell.to_string())
            };
            fields.insert(name.clone(), value);
        }
        rows.push(StagingRow { row_num, fields });
    }

    Ok(ParsedUpload { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field<'a>(row: &'a StagingRow, name: &str) -> Option<&'a str> {
        row.fields.get(name).and_then(|v| v.as_str())
    }

    #[test]
    fn parses_simple_upload() {
        let up = parse_upload(
            "location_id,day,revenue\nloc_1,2024-03-01,500\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.columns, vec!["location_id", "day", "revenue"]);
        assert_eq!(up.rows.len(), 1);
        assert_eq!(up.rows[0].row_num, 2);
        assert_eq!(field(&up.rows[0], "revenue"), Some("500"));
    }

    #[test]
    fn normalizes_header_names() {
        let up = parse_upload(
            " Location ID ,  Day \nloc_1,2024-03-01\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.columns, vec!["location_id", "day"]);
    }

    #[test]
    fn missing_required_columns_names_every_one() {
        let err = parse_upload("revenue\n500\n", &["location_id", "day"]).unwrap_err();
        match err {
            IngestError::MissingColumns(cols) => {
                assert_eq!(cols, vec!["location_id", "day"]);
            }
            other => panic!("expected MissingColumns, got {other:?}"),
        }
    }

    #[test]
    fn quoted_cells_keep_commas_and_doubled_quotes() {
        let up = parse_upload(
            "location_id,day,note\nloc_1,2024-03-01,\"a, \"\"b\"\"\"\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(field(&up.rows[0], "note"), Some("a, \"b\""));
    }

    #[test]
    fn quoted_cells_may_span_lines_and_row_numbers_track_file_lines() {
        let up = parse_upload(
            "location_id,day,note\nloc_1,2024-03-01,\"line one\nline two\"\nloc_2,2024-03-02,x\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.rows.len(), 2);
        assert_eq!(field(&up.rows[0], "note"), Some("line one\nline two"));
        // second record starts on physical line 4 (quoted cell spans 2 lines)
        assert_eq!(up.rows[1].row_num, 4);
    }

    #[test]
    fn crlf_and_trailing_newline_add_no_spurious_rows() {
        let up = parse_upload(
            "location_id,day\r\nloc_1,2024-03-01\r\nloc_2,2024-03-02\r\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.rows.len(), 2);
    }

    #[test]
    fn blank_rows_are_skipped_without_renumbering() {
        let up = parse_upload(
            "location_id,day\nloc_1,2024-03-01\n,\nloc_2,2024-03-02\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.rows.len(), 2);
        assert_eq!(up.rows[0].row_num, 2);
        assert_eq!(up.rows[1].row_num, 4);
    }

    #[test]
    fn empty_cells_become_null() {
        let up = parse_upload(
            "location_id,day,revenue\nloc_1,2024-03-01,\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert!(up.rows[0].fields.get("revenue").unwrap().is_null());
    }

    #[test]
    fn header_only_upload_stages_zero_rows() {
        let up = parse_upload("location_id,day\n", &["location_id", "day"]).unwrap();
        assert_eq!(up.columns, vec!["location_id", "day"]);
        assert!(up.rows.is_empty());
    }

    #[test]
    fn body_without_a_header_is_rejected() {
        assert!(matches!(parse_upload("", &[]), Err(IngestError::Empty)));
        assert!(matches!(
            parse_upload("\n\n  \n", &["location_id"]),
            Err(IngestError::Empty)
        ));
    }

    #[test]
    fn unterminated_quote_is_lenient() {
        // rest of input folds into the final cell
        let up = parse_upload(
            "location_id,day,note\nloc_1,2024-03-01,\"open ended\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.rows.len(), 1);
        assert_eq!(field(&up.rows[0], "note"), Some("open ended"));
    }

    #[test]
    fn bom_is_stripped_before_header_discovery() {
        let up = parse_upload(
            "\u{feff}location_id,day\nloc_1,2024-03-01\n",
            &["location_id", "day"],
        )
        .unwrap();
        assert_eq!(up.columns[0], "location_id");
    }
}
