//! Stage logic: validation, the transform modes, and summarisation
//!
//! These are pure functions over the tabular form; the executor owns
//! telemetry, timeouts and persistence around them.

use serde_json::Value;
use std::collections::BTreeMap;

use super::table::{format_numeric, NumericStats, Table};
use crate::errors::{StageError, StageResult};
use crate::models::{ProcessMode, Upload};

/// Validate the standardized table against the department's requirements
///
/// All violations are gathered into a single message so one upload round
/// trip surfaces every problem at once.
pub fn validate(table: &Table, required_columns: &[String]) -> StageResult<String> {
    let mut errors = Vec::new();

    if table.col_count() == 0 {
        errors.push("No columns detected".to_string());
    }
    if table.row_count() == 0 {
        errors.push("No rows detected".to_string());
    }

    let missing: Vec<&str> = required_columns
        .iter()
        .filter(|c| table.column_index(c).is_none())
        .map(|c| c.as_str())
        .collect();
    if !missing.is_empty() {
        errors.push(format!("Required columns missing: {}", missing.join(", ")));
    }

    // Only check fields of columns that exist; their absence is already
    // reported above.
    for column in required_columns {
        if let Some(index) = table.column_index(column) {
            let empty = table
                .rows
                .iter()
                .enumerate()
                .find(|(_, row)| row.get(index).map(|c| c.trim().is_empty()).unwrap_or(true));
            if let Some((row, _)) = empty {
                errors.push(format!("Empty critical field: {} (row {})", column, row + 1));
            }
        }
    }

    if let Some(key_index) = required_columns
        .first()
        .and_then(|c| table.column_index(c))
    {
        let mut seen = std::collections::HashSet::new();
        let duplicated = table
            .rows
            .iter()
            .filter_map(|row| row.get(key_index))
            .any(|key| !seen.insert(key.trim().to_string()));
        if duplicated {
            errors.push("Duplicate rows detected".to_string());
        }
    }

    if errors.is_empty() {
        Ok("Validation passed".to_string())
    } else {
        Err(StageError::Validation {
            message: errors.join("; "),
        })
    }
}

/// Apply the operator-selected transform mode
///
/// Returns a log line describing what happened. `Transform` and `Custom`
/// never fail; `Append` and `Delete` reject malformed plan payloads.
pub fn transform(table: &mut Table, upload: &Upload) -> StageResult<String> {
    match upload.process_mode {
        ProcessMode::Transform => {
            table.coerce_numeric_cells();
            Ok("Transformed dataset (trim + numeric coercion)".to_string())
        }
        ProcessMode::Append => apply_append(table, &upload.process_config),
        ProcessMode::Delete => apply_delete(table, &upload.process_config),
        ProcessMode::Custom => {
            let notes = upload
                .process_config
                .get("notes")
                .and_then(Value::as_str)
                .unwrap_or("(no notes provided)");
            Ok(format!("Custom mode, no automatic mutation. Notes: {notes}"))
        }
    }
}

/// Append plan: `{"records": [{...}, ...]}`, column union with existing
fn apply_append(table: &mut Table, config: &Value) -> StageResult<String> {
    let records = config
        .get("records")
        .and_then(Value::as_array)
        .ok_or_else(|| StageError::InvalidPlan {
            message: "process_config.records must be an array of objects".to_string(),
        })?;

    let mut appended = 0;
    for record in records {
        let object = record.as_object().ok_or_else(|| StageError::InvalidPlan {
            message: "process_config.records must be an array of objects".to_string(),
        })?;

        for key in object.keys() {
            let label = super::table::normalize_column_label(key);
            if table.column_index(&label).is_none() {
                table.add_column(label);
            }
        }

        let row = table
            .columns
            .iter()
            .map(|column| {
                object
                    .iter()
                    .find(|(key, _)| super::table::normalize_column_label(key) == *column)
                    .map(|(_, value)| json_cell(value))
                    .unwrap_or_default()
            })
            .collect();
        table.rows.push(row);
        appended += 1;
    }

    Ok(format!("Appended {appended} record(s)"))
}

/// Delete plan: `{column, value}` or `{"rules": [{column, value}, ...]}`
///
/// A row is dropped when every rule matches by exact string equality
/// after trimming.
fn apply_delete(table: &mut Table, config: &Value) -> StageResult<String> {
    let rules: Vec<(String, String)> = if let Some(rules) = config.get("rules") {
        let rules = rules.as_array().ok_or_else(|| StageError::InvalidPlan {
            message: "process_config.rules must be an array".to_string(),
        })?;
        rules
            .iter()
            .map(parse_delete_rule)
            .collect::<StageResult<_>>()?
    } else {
        vec![parse_delete_rule(config)?]
    };

    if rules.is_empty() {
        return Err(StageError::InvalidPlan {
            message: "delete plan contains no rules".to_string(),
        });
    }

    let mut indexed = Vec::with_capacity(rules.len());
    for (column, value) in &rules {
        let index = table
            .column_index(column)
            .ok_or_else(|| StageError::InvalidPlan {
                message: format!("Unknown column '{column}' in delete plan"),
            })?;
        indexed.push((index, value.trim().to_string()));
    }

    let before = table.row_count();
    table.rows.retain(|row| {
        !indexed.iter().all(|(index, value)| {
            row.get(*index).map(|c| c.trim() == value).unwrap_or(false)
        })
    });
    let deleted = before - table.row_count();

    Ok(format!("Deleted {deleted} row(s) matching {} rule(s)", indexed.len()))
}

fn parse_delete_rule(value: &Value) -> StageResult<(String, String)> {
    let column = value
        .get("column")
        .and_then(Value::as_str)
        .ok_or_else(|| StageError::InvalidPlan {
            message: "delete rule is missing 'column'".to_string(),
        })?;
    let target = value.get("value").ok_or_else(|| StageError::InvalidPlan {
        message: "delete rule is missing 'value'".to_string(),
    })?;
    Ok((
        super::table::normalize_column_label(column),
        json_cell(target),
    ))
}

/// Render a JSON value into a cell
fn json_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n
            .as_f64()
            .map(format_numeric)
            .unwrap_or_else(|| n.to_string()),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Summary metadata produced by the summarize stage
#[derive(Debug, Clone)]
pub struct Summary {
    pub row_count: usize,
    pub col_count: usize,
    pub columns: Vec<String>,
    pub numeric_columns: Vec<String>,
    pub stats: BTreeMap<String, NumericStats>,
    /// The canonical (field, value) summary table used by publish
    pub summary_rows: Vec<(String, String)>,
}

/// Build the summary metadata for an upload's transformed table
pub fn summarize(table: &Table, upload: &Upload) -> Summary {
    let numeric_columns = table.numeric_columns();

    let mut summary_rows = vec![
        ("upload_id".to_string(), upload.id.to_string()),
        ("department".to_string(), upload.department.clone()),
        ("filename".to_string(), upload.filename.clone()),
        ("row_count".to_string(), table.row_count().to_string()),
        ("col_count".to_string(), table.col_count().to_string()),
        ("columns".to_string(), table.columns.join(", ")),
    ];

    let mut stats = BTreeMap::new();
    for column in &numeric_columns {
        if let Some(column_stats) = table.column_stats(column) {
            summary_rows.push((format!("{column}.count"), column_stats.count.to_string()));
            summary_rows.push((format!("{column}.mean"), format_numeric(column_stats.mean)));
            summary_rows.push((format!("{column}.std"), format_numeric(column_stats.std)));
            summary_rows.push((format!("{column}.min"), format_numeric(column_stats.min)));
            summary_rows.push((format!("{column}.max"), format_numeric(column_stats.max)));
            stats.insert(column.clone(), column_stats);
        }
    }

    Summary {
        row_count: table.row_count(),
        col_count: table.col_count(),
        columns: table.columns.clone(),
        numeric_columns,
        stats,
        summary_rows,
    }
}

impl Summary {
    /// Summary metadata as the upload's report_meta payload
    pub fn to_meta(&self) -> Value {
        serde_json::json!({
            "row_count": self.row_count,
            "col_count": self.col_count,
            "columns": self.columns,
            "numeric_columns": self.numeric_columns,
            "stats": self.stats,
        })
    }
}
