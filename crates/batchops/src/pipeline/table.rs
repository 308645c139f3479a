//! Normalised tabular form flowing between pipeline stages
//!
//! Cells are held as trimmed strings; numeric interpretation happens on
//! demand so mixed columns degrade gracefully instead of failing the run.

use serde::{Deserialize, Serialize};

/// Collapse whitespace, trim, and lower-snake-case a column label
pub fn normalize_column_label(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}

/// Parse a cell as a number; empty cells are absent, not zero
pub fn parse_numeric(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Aggregates over one numeric column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericStats {
    pub count: usize,
    pub mean: f64,
    pub std: f64,
    pub min: f64,
    pub max: f64,
}

/// Column-major-named, row-major-stored table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn col_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Normalise every column label in place
    pub fn normalize_columns(&mut self) {
        for column in &mut self.columns {
            *column = normalize_column_label(column);
        }
    }

    /// Trim every cell and pad short rows to the column count
    pub fn tidy(&mut self) {
        let width = self.columns.len();
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                let trimmed = cell.trim();
                if trimmed.len() != cell.len() {
                    *cell = trimmed.to_string();
                }
            }
            if row.len() < width {
                row.resize(width, String::new());
            }
        }
    }

    /// Columns whose non-empty cells all parse as numbers
    pub fn numeric_columns(&self) -> Vec<String> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(index, _)| {
                let mut any = false;
                for row in &self.rows {
                    let cell = row.get(*index).map(String::as_str).unwrap_or("");
                    if cell.trim().is_empty() {
                        continue;
                    }
                    if parse_numeric(cell).is_none() {
                        return false;
                    }
                    any = true;
                }
                any
            })
            .map(|(_, name)| name.clone())
            .collect()
    }

    /// Stats over a column's parseable cells; `None` when nothing parses
    pub fn column_stats(&self, name: &str) -> Option<NumericStats> {
        let index = self.column_index(name)?;
        let values: Vec<f64> = self
            .rows
            .iter()
            .filter_map(|row| row.get(index))
            .filter_map(|cell| parse_numeric(cell))
            .collect();
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = if count > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64
        } else {
            0.0
        };
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        Some(NumericStats {
            count,
            mean,
            std: variance.sqrt(),
            min,
            max,
        })
    }

    /// Coerce numeric-looking cells into a canonical rendering
    ///
    /// Integral values drop their fraction ("77.0" -> "77"); other values
    /// keep the shortest round-trip form. Non-numeric cells are left as
    /// they are.
    pub fn coerce_numeric_cells(&mut self) {
        for row in &mut self.rows {
            for cell in row.iter_mut() {
                if let Some(value) = parse_numeric(cell) {
                    *cell = format_numeric(value);
                }
            }
        }
    }

    /// Add a column with empty cells for existing rows
    pub fn add_column(&mut self, name: String) {
        self.columns.push(name);
        for row in &mut self.rows {
            row.push(String::new());
        }
    }
}

/// Canonical rendering for numeric cells
pub fn format_numeric(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}
