//! Source file loading for the standardize stage
//!
//! Dispatches on file extension: CSV, Excel (xlsx/xls), or a tabular PDF.
//! Reads retry transient I/O locally; parse failures surface as permanent
//! stage errors.

use std::io::ErrorKind;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use tracing::debug;

use super::table::{format_numeric, Table};
use crate::errors::{StageError, StageResult};
use crate::utils::retry::{with_retry, RetryConfig};

/// Extensions the pipeline accepts
pub const SUPPORTED_EXTENSIONS: [&str; 4] = ["csv", "xlsx", "xls", "pdf"];

/// Load an upload's source file into the tabular form
pub async fn load_table(path: &str) -> StageResult<Table> {
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "csv" => {
            let bytes = read_bytes(path).await?;
            parse_csv(&bytes)
        }
        "xlsx" | "xls" => {
            // Touch the file first so a missing path is reported the same
            // way for every format.
            read_bytes(path).await?;
            parse_workbook(path)
        }
        "pdf" => {
            let bytes = read_bytes(path).await?;
            parse_pdf(&bytes)
        }
        other => Err(StageError::UnsupportedFormat {
            extension: if other.is_empty() {
                "<none>".to_string()
            } else {
                format!(".{other}")
            },
        }),
    }
}

/// Read the file with bounded retry on transient errors
async fn read_bytes(path: &str) -> StageResult<Vec<u8>> {
    with_retry(
        &RetryConfig::for_stage_io(),
        || async move {
            tokio::fs::read(path).await.map_err(|e| classify_io(path, e))
        },
        StageError::is_transient,
        "read_upload_file",
    )
    .await
}

fn classify_io(path: &str, error: std::io::Error) -> StageError {
    match error.kind() {
        ErrorKind::NotFound => StageError::FileNotFound {
            path: path.to_string(),
        },
        _ => StageError::TransientIo {
            message: format!("{path}: {error}"),
        },
    }
}

fn parse_csv(bytes: &[u8]) -> StageResult<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let columns: Vec<String> = reader
        .headers()
        .map_err(csv_error)?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_error)?;
        rows.push(record.iter().map(str::to_string).collect());
    }

    debug!("Parsed CSV: {} columns, {} rows", columns.len(), rows.len());
    Ok(Table::new(columns, rows))
}

fn csv_error(error: csv::Error) -> StageError {
    if matches!(error.kind(), csv::ErrorKind::Utf8 { .. }) {
        StageError::Parse {
            message: format!("invalid utf-8 in source file: {error}"),
        }
    } else {
        StageError::Parse {
            message: error.to_string(),
        }
    }
}

fn parse_workbook(path: &str) -> StageResult<Table> {
    let mut workbook = open_workbook_auto(path).map_err(|e| StageError::Parse {
        message: format!("could not open workbook: {e}"),
    })?;

    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| StageError::Parse {
            message: "workbook has no sheets".to_string(),
        })?
        .map_err(|e| StageError::Parse {
            message: format!("could not read first sheet: {e}"),
        })?;

    let mut iter = range.rows();
    let columns: Vec<String> = iter
        .next()
        .map(|row| row.iter().map(cell_to_string).collect())
        .unwrap_or_default();
    let rows: Vec<Vec<String>> = iter
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect();

    debug!(
        "Parsed workbook: {} columns, {} rows",
        columns.len(),
        rows.len()
    );
    Ok(Table::new(columns, rows))
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.trim().to_string(),
        Data::Float(f) => format_numeric(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// Extract a whitespace-aligned table from the first PDF page
///
/// The first non-empty text line is the header; following lines with the
/// same token count are rows. Anything else on the page is ignored.
fn parse_pdf(bytes: &[u8]) -> StageResult<Table> {
    let document = lopdf::Document::load_mem(bytes).map_err(|e| StageError::Parse {
        message: format!("could not parse PDF: {e}"),
    })?;

    if document.get_pages().is_empty() {
        return Err(StageError::NoPdfTable);
    }

    let text = document
        .extract_text(&[1])
        .map_err(|e| StageError::Parse {
            message: format!("could not extract PDF text: {e}"),
        })?;

    // Single-token lines are titles or page furniture; the header is the
    // first line that actually looks like a column row.
    let mut lines = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .skip_while(|l| l.split_whitespace().count() < 2);
    let Some(header_line) = lines.next() else {
        return Err(StageError::NoPdfTable);
    };
    let columns: Vec<String> = header_line.split_whitespace().map(str::to_string).collect();

    let rows: Vec<Vec<String>> = lines
        .map(|line| {
            line.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|tokens| tokens.len() == columns.len())
        .collect();

    debug!(
        "Extracted PDF table: {} columns, {} rows",
        columns.len(),
        rows.len()
    );
    Ok(Table::new(columns, rows))
}
