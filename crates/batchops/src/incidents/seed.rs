//! Default known-error library
//!
//! Seeded idempotently at startup, keyed on pattern, so incidents can be
//! auto-tagged from the first run onward. Operator edits to an existing
//! rule are never overwritten.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::errors::RepositoryResult;
use crate::models::{KnownErrorCreate, Severity};
use crate::repositories::KnownErrorRepo;

fn library() -> Vec<KnownErrorCreate> {
    let rule = |name: &str,
                pattern: &str,
                severity: Severity,
                category: &str,
                root_cause: &str,
                corrective_action: &str| KnownErrorCreate {
        name: name.to_string(),
        pattern: pattern.to_string(),
        severity,
        category: category.to_string(),
        corrective_action: Some(corrective_action.to_string()),
        root_cause: Some(root_cause.to_string()),
        resolution_report: None,
        auto_retry: false,
        max_auto_retries: 0,
    };

    let mut rules = vec![
        rule(
            "No columns detected",
            "No columns detected",
            Severity::High,
            "ingest",
            "The uploaded file has no header row or could not be parsed into columns.",
            "Ensure the first row contains column names and re-export the file as a well-formed CSV or Excel file.",
        ),
        rule(
            "No rows detected",
            "No rows detected",
            Severity::Medium,
            "ingest",
            "The uploaded file is empty or only contains a header row.",
            "Verify the source system is exporting data and re-upload a file with at least one data row.",
        ),
        rule(
            "Required columns missing",
            "Required columns missing",
            Severity::High,
            "schema",
            "The file schema does not match the expected template for this department.",
            "Update the export to include all required columns (e.g. student_id, score) and re-upload.",
        ),
        rule(
            "Unsupported file type",
            "Unsupported file type",
            Severity::Low,
            "ingest",
            "The file extension is not supported by the pipeline loader.",
            "Convert the file to CSV, XLSX/XLS or a tabular PDF and try again.",
        ),
        rule(
            "No table found in PDF",
            "No table found in first PDF page",
            Severity::Medium,
            "ingest",
            "The PDF does not contain an extractable table on the first page.",
            "Export the results as a table-based PDF or use CSV/Excel instead.",
        ),
        rule(
            "File not found",
            "File not found",
            Severity::Critical,
            "storage",
            "The on-disk file path for this upload is missing or has been moved.",
            "Re-upload the original file so the pipeline can access it again.",
        ),
        rule(
            "Encoding mismatch",
            "(invalid utf-8|stream did not contain valid UTF-8)",
            Severity::High,
            "ingest",
            "The file encoding differs from UTF-8.",
            "Re-export the source file as UTF-8 and upload it again.",
        ),
        rule(
            "Empty critical field",
            "Empty critical field",
            Severity::Medium,
            "validation",
            "One or more required fields contain no value.",
            "Fill in the highlighted fields in the source file and re-upload.",
        ),
        rule(
            "Duplicate student rows",
            "Duplicate rows detected",
            Severity::Medium,
            "validation",
            "The upload contains duplicate student IDs.",
            "Deduplicate records in the source file and upload again.",
        ),
        rule(
            "Stage timeout",
            "Stage timed out",
            Severity::Medium,
            "runtime",
            "A pipeline stage exceeded its soft timeout.",
            "Check storage and file size; the engine retries if configured to.",
        ),
    ];

    // The only rule with automatic remediation out of the box: brief
    // storage locks clear on their own, so the engine retries twice.
    rules.push(KnownErrorCreate {
        name: "Temporary storage lock".to_string(),
        pattern: "(Resource temporarily unavailable|share violation|database is locked)"
            .to_string(),
        severity: Severity::Medium,
        category: "infrastructure".to_string(),
        corrective_action: Some(
            "No manual action required unless the issue persists. The engine retries automatically."
                .to_string(),
        ),
        root_cause: Some(
            "The storage layer briefly locked the file when the pipeline tried to read it."
                .to_string(),
        ),
        resolution_report: Some("Storage lock cleared after retry.".to_string()),
        auto_retry: true,
        max_auto_retries: 2,
    });

    rules
}

/// Seed the default rules; safe to call on every startup
pub async fn ensure_default_known_errors(
    repo: &Arc<dyn KnownErrorRepo>,
    now: DateTime<Utc>,
) -> RepositoryResult<usize> {
    let rules = library();
    let count = rules.len();
    for rule in rules {
        repo.get_or_create(rule, now).await?;
    }
    Ok(count)
}
