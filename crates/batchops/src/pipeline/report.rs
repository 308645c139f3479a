//! Published report rendering: CSV text and a tabular PDF
//!
//! The PDF is a plain monospaced table, one text line per row, paginated.
//! Layout fidelity is not the point; the artifact must be durable,
//! self-describing and machine-extractable.

use lopdf::{dictionary, Document, Object, Stream};

use crate::errors::{StageError, StageResult};

const PAGE_WIDTH: i32 = 612;
const PAGE_HEIGHT: i32 = 792;
const MARGIN_TOP: i32 = 760;
const LINE_HEIGHT: i32 = 14;
const ROWS_PER_PAGE: usize = 48;
const MAX_LINE_CHARS: usize = 110;

/// Render a table as CSV text
pub fn render_csv(columns: &[String], rows: &[Vec<String>]) -> StageResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(columns).map_err(write_error)?;
    for row in rows {
        writer.write_record(row).map_err(write_error)?;
    }
    let bytes = writer.into_inner().map_err(|e| StageError::Internal {
        message: format!("CSV buffer flush failed: {e}"),
    })?;
    String::from_utf8(bytes).map_err(|e| StageError::Internal {
        message: format!("CSV buffer was not UTF-8: {e}"),
    })
}

fn write_error(error: csv::Error) -> StageError {
    StageError::Internal {
        message: format!("CSV write failed: {error}"),
    }
}

/// Render a table as a paginated PDF document
pub fn build_pdf_table(
    title: &str,
    columns: &[String],
    rows: &[Vec<String>],
) -> StageResult<Vec<u8>> {
    let mut lines = Vec::with_capacity(rows.len() + 2);
    lines.push(title.to_string());
    lines.push(columns.join("  "));
    for row in rows {
        lines.push(row.join("  "));
    }

    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids = Vec::new();
    for chunk in lines.chunks(ROWS_PER_PAGE) {
        let content = page_content(chunk);
        let content_id = doc.add_object(Object::Stream(Stream::new(
            dictionary! {},
            content.into_bytes(),
        )));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let page_count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_count,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).map_err(|e| StageError::Internal {
        message: format!("PDF serialization failed: {e}"),
    })?;
    Ok(bytes)
}

/// One page's content stream: a Td-advanced column of text lines
fn page_content(lines: &[String]) -> String {
    let mut content = format!("BT /F1 10 Tf 40 {MARGIN_TOP} Td ");
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            content.push_str(&format!("0 -{LINE_HEIGHT} Td "));
        }
        content.push_str(&format!("({}) Tj ", escape_pdf_text(line)));
    }
    content.push_str("ET");
    content
}

/// Escape delimiters and clamp the line to the page width
fn escape_pdf_text(line: &str) -> String {
    let clamped: String = line.chars().take(MAX_LINE_CHARS).collect();
    clamped
        .replace('\\', "\\\\")
        .replace('(', "\\(")
        .replace(')', "\\)")
}
