//! Write the failed-rows workbook

use std::path::Path;

use anyhow::{Context, Result};
use rust_xlsxwriter::{Format, Workbook, Worksheet};

use crate::transfer::types::{FailureKind, Value};

/// Special column names (prefixed with _)
mod special_cols {
    pub const FAILURE_KIND: &str = "_failure_kind";
    pub const FAILURE_MESSAGE: &str = "_failure_message";
}

/// A source row that did not make it, with the reason
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FailedRow {
    pub line: usize,
    /// Source cells exactly as read
    pub raw: Vec<Value>,
    pub kind: FailureKind,
    pub message: String,
}

/// Write failing rows verbatim under the original headers, plus the
/// failure kind and message columns
pub fn write_failed_rows(
    path: &Path,
    original_headers: &[String],
    rows: &[FailedRow],
) -> Result<()> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Failed rows")?;

    let bold = Format::new().set_bold();
    let kind_col = original_headers.len() as u16;

    for (col, name) in original_headers.iter().enumerate() {
        worksheet.write_string_with_format(0, col as u16, name, &bold)?;
    }
    worksheet.write_string_with_format(0, kind_col, special_cols::FAILURE_KIND, &bold)?;
    worksheet.write_string_with_format(0, kind_col + 1, special_cols::FAILURE_MESSAGE, &bold)?;

    for (row_idx, failed) in rows.iter().enumerate() {
        let row = (row_idx + 1) as u32;
        for (col, value) in failed.raw.iter().enumerate().take(original_headers.len()) {
            write_value(worksheet, row, col as u16, value)?;
        }
        worksheet.write_string(row, kind_col, failed.kind.label())?;
        worksheet.write_string(row, kind_col + 1, &failed.message)?;
    }

    worksheet.set_freeze_panes(1, 0)?;
    worksheet.autofit();

    workbook
        .save(path)
        .with_context(|| format!("Failed to save Excel file: {}", path.display()))?;

    Ok(())
}

fn write_value(ws: &mut Worksheet, row: u32, col: u16, value: &Value) -> Result<()> {
    match value {
        Value::Null => { /* Leave cell empty */ }
        Value::String(s) => { ws.write_string(row, col, s)?; }
        Value::Int(i) => { ws.write_number(row, col, *i as f64)?; }
        Value::Float(f) => { ws.write_number(row, col, *f)?; }
        Value::Bool(b) => { ws.write_boolean(row, col, *b)?; }
        Value::Date(_) | Value::DateTime(_) => { ws.write_string(row, col, value.to_string())?; }
    }
    Ok(())
}
