//! Read source spreadsheets and delimited files into rows
//!
//! Workbooks (`.xlsx`, `.xlsm`) are read with calamine, delimited text
//! (`.csv`, `.tsv`, `.txt`) with the csv crate. Headers are canonicalised,
//! blank cells become null, entirely blank rows are dropped and declared
//! columns are forward-filled ("blank means same as above").

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use calamine::{Data, Reader, Xlsx, open_workbook};
use chrono::{NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::transfer::types::{Row, Value};

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Reading options taken from the mapping
#[derive(Debug, Clone, Default)]
pub struct SourceOptions {
    /// Worksheet name; the first sheet when absent
    pub sheet: Option<String>,
    /// Field delimiter for text files
    pub delimiter: Option<char>,
    /// Canonical columns to forward-fill
    pub forward_fill: Vec<String>,
}

/// A source file after reading
#[derive(Debug, Clone, Default)]
pub struct SourceTable {
    /// Canonical column names, in source order
    pub headers: Vec<String>,
    /// Header cells exactly as they appear in the file
    pub original_headers: Vec<String>,
    pub rows: Vec<Row>,
}

enum SourceFormat {
    Workbook,
    Delimited(u8),
}

/// Canonical column name: trimmed, lowercase, inner whitespace as `_`
pub fn canonical_header(name: &str) -> String {
    WHITESPACE
        .replace_all(name.trim(), "_")
        .to_lowercase()
}

fn detect_format(path: &Path, delimiter: Option<char>) -> Result<SourceFormat> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    let fallback = match extension.as_str() {
        "xlsx" | "xlsm" => return Ok(SourceFormat::Workbook),
        "csv" | "txt" => b',',
        "tsv" | "tab" => b'\t',
        other => bail!(
            "Unsupported source file type '{}': {} (expected .xlsx, .xlsm, .csv, .tsv or .txt)",
            other,
            path.display()
        ),
    };

    match delimiter {
        Some(d) if d.is_ascii() => Ok(SourceFormat::Delimited(d as u8)),
        Some(d) => bail!("Delimiter '{}' is not a single-byte character", d),
        None => Ok(SourceFormat::Delimited(fallback)),
    }
}

/// Canonical headers of a source file
pub fn read_headers(path: &Path, options: &SourceOptions) -> Result<Vec<String>> {
    let grid = read_grid(path, options)?;
    Ok(canonical_headers(
        grid.first().map(|(_, cells)| cells.as_slice()).unwrap_or_default(),
    ))
}

/// Read a whole source file
pub fn read_source(path: &Path, options: &SourceOptions) -> Result<SourceTable> {
    let mut grid = read_grid(path, options)?.into_iter();

    let Some((_, header_cells)) = grid.next() else {
        log::info!("{} is empty", path.display());
        return Ok(SourceTable::default());
    };

    let original_headers: Vec<String> = header_cells.iter().map(|c| c.to_string()).collect();
    let headers = canonical_headers(&header_cells);

    for column in &options.forward_fill {
        if !headers.contains(column) {
            log::warn!("Forward-fill column '{}' is not in {}", column, path.display());
        }
    }

    let mut rows = Vec::new();
    let mut last_seen: HashMap<&str, Value> = HashMap::new();
    let mut dropped = 0usize;

    for (line, mut cells) in grid {
        cells.resize(headers.len(), Value::Null);
        if cells.iter().all(Value::is_null) {
            dropped += 1;
            continue;
        }

        let mut values: HashMap<String, Value> = headers
            .iter()
            .cloned()
            .zip(cells.iter().cloned())
            .collect();

        for column in &options.forward_fill {
            let Some(current) = values.get_mut(column) else {
                continue;
            };
            if current.is_null() {
                if let Some(previous) = last_seen.get(column.as_str()) {
                    *current = previous.clone();
                }
            } else {
                last_seen.insert(column.as_str(), current.clone());
            }
        }

        rows.push(Row {
            line,
            raw: cells,
            values,
        });
    }

    log::info!(
        "Read {} rows from {} ({} blank rows dropped)",
        rows.len(),
        path.display(),
        dropped
    );

    Ok(SourceTable {
        headers,
        original_headers,
        rows,
    })
}

fn canonical_headers(cells: &[Value]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    cells
        .iter()
        .enumerate()
        .map(|(i, cell)| {
            let mut name = canonical_header(&cell.to_string());
            if name.is_empty() {
                name = format!("column_{}", i + 1);
            }
            let count = seen.entry(name.clone()).or_insert(0);
            *count += 1;
            if *count > 1 {
                format!("{}_{}", name, count)
            } else {
                name
            }
        })
        .collect()
}

/// Every row of the file with its 1-based line number
fn read_grid(path: &Path, options: &SourceOptions) -> Result<Vec<(usize, Vec<Value>)>> {
    match detect_format(path, options.delimiter)? {
        SourceFormat::Workbook => read_workbook(path, options.sheet.as_deref()),
        SourceFormat::Delimited(delimiter) => read_delimited(path, delimiter),
    }
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<Vec<(usize, Vec<Value>)>> {
    let mut workbook: Xlsx<_> = open_workbook(path)
        .with_context(|| format!("Failed to open Excel file: {}", path.display()))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .context("Excel file has no sheets")?
            .clone(),
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .with_context(|| format!("Failed to read sheet: {}", sheet_name))?;

    let first_line = range.start().map_or(1, |(row, _)| row as usize + 1);
    let grid = range
        .rows()
        .enumerate()
        .map(|(i, row)| (first_line + i, row.iter().map(cell_to_value).collect()))
        .collect();
    Ok(grid)
}

fn read_delimited(path: &Path, delimiter: u8) -> Result<Vec<(usize, Vec<Value>)>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(delimiter)
        .from_path(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let mut grid = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| {
            format!("Failed to parse record {} of {}", index + 1, path.display())
        })?;
        let line = record
            .position()
            .map_or(index + 1, |p| p.line() as usize);
        grid.push((line, record.iter().map(text_to_value).collect()));
    }
    Ok(grid)
}

fn text_to_value(text: &str) -> Value {
    if text.trim().is_empty() {
        Value::Null
    } else {
        Value::String(text.to_string())
    }
}

/// Convert Excel cell to a source value
fn cell_to_value(cell: &Data) -> Value {
    match cell {
        Data::Empty => Value::Null,
        Data::String(s) => text_to_value(s),
        Data::Int(i) => Value::Int(*i),
        Data::Float(f) => Value::Float(*f),
        Data::Bool(b) => Value::Bool(*b),
        Data::DateTime(dt) => match dt.as_datetime() {
            Some(datetime) => Value::DateTime(datetime),
            None => Value::Float(dt.as_f64()),
        },
        Data::DateTimeIso(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
            .map(Value::DateTime)
            .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d").map(Value::Date))
            .unwrap_or_else(|_| Value::String(s.clone())),
        Data::DurationIso(s) => Value::String(s.clone()),
        Data::Error(e) => {
            log::debug!("Cell error {:?} read as blank", e);
            Value::Null
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;
    use tempfile::TempDir;

    fn write_csv(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_canonical_header() {
        assert_eq!(canonical_header("  Bill   Number "), "bill_number");
        assert_eq!(canonical_header("Vendor\tCode"), "vendor_code");
        assert_eq!(canonical_header("QTY"), "qty");
    }

    #[test]
    fn test_duplicate_and_blank_headers() {
        let cells = vec![
            Value::String("Name".into()),
            Value::Null,
            Value::String("name".into()),
        ];
        assert_eq!(canonical_headers(&cells), vec!["name", "column_2", "name_2"]);
    }

    #[test]
    fn test_read_csv_with_forward_fill() {
        let dir = TempDir::new().unwrap();
        let path = write_csv(
            &dir,
            "bills.csv",
            "Bill Number,Vendor Code,Product,Qty\nINV-42,C001,P1,1\n,,P2,2\n,,,\nINV-43,C002,P3,4\n",
        );
        let options = SourceOptions {
            forward_fill: vec!["bill_number".into(), "vendor_code".into()],
            ..Default::default()
        };

        let table = read_source(&path, &options).unwrap();

        assert_eq!(table.headers, vec!["bill_number", "vendor_code", "product", "qty"]);
        assert_eq!(table.original_headers[0], "Bill Number");
        assert_eq!(table.rows.len(), 3);

        let second = &table.rows[1];
        assert_eq!(second.line, 3);
        assert_eq!(second.get("bill_number"), &Value::String("INV-42".into()));
        assert_eq!(second.get("vendor_code"), &Value::String("C001".into()));
        // Raw cells keep the blanks for the failed-rows report
        assert_eq!(second.raw[0], Value::Null);

        assert_eq!(table.rows[2].line, 5);
    }

    #[test]
    fn test_header_only_and_empty_files() {
        let dir = TempDir::new().unwrap();
        let header_only = write_csv(&dir, "h.csv", "a,b\n");
        let empty = write_csv(&dir, "e.csv", "");

        assert!(read_source(&header_only, &SourceOptions::default()).unwrap().rows.is_empty());
        assert!(read_source(&empty, &SourceOptions::default()).unwrap().rows.is_empty());
    }

    #[test]
    fn test_tsv_and_unknown_extension() {
        let dir = TempDir::new().unwrap();
        let tsv = write_csv(&dir, "data.tsv", "code\tname\n7\tSeven\n");
        let headers = read_headers(&tsv, &SourceOptions::default()).unwrap();
        assert_eq!(headers, vec!["code", "name"]);

        let pdf = write_csv(&dir, "data.pdf", "");
        assert!(read_source(&pdf, &SourceOptions::default()).is_err());
    }

    #[test]
    fn test_read_workbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("products.xlsx");

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        sheet.write_string(0, 0, "Default Code").unwrap();
        sheet.write_string(0, 1, "Name").unwrap();
        sheet.write_number(1, 0, 12345.0).unwrap();
        sheet.write_string(1, 1, "Widget").unwrap();
        sheet.write_string(2, 1, "").unwrap();
        workbook.save(&path).unwrap();

        let table = read_source(&path, &SourceOptions::default()).unwrap();
        assert_eq!(table.headers, vec!["default_code", "name"]);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].line, 2);
        assert_eq!(table.rows[0].get("default_code"), &Value::Float(12345.0));
    }
}
