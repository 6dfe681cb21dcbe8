//! Typed conversion of source cells
//!
//! Every mapped column declares a semantic type. Conversion failures are
//! reported per row as [`CoercionError`] and never stop the job.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::transfer::types::{BlankPolicy, FieldSpec, FieldType, Row, Value};

/// Codes typed as numbers by the spreadsheet, e.g. `12345.0`
static ZERO_FRACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(-?\d+)\.0+$").unwrap());
static THOUSANDS_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d{1,3}(,\d{3})+(\.\d+)?$").unwrap());
static THOUSANDS_DOT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d{1,3}(\.\d{3})+(,\d+)?$").unwrap());

const DAY_FIRST: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y"];
const YEAR_FIRST: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

/// A cell that cannot be converted to its declared type
#[derive(Debug, Clone, PartialEq)]
pub struct CoercionError {
    pub column: String,
    pub message: String,
}

impl std::fmt::Display for CoercionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column '{}': {}", self.column, self.message)
    }
}

impl std::error::Error for CoercionError {}

/// Convert the cell of `spec.column` in `row` to the declared type
pub fn coerce_field(spec: &FieldSpec, row: &Row) -> Result<Value, CoercionError> {
    let raw = row.get(&spec.column);
    let kind = if spec.many { FieldType::Text } else { spec.kind };

    let value = coerce_value(kind, spec.blank, raw).map_err(|message| CoercionError {
        column: spec.column.clone(),
        message,
    })?;

    if spec.required && value.is_null() {
        return Err(CoercionError {
            column: spec.column.clone(),
            message: "value is required".to_string(),
        });
    }
    Ok(value)
}

/// Convert a single value; the error is a human message
pub fn coerce_value(kind: FieldType, blank: BlankPolicy, raw: &Value) -> Result<Value, String> {
    match kind {
        FieldType::Text => Ok(to_text(raw)),
        FieldType::Code => Ok(to_code(raw)),
        FieldType::Integer => to_integer(raw),
        FieldType::Decimal => to_decimal(raw, blank),
        FieldType::Date => to_date(raw),
        FieldType::Boolean => to_boolean(raw),
    }
}

/// Trimmed text; blanks and dataframe artefacts (`nan`, `None`) are null
fn clean_text(raw: &Value) -> Option<String> {
    let text = match raw {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    let lowered = text.to_lowercase();
    if text.is_empty() || lowered == "nan" || lowered == "none" {
        None
    } else {
        Some(text)
    }
}

fn to_text(raw: &Value) -> Value {
    clean_text(raw).map_or(Value::Null, Value::String)
}

fn to_code(raw: &Value) -> Value {
    match raw {
        Value::Int(i) => Value::String(i.to_string()),
        Value::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => {
            Value::String(format!("{}", *f as i64))
        }
        other => match clean_text(other) {
            Some(text) => match ZERO_FRACTION.captures(&text) {
                Some(caps) => Value::String(caps[1].to_string()),
                None => Value::String(text),
            },
            None => Value::Null,
        },
    }
}

fn to_integer(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::Int(i) => Ok(Value::Int(*i)),
        Value::Float(f) => float_to_int(*f),
        Value::Bool(_) | Value::Date(_) | Value::DateTime(_) => {
            Err(format!("expected an integer, found '{}'", raw))
        }
        other => {
            let Some(text) = clean_text(other) else {
                return Ok(Value::Null);
            };
            if let Ok(i) = text.parse::<i64>() {
                return Ok(Value::Int(i));
            }
            match parse_decimal(&text) {
                Some(f) => float_to_int(f),
                None => Err(format!("'{}' is not an integer", text)),
            }
        }
    }
}

fn float_to_int(f: f64) -> Result<Value, String> {
    if f.fract() == 0.0 && f.abs() < 9.0e15 {
        Ok(Value::Int(f as i64))
    } else {
        Err(format!("{} has a fractional part", f))
    }
}

fn to_decimal(raw: &Value, blank: BlankPolicy) -> Result<Value, String> {
    let parsed = match raw {
        Value::Int(i) => Some(*i as f64),
        Value::Float(f) => Some(*f),
        Value::Bool(_) | Value::Date(_) | Value::DateTime(_) => {
            return Err(format!("expected a number, found '{}'", raw));
        }
        other => match clean_text(other) {
            Some(text) => {
                Some(parse_decimal(&text).ok_or_else(|| format!("'{}' is not a number", text))?)
            }
            None => None,
        },
    };
    Ok(match (parsed, blank) {
        (Some(f), _) => Value::Float(f),
        (None, BlankPolicy::Zero) => Value::Float(0.0),
        (None, BlankPolicy::Null) => Value::Null,
    })
}

/// Parse a number written with optional thousands separators
/// (`1,234.50`, `1.234,50`, `1 234,5`)
pub fn parse_decimal(text: &str) -> Option<f64> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_' && *c != '\'')
        .collect();

    let normalized = if THOUSANDS_COMMA.is_match(&compact) {
        compact.replace(',', "")
    } else if THOUSANDS_DOT.is_match(&compact) {
        compact.replace('.', "").replace(',', ".")
    } else if compact.contains(',') && !compact.contains('.') {
        compact.replace(',', ".")
    } else {
        compact
    };

    normalized.parse::<f64>().ok().filter(|f| f.is_finite())
}

fn to_date(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::Date(d) => Ok(Value::Date(*d)),
        Value::DateTime(dt) => Ok(Value::Date(dt.date())),
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => {
            Err(format!("expected a date, found '{}'", raw))
        }
        other => match clean_text(other) {
            Some(text) => parse_date(&text).map(Value::Date),
            None => Ok(Value::Null),
        },
    }
}

/// Parse day-first or year-first text. A value that reads as two
/// different calendar dates is rejected.
pub fn parse_date(text: &str) -> Result<NaiveDate, String> {
    // Drop a time portion: "2024-01-15 00:00:00", "2024-01-15T08:30"
    let date_part = text
        .split(|c: char| c == 'T' || c.is_whitespace())
        .next()
        .unwrap_or(text);

    let first = |formats: &[&str]| {
        formats
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(date_part, f).ok())
    };

    match (first(DAY_FIRST), first(YEAR_FIRST)) {
        (Some(day), Some(year)) if day != year => Err(format!(
            "'{}' is ambiguous ({} or {})",
            text, day, year
        )),
        (Some(date), _) | (None, Some(date)) => Ok(date),
        (None, None) => Err(format!(
            "'{}' is not a date (expected DD/MM/YYYY or YYYY-MM-DD)",
            text
        )),
    }
}

fn to_boolean(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::Bool(b) => Ok(Value::Bool(*b)),
        Value::Int(1) => Ok(Value::Bool(true)),
        Value::Int(0) => Ok(Value::Bool(false)),
        Value::Float(f) if *f == 1.0 => Ok(Value::Bool(true)),
        Value::Float(f) if *f == 0.0 => Ok(Value::Bool(false)),
        Value::Null => Ok(Value::Null),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "" => Ok(Value::Null),
            "true" | "yes" | "1" => Ok(Value::Bool(true)),
            "false" | "no" | "0" => Ok(Value::Bool(false)),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        other => Err(format!("'{}' is not a boolean", other)),
    }
}
