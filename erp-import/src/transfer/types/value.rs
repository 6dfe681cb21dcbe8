//! Cell and field value representation for imports

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::api::xmlrpc::RpcValue;

/// A value read from a source file or produced by coercion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Null/empty value
    #[default]
    Null,
    /// Text value
    String(String),
    /// Whole number
    Int(i64),
    /// Floating point (decimal, money, float)
    Float(f64),
    Bool(bool),
    /// Calendar date
    Date(NaiveDate),
    /// Local date and time, as stored by spreadsheet date cells
    DateTime(NaiveDateTime),
}

impl Value {
    /// Check if this value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire form for remote writes and searches. Dates travel as ISO text.
    pub fn to_rpc(&self) -> RpcValue {
        match self {
            Value::Null => RpcValue::Nil,
            Value::String(s) => RpcValue::String(s.clone()),
            Value::Int(i) => RpcValue::Int(*i),
            Value::Float(f) => RpcValue::Double(*f),
            Value::Bool(b) => RpcValue::Bool(*b),
            Value::Date(d) => RpcValue::String(d.format("%Y-%m-%d").to_string()),
            Value::DateTime(dt) => RpcValue::String(dt.format("%Y-%m-%d %H:%M:%S").to_string()),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, ""),
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}
