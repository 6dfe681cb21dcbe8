//! XML-RPC value model

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

/// A record as exchanged with the object endpoint (field name -> value)
pub type Record = BTreeMap<String, RpcValue>;

/// A value on the XML-RPC wire
#[derive(Debug, Clone, PartialEq)]
pub enum RpcValue {
    /// Explicit null (`<nil/>`)
    Nil,
    Bool(bool),
    Int(i64),
    Double(f64),
    String(String),
    DateTime(NaiveDateTime),
    /// Base64 payload, kept encoded
    Base64(String),
    Array(Vec<RpcValue>),
    Struct(Record),
}

impl RpcValue {
    /// Build a `(field, operator, value)` search domain leaf
    pub fn leaf(field: &str, operator: &str, value: impl Into<RpcValue>) -> Self {
        RpcValue::Array(vec![
            RpcValue::from(field),
            RpcValue::from(operator),
            value.into(),
        ])
    }

    /// The ERP answers `false` for empty relational and scalar fields
    pub fn is_empty_value(&self) -> bool {
        match self {
            RpcValue::Nil | RpcValue::Bool(false) => true,
            RpcValue::String(s) => s.trim().is_empty(),
            RpcValue::Array(items) => items.is_empty(),
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RpcValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RpcValue::Int(i) => Some(*i as f64),
            RpcValue::Double(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RpcValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[RpcValue]> {
        match self {
            RpcValue::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&Record> {
        match self {
            RpcValue::Struct(map) => Some(map),
            _ => None,
        }
    }

    /// Look up a struct member
    pub fn get(&self, key: &str) -> Option<&RpcValue> {
        self.as_struct().and_then(|m| m.get(key))
    }

    /// Identifier of a many-to-one value.
    ///
    /// `read` returns `[id, "display name"]` for relations while writes use
    /// the bare integer; both shapes are accepted.
    pub fn relation_id(&self) -> Option<i64> {
        match self {
            RpcValue::Int(i) => Some(*i),
            RpcValue::Array(items) => items.first().and_then(RpcValue::as_i64),
            _ => None,
        }
    }

    /// Integer members of an array (ids returned by `search` or x2many reads)
    pub fn ids(&self) -> Vec<i64> {
        self.as_array()
            .map(|items| items.iter().filter_map(RpcValue::as_i64).collect())
            .unwrap_or_default()
    }

    /// Array of structs, as returned by `read` and `search_read`
    pub fn records(&self) -> Vec<Record> {
        self.as_array()
            .map(|items| items.iter().filter_map(|v| v.as_struct().cloned()).collect())
            .unwrap_or_default()
    }
}

impl From<bool> for RpcValue {
    fn from(b: bool) -> Self {
        RpcValue::Bool(b)
    }
}

impl From<i64> for RpcValue {
    fn from(i: i64) -> Self {
        RpcValue::Int(i)
    }
}

impl From<i32> for RpcValue {
    fn from(i: i32) -> Self {
        RpcValue::Int(i as i64)
    }
}

impl From<usize> for RpcValue {
    fn from(i: usize) -> Self {
        RpcValue::Int(i as i64)
    }
}

impl From<f64> for RpcValue {
    fn from(f: f64) -> Self {
        RpcValue::Double(f)
    }
}

impl From<&str> for RpcValue {
    fn from(s: &str) -> Self {
        RpcValue::String(s.to_string())
    }
}

impl From<String> for RpcValue {
    fn from(s: String) -> Self {
        RpcValue::String(s)
    }
}

impl From<Vec<RpcValue>> for RpcValue {
    fn from(items: Vec<RpcValue>) -> Self {
        RpcValue::Array(items)
    }
}

impl From<Vec<i64>> for RpcValue {
    fn from(ids: Vec<i64>) -> Self {
        RpcValue::Array(ids.into_iter().map(RpcValue::Int).collect())
    }
}

impl From<Vec<String>> for RpcValue {
    fn from(items: Vec<String>) -> Self {
        RpcValue::Array(items.into_iter().map(RpcValue::String).collect())
    }
}

impl From<Record> for RpcValue {
    fn from(map: Record) -> Self {
        RpcValue::Struct(map)
    }
}

impl fmt::Display for RpcValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcValue::Nil => write!(f, "null"),
            RpcValue::Bool(b) => write!(f, "{}", b),
            RpcValue::Int(i) => write!(f, "{}", i),
            RpcValue::Double(d) => write!(f, "{}", d),
            RpcValue::String(s) => write!(f, "{:?}", s),
            RpcValue::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            RpcValue::Base64(b) => write!(f, "<base64 {} bytes>", b.len()),
            RpcValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            RpcValue::Struct(map) => {
                write!(f, "{{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}
