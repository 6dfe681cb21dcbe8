//! Source rows and document groups

use std::collections::HashMap;

use super::value::Value;

/// One source record after header normalisation
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// 1-based line in the source file (the header is line 1)
    pub line: usize,
    /// Cells in source column order, exactly as read (before forward-fill)
    pub raw: Vec<Value>,
    /// Cells keyed by canonical column name, forward-fill applied
    pub values: HashMap<String, Value>,
}

impl Row {
    /// Value of a canonical column, null when absent
    pub fn get(&self, column: &str) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(column).unwrap_or(&NULL)
    }
}

/// Contiguous rows forming one document
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    /// 0-based position in the job, used for checkpoints
    pub index: usize,
    /// Grouping-key values as displayed in logs
    pub key: Vec<String>,
    pub rows: Vec<Row>,
}

impl Group {
    /// First row; carries the header fields
    pub fn head(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn first_line(&self) -> usize {
        self.rows.first().map_or(0, |r| r.line)
    }

    pub fn label(&self) -> String {
        if self.key.is_empty() {
            format!("line {}", self.first_line())
        } else {
            self.key.join(" / ")
        }
    }
}
