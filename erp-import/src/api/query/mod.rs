//! Search domains
//!
//! A domain is the ERP's filter language: a list of `(field, operator,
//! value)` leaves, implicitly AND-ed.

use super::xmlrpc::RpcValue;

/// Comparison operators used by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    In,
    /// Case-insensitive equality
    EqILike,
    /// Case-insensitive substring
    ILike,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::In => "in",
            Operator::EqILike => "=ilike",
            Operator::ILike => "ilike",
        }
    }
}

/// A single domain leaf
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: RpcValue,
}

/// AND-ed list of filters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Domain {
    filters: Vec<Filter>,
}

impl Domain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(
        mut self,
        field: impl Into<String>,
        operator: Operator,
        value: impl Into<RpcValue>,
    ) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<RpcValue>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    pub fn is_in(self, field: impl Into<String>, values: impl Into<RpcValue>) -> Self {
        self.filter(field, Operator::In, values)
    }

    /// Wire representation: a list of triples
    pub fn to_rpc(&self) -> RpcValue {
        RpcValue::Array(
            self.filters
                .iter()
                .map(|f| RpcValue::leaf(&f.field, f.operator.as_str(), f.value.clone()))
                .collect(),
        )
    }
}
