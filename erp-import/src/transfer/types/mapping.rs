//! Mapping definitions
//!
//! A mapping describes how one kind of source file becomes remote
//! mutations: the target entity, the header and line schemas, the grouping
//! key, the reference resolution rules and the identity rule. Mappings are
//! loaded from TOML files.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::api::xmlrpc::RpcValue;
use crate::transfer::excel::canonical_header;

/// Semantic type of a source column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Integer,
    Decimal,
    Date,
    Boolean,
    /// Business code; spreadsheet floats like `12345.0` become `12345`
    Code,
}

/// What a blank decimal cell becomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlankPolicy {
    #[default]
    Null,
    Zero,
}

/// One source column written to one remote field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub column: String,
    pub field: String,
    #[serde(rename = "type", default)]
    pub kind: FieldType,
    #[serde(default)]
    pub required: bool,
    /// Name of a rule in `references`; the value is resolved to an id
    #[serde(default)]
    pub reference: Option<String>,
    /// Comma-separated references written as a many-to-many replace
    #[serde(default)]
    pub many: bool,
    /// Non-standard field, written only if the entity exposes it
    #[serde(default)]
    pub probe: bool,
    #[serde(default)]
    pub blank: BlankPolicy,
}

/// How existing lines are reconciled on update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinePolicy {
    /// Delete all lines and recreate them when the set differs
    #[default]
    Replace,
    /// Match lines on an identity field and update, add or delete
    Merge,
}

/// Line schema of a header+lines document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineSpec {
    /// One-to-many field on the target holding the lines
    pub field: String,
    /// Entity of the line records
    pub entity: String,
    #[serde(default)]
    pub policy: LinePolicy,
    /// Remote line field used to pair lines under the merge policy
    #[serde(default)]
    pub identity: Option<String>,
    /// Replace lines on every update even when they already match
    #[serde(default)]
    pub always_replace: bool,
    pub columns: Vec<FieldSpec>,
}

/// Business key deciding create versus update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRule {
    pub column: String,
    pub field: String,
    /// Fields from `defaults` that also constrain the search
    #[serde(default)]
    pub scope: Vec<String>,
}

/// How a lookup attempt compares values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MatchMode {
    #[default]
    #[serde(rename = "=")]
    Exact,
    /// Case-insensitive equality
    #[serde(rename = "=ilike")]
    Insensitive,
    /// Case-insensitive substring
    #[serde(rename = "ilike")]
    Contains,
}

/// One `(entity, field)` lookup step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupAttempt {
    pub field: String,
    #[serde(default)]
    pub operator: MatchMode,
}

/// Minimal payload for creating a missing referenced record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTemplate {
    /// Field receiving the looked-up value itself
    pub value_field: String,
    /// Constant fields
    #[serde(default)]
    pub fields: BTreeMap<String, Constant>,
    /// Remote field to source column, read from the referencing row
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

/// Resolution rule for one kind of foreign reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRule {
    pub entity: String,
    pub attempts: Vec<LookupAttempt>,
    /// Create-if-missing policy; absent means missing is an error
    #[serde(default)]
    pub create: Option<CreateTemplate>,
}

/// Constant value in a mapping file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Constant {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Constant {
    pub fn to_rpc(&self) -> RpcValue {
        match self {
            Constant::Bool(b) => RpcValue::Bool(*b),
            Constant::Int(i) => RpcValue::Int(*i),
            Constant::Float(f) => RpcValue::Double(*f),
            Constant::Text(s) => RpcValue::String(s.clone()),
        }
    }
}

fn default_mutable_states() -> Vec<String> {
    vec!["draft".to_string()]
}

fn default_create_missing() -> bool {
    true
}

/// Declarative description of one import kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    pub name: String,
    /// Target entity
    pub target: String,
    /// Worksheet to read; the first one when absent
    #[serde(default)]
    pub sheet: Option<String>,
    /// Delimiter for text sources; inferred from the extension when absent
    #[serde(default)]
    pub delimiter: Option<char>,
    /// Preferred batch size for this mapping
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Columns whose values form the grouping key; empty means one row per document
    #[serde(default)]
    pub grouping_key: Vec<String>,
    /// Columns where a blank cell repeats the value above
    #[serde(default)]
    pub forward_fill: Vec<String>,
    /// Lifecycle field of the target; absent means always mutable
    #[serde(default)]
    pub state_field: Option<String>,
    #[serde(default = "default_mutable_states")]
    pub mutable_states: Vec<String>,
    /// Create targets that do not exist yet; false for update-only mappings
    #[serde(default = "default_create_missing")]
    pub create_missing: bool,
    /// Action invoked after a create or update, such as `action_post`
    #[serde(default)]
    pub post_action: Option<String>,
    /// Constant header values (currency, journal, document type...)
    #[serde(default)]
    pub defaults: BTreeMap<String, Constant>,
    pub identity: IdentityRule,
    pub header: Vec<FieldSpec>,
    #[serde(default)]
    pub lines: Option<LineSpec>,
    #[serde(default)]
    pub references: BTreeMap<String, ReferenceRule>,
}

impl Mapping {
    /// Load and validate a mapping file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read mapping file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid mapping: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut mapping: Mapping = toml::from_str(content).context("Failed to parse mapping TOML")?;
        mapping.canonicalize();
        mapping.validate()?;
        Ok(mapping)
    }

    /// Rewrite every column name to its canonical form
    fn canonicalize(&mut self) {
        let canon = |c: &mut String| *c = canonical_header(c);
        self.grouping_key.iter_mut().for_each(canon);
        self.forward_fill.iter_mut().for_each(canon);
        canon(&mut self.identity.column);
        for spec in self.all_fields_mut() {
            canon(&mut spec.column);
        }
        for rule in self.references.values_mut() {
            if let Some(template) = rule.create.as_mut() {
                template.columns.values_mut().for_each(canon);
            }
        }
    }

    fn all_fields_mut(&mut self) -> impl Iterator<Item = &mut FieldSpec> {
        let lines = self.lines.iter_mut().flat_map(|l| l.columns.iter_mut());
        self.header.iter_mut().chain(lines)
    }

    /// Header and line field specs
    pub fn all_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        let lines = self.lines.iter().flat_map(|l| l.columns.iter());
        self.header.iter().chain(lines)
    }

    pub fn line_columns(&self) -> &[FieldSpec] {
        self.lines.as_ref().map_or(&[], |l| l.columns.as_slice())
    }

    pub fn reference(&self, name: &str) -> Option<&ReferenceRule> {
        self.references.get(name)
    }

    /// Identity column spec in the header schema
    pub fn identity_spec(&self) -> Option<&FieldSpec> {
        self.header
            .iter()
            .find(|s| s.column == self.identity.column)
    }

    pub fn is_mutable_state(&self, state: &str) -> bool {
        self.mutable_states.iter().any(|s| s == state)
    }

    /// Check cross references between the mapping's sections
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.target.trim().is_empty() {
            problems.push("target entity is empty".to_string());
        }
        if self.header.is_empty() {
            problems.push("header schema is empty".to_string());
        }
        if self.identity_spec().is_none() {
            problems.push(format!(
                "identity column '{}' is not in the header schema",
                self.identity.column
            ));
        }
        for scope in &self.identity.scope {
            if !self.defaults.contains_key(scope) {
                problems.push(format!("identity scope '{}' has no value in [defaults]", scope));
            }
        }
        if self.post_action.is_some() && self.state_field.is_none() {
            problems.push("post_action needs state_field to know when it already ran".to_string());
        }
        for column in &self.grouping_key {
            if !self.header.iter().any(|s| &s.column == column) {
                problems.push(format!("grouping column '{}' is not in the header schema", column));
            }
        }

        for spec in self.all_fields() {
            if let Some(reference) = &spec.reference {
                if !self.references.contains_key(reference) {
                    problems.push(format!(
                        "column '{}' uses unknown reference '{}'",
                        spec.column, reference
                    ));
                }
            } else if spec.many {
                problems.push(format!("column '{}' is 'many' without a reference", spec.column));
            }
            if spec.blank == BlankPolicy::Zero && spec.kind != FieldType::Decimal {
                problems.push(format!(
                    "column '{}': blank = \"zero\" needs type decimal",
                    spec.column
                ));
            }
        }

        for (name, rule) in &self.references {
            if rule.attempts.is_empty() {
                problems.push(format!("reference '{}' has no lookup attempts", name));
            }
        }

        if let Some(lines) = &self.lines {
            if lines.columns.is_empty() {
                problems.push("line schema has no columns".to_string());
            }
            if lines.policy == LinePolicy::Merge {
                match &lines.identity {
                    None => problems.push("merge policy needs lines.identity".to_string()),
                    Some(identity) if !lines.columns.iter().any(|c| &c.field == identity) => {
                        problems.push(format!(
                            "merge identity '{}' is not a field of the line schema",
                            identity
                        ));
                    }
                    Some(_) => {}
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            bail!("{}", problems.join("; "))
        }
    }
}
