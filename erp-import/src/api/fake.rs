//! In-memory ERP used by the engine tests
//!
//! Models just enough of the object API: searchable tables, many-to-one
//! fields read back as `[id, name]`, one-to-many line commands, state
//! actions, field probing and scripted failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::client::ErpApi;
use super::error::RpcError;
use super::xmlrpc::{Record, RpcValue};

type Constraint = Box<dyn Fn(&Record) -> Option<String> + Send>;

#[derive(Default)]
struct State {
    tables: HashMap<String, BTreeMap<i64, Record>>,
    declared_fields: HashMap<String, Vec<String>>,
    many2one: HashMap<(String, String), String>,
    one2many: HashMap<(String, String), (String, String)>,
    many2many: HashSet<(String, String)>,
    constraints: Vec<(String, Constraint)>,
    failures: VecDeque<(Option<String>, RpcError)>,
    calls: Vec<(String, String)>,
    next_id: i64,
    authenticated: bool,
    logins: u32,
    reject_login: bool,
}

/// Shared handle to the fake server; clones see the same data
#[derive(Clone, Default)]
pub struct FakeErp {
    state: Arc<Mutex<State>>,
}

impl FakeErp {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.lock().next_id = 1;
        fake
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Restrict `entity` to these fields: `fields_get` lists only them and
    /// reads naming any other field are rejected
    pub fn declare_fields(&self, entity: &str, fields: &[&str]) -> &Self {
        self.lock().declared_fields.insert(
            entity.to_string(),
            fields.iter().map(|f| f.to_string()).collect(),
        );
        self
    }

    pub fn many2one(&self, entity: &str, field: &str, target: &str) -> &Self {
        self.lock()
            .many2one
            .insert((entity.to_string(), field.to_string()), target.to_string());
        self
    }

    pub fn one2many(&self, entity: &str, field: &str, line_entity: &str, inverse: &str) -> &Self {
        self.lock().one2many.insert(
            (entity.to_string(), field.to_string()),
            (line_entity.to_string(), inverse.to_string()),
        );
        self
    }

    pub fn many2many(&self, entity: &str, field: &str) -> &Self {
        self.lock()
            .many2many
            .insert((entity.to_string(), field.to_string()));
        self
    }

    /// Reject creates and writes on `entity` when the check returns a message
    pub fn constraint(
        &self,
        entity: &str,
        check: impl Fn(&Record) -> Option<String> + Send + 'static,
    ) -> &Self {
        self.lock()
            .constraints
            .push((entity.to_string(), Box::new(check)));
        self
    }

    /// Fail the next call (to `method`, or to anything) with `error`
    pub fn fail_next(&self, method: Option<&str>, error: RpcError) -> &Self {
        self.lock()
            .failures
            .push_back((method.map(str::to_string), error));
        self
    }

    pub fn reject_login(&self) -> &Self {
        self.lock().reject_login = true;
        self
    }

    /// Insert a record directly and return its id
    pub fn seed(&self, entity: &str, fields: &[(&str, RpcValue)]) -> i64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let record: Record = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        state
            .tables
            .entry(entity.to_string())
            .or_default()
            .insert(id, record);
        id
    }

    /// Insert a record under a chosen id
    pub fn seed_at(&self, entity: &str, id: i64, fields: &[(&str, RpcValue)]) -> i64 {
        let mut state = self.lock();
        state.next_id = state.next_id.max(id + 1);
        let record: Record = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        state
            .tables
            .entry(entity.to_string())
            .or_default()
            .insert(id, record);
        id
    }

    pub fn records(&self, entity: &str) -> Vec<(i64, Record)> {
        self.lock()
            .tables
            .get(entity)
            .map(|t| t.iter().map(|(id, r)| (*id, r.clone())).collect())
            .unwrap_or_default()
    }

    pub fn record(&self, entity: &str, id: i64) -> Option<Record> {
        self.lock().tables.get(entity).and_then(|t| t.get(&id).cloned())
    }

    pub fn count(&self, entity: &str) -> usize {
        self.lock().tables.get(entity).map_or(0, BTreeMap::len)
    }

    /// Calls made so far for `method`
    pub fn calls_to(&self, method: &str) -> usize {
        self.lock().calls.iter().filter(|(_, m)| m == method).count()
    }

    pub fn logins(&self) -> u32 {
        self.lock().logins
    }
}

impl State {
    fn insert(&mut self, entity: &str, values: &Record) -> Result<i64, RpcError> {
        self.check(entity, values)?;
        let id = self.next_id;
        self.next_id += 1;
        self.tables
            .entry(entity.to_string())
            .or_default()
            .insert(id, Record::new());
        self.apply(entity, id, values)?;
        Ok(id)
    }

    fn update(&mut self, entity: &str, id: i64, values: &Record) -> Result<(), RpcError> {
        if !self.tables.get(entity).is_some_and(|t| t.contains_key(&id)) {
            return Err(fault(&format!("Record {}({}) does not exist", entity, id)));
        }
        self.check(entity, values)?;
        self.apply(entity, id, values)
    }

    fn check(&self, entity: &str, values: &Record) -> Result<(), RpcError> {
        for (target, check) in &self.constraints {
            if target == entity {
                if let Some(message) = check(values) {
                    return Err(fault(&message));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, entity: &str, id: i64, values: &Record) -> Result<(), RpcError> {
        for (field, value) in values {
            let key = (entity.to_string(), field.clone());
            let stored = if let Some((line_entity, inverse)) = self.one2many.get(&key).cloned() {
                let current = self.field(entity, id, field).ids();
                RpcValue::from(self.apply_lines(&line_entity, &inverse, id, current, value)?)
            } else if self.many2many.contains(&key) {
                let mut ids = self.field(entity, id, field).ids();
                for command in value.as_array().unwrap_or_default() {
                    let parts = command.as_array().unwrap_or_default();
                    if parts.first().and_then(RpcValue::as_i64) == Some(6) {
                        ids = parts.get(2).map(RpcValue::ids).unwrap_or_default();
                    }
                }
                RpcValue::from(ids)
            } else {
                value.clone()
            };
            if let Some(record) = self.tables.get_mut(entity).and_then(|t| t.get_mut(&id)) {
                record.insert(field.clone(), stored);
            }
        }
        Ok(())
    }

    fn apply_lines(
        &mut self,
        line_entity: &str,
        inverse: &str,
        parent: i64,
        mut ids: Vec<i64>,
        commands: &RpcValue,
    ) -> Result<Vec<i64>, RpcError> {
        for command in commands.as_array().unwrap_or_default() {
            let parts = command.as_array().unwrap_or_default();
            let code = parts.first().and_then(RpcValue::as_i64);
            let target = parts.get(1).and_then(RpcValue::as_i64).unwrap_or(0);
            let payload = parts.get(2).and_then(RpcValue::as_struct).cloned();
            match (code, payload) {
                (Some(0), Some(mut values)) => {
                    values.insert(inverse.to_string(), RpcValue::Int(parent));
                    ids.push(self.insert(line_entity, &values)?);
                }
                (Some(1), Some(values)) => self.update(line_entity, target, &values)?,
                (Some(2), _) => {
                    if let Some(table) = self.tables.get_mut(line_entity) {
                        table.remove(&target);
                    }
                    ids.retain(|i| *i != target);
                }
                _ => return Err(fault("Unsupported line command")),
            }
        }
        Ok(ids)
    }

    fn field(&self, entity: &str, id: i64, field: &str) -> RpcValue {
        self.tables
            .get(entity)
            .and_then(|t| t.get(&id))
            .and_then(|r| r.get(field))
            .cloned()
            .unwrap_or(RpcValue::Bool(false))
    }

    fn matches(id: i64, record: &Record, domain: &RpcValue) -> bool {
        domain.as_array().unwrap_or_default().iter().all(|leaf| {
            let parts = leaf.as_array().unwrap_or_default();
            let (Some(field), Some(op), Some(expected)) = (
                parts.first().and_then(RpcValue::as_str),
                parts.get(1).and_then(RpcValue::as_str),
                parts.get(2),
            ) else {
                return false;
            };
            let actual = if field == "id" {
                RpcValue::Int(id)
            } else {
                record.get(field).cloned().unwrap_or(RpcValue::Bool(false))
            };
            match op {
                "=" => same(&actual, expected),
                "in" => expected
                    .as_array()
                    .unwrap_or_default()
                    .iter()
                    .any(|e| same(&actual, e)),
                "=ilike" => text(&actual) == text(expected),
                "ilike" => text(&actual).contains(&text(expected)),
                _ => false,
            }
        })
    }

    fn render(&self, entity: &str, id: i64, record: &Record, fields: &[String]) -> Record {
        let mut out = Record::new();
        out.insert("id".to_string(), RpcValue::Int(id));
        let wanted: Vec<String> = if fields.is_empty() {
            record.keys().cloned().collect()
        } else {
            fields.to_vec()
        };
        for field in wanted.into_iter().filter(|f| f != "id") {
            let value = record.get(&field).cloned().unwrap_or(RpcValue::Bool(false));
            let key = (entity.to_string(), field.clone());
            let value = match (self.many2one.get(&key), value.as_i64()) {
                (Some(target), Some(ref_id)) => {
                    let name = self.field(target, ref_id, "name");
                    RpcValue::Array(vec![
                        RpcValue::Int(ref_id),
                        RpcValue::from(name.as_str().unwrap_or_default()),
                    ])
                }
                _ => value,
            };
            out.insert(field, value);
        }
        out
    }

    fn search(&self, entity: &str, domain: &RpcValue, limit: Option<usize>) -> Vec<i64> {
        let Some(table) = self.tables.get(entity) else {
            return Vec::new();
        };
        let ids = table
            .iter()
            .filter(|(id, record)| Self::matches(**id, record, domain))
            .map(|(id, _)| *id);
        match limit {
            Some(limit) if limit > 0 => ids.take(limit).collect(),
            _ => ids.collect(),
        }
    }

    fn check_fields(&self, entity: &str, fields: &[String]) -> Result<(), RpcError> {
        let Some(declared) = self.declared_fields.get(entity) else {
            return Ok(());
        };
        match fields.iter().find(|f| *f != "id" && !declared.contains(f)) {
            Some(field) => Err(RpcError::Fault {
                code: "1".to_string(),
                message: format!(
                    "Traceback (most recent call last):\nValueError: Invalid field '{}' on model '{}'",
                    field, entity
                ),
            }),
            None => Ok(()),
        }
    }

    fn read(&self, entity: &str, ids: &[i64], fields: &[String]) -> RpcValue {
        let Some(table) = self.tables.get(entity) else {
            return RpcValue::Array(Vec::new());
        };
        RpcValue::Array(
            ids.iter()
                .filter_map(|id| table.get(id).map(|r| (id, r)))
                .map(|(id, r)| RpcValue::Struct(self.render(entity, *id, r, fields)))
                .collect(),
        )
    }
}

fn fault(message: &str) -> RpcError {
    RpcError::Fault {
        code: "1".to_string(),
        message: format!("Traceback (most recent call last):\nValidationError: {}", message),
    }
}

fn same(actual: &RpcValue, expected: &RpcValue) -> bool {
    match (actual.relation_id(), expected.as_i64()) {
        (Some(a), Some(e)) => a == e,
        _ => actual == expected,
    }
}

fn text(value: &RpcValue) -> String {
    match value {
        RpcValue::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn string_list(value: Option<&RpcValue>) -> Vec<String> {
    value
        .and_then(RpcValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl ErpApi for FakeErp {
    async fn authenticate(&mut self) -> Result<i64, RpcError> {
        let mut state = self.lock();
        if let Some(pos) = state
            .failures
            .iter()
            .position(|(m, _)| m.as_deref() == Some("authenticate"))
        {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        if state.reject_login {
            return Err(RpcError::AuthFailure("invalid credentials".to_string()));
        }
        state.authenticated = true;
        state.logins += 1;
        Ok(2)
    }

    async fn execute_kw(
        &mut self,
        entity: &str,
        method: &str,
        args: Vec<RpcValue>,
        kwargs: Record,
    ) -> Result<RpcValue, RpcError> {
        let mut state = self.lock();
        state.calls.push((entity.to_string(), method.to_string()));

        if let Some(pos) = state
            .failures
            .iter()
            .position(|(m, _)| m.as_deref().is_none_or(|m| m == method))
        {
            if let Some((_, error)) = state.failures.remove(pos) {
                return Err(error);
            }
        }
        if !state.authenticated {
            return Err(RpcError::AuthFailure("not authenticated".to_string()));
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or(RpcValue::Nil);
        let limit = kwargs
            .get("limit")
            .and_then(RpcValue::as_i64)
            .map(|l| l as usize);
        let fields = string_list(kwargs.get("fields"));

        match method {
            "search" => Ok(RpcValue::from(state.search(entity, &arg(0), limit))),
            "search_count" => Ok(RpcValue::Int(state.search(entity, &arg(0), None).len() as i64)),
            "search_read" => {
                state.check_fields(entity, &fields)?;
                let ids = state.search(entity, &arg(0), limit);
                Ok(state.read(entity, &ids, &fields))
            }
            "read" => {
                state.check_fields(entity, &fields)?;
                Ok(state.read(entity, &arg(0).ids(), &fields))
            }
            "create" => {
                let values = arg(0)
                    .as_struct()
                    .cloned()
                    .ok_or_else(|| fault("create expects a mapping"))?;
                state.insert(entity, &values).map(RpcValue::Int)
            }
            "write" => {
                let values = arg(1)
                    .as_struct()
                    .cloned()
                    .ok_or_else(|| fault("write expects a mapping"))?;
                for id in arg(0).ids() {
                    state.update(entity, id, &values)?;
                }
                Ok(RpcValue::Bool(true))
            }
            "fields_get" => {
                let names: Vec<String> = match state.declared_fields.get(entity) {
                    Some(names) => names.clone(),
                    None => {
                        let mut names: Vec<String> = state
                            .tables
                            .get(entity)
                            .into_iter()
                            .flat_map(|t| t.values().flat_map(|r| r.keys().cloned()))
                            .collect::<HashSet<_>>()
                            .into_iter()
                            .collect();
                        names.sort();
                        names
                    }
                };
                let mut out = Record::new();
                for name in names {
                    let mut attrs = Record::new();
                    attrs.insert("type".to_string(), RpcValue::from("char"));
                    out.insert(name, RpcValue::Struct(attrs));
                }
                Ok(RpcValue::Struct(out))
            }
            "action_post" => {
                let mut values = Record::new();
                values.insert("state".to_string(), RpcValue::from("posted"));
                for id in arg(0).ids() {
                    state.update(entity, id, &values)?;
                }
                Ok(RpcValue::Bool(true))
            }
            other => Err(fault(&format!("Unknown method {}", other))),
        }
    }

    async fn version(&mut self) -> Result<RpcValue, RpcError> {
        let mut info = Record::new();
        info.insert("server_version".to_string(), RpcValue::from("17.0"));
        Ok(RpcValue::Struct(info))
    }

    async fn close(&mut self) {
        self.lock().authenticated = false;
    }
}
