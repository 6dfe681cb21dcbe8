//! Business key resolution
//!
//! Turns values such as a partner code into remote identifiers by trying
//! the reference rule's lookup attempts in order. Hits and misses are cached
//! for the whole job; missing records are created when the rule carries a
//! creation template.

use std::collections::HashMap;

use log::{debug, info};

use crate::api::client::ErpApi;
use crate::api::error::RpcError;
use crate::api::metadata::FieldProbe;
use crate::api::query::{Domain, Operator};
use crate::api::session::Session;
use crate::api::xmlrpc::{Record, RpcValue};
use crate::transfer::types::{
    MatchMode, ReferenceRule, Resolution, ResolutionCache, Row, fold_key, normalize_key,
};

/// Candidates fetched per lookup attempt; enough to apply the tie-break
const CANDIDATE_LIMIT: usize = 20;
/// Values per bulk `in` query
const PREFETCH_CHUNK: usize = 200;

/// A resolved reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Existing(i64),
    /// Would be created; only produced in dry runs
    Planned,
}

impl MatchMode {
    fn operator(&self) -> Operator {
        match self {
            MatchMode::Exact => Operator::Eq,
            MatchMode::Insensitive => Operator::EqILike,
            MatchMode::Contains => Operator::ILike,
        }
    }

    /// Key under which two values are considered the same by this mode
    fn canonical(&self, value: &str) -> String {
        match self {
            MatchMode::Exact => normalize_key(value),
            MatchMode::Insensitive | MatchMode::Contains => fold_key(value),
        }
    }
}

/// Cache key for `value` under `rule`. Case is folded only when no attempt
/// of the rule compares exactly.
fn cache_key(rule: &ReferenceRule, value: &str) -> String {
    if rule.attempts.iter().any(|a| a.operator == MatchMode::Exact) {
        normalize_key(value)
    } else {
        fold_key(value)
    }
}

/// Reference resolver owned by a job
pub struct Resolver {
    cache: Box<dyn ResolutionCache>,
    probe: FieldProbe,
    dry_run: bool,
    warnings: Vec<String>,
    lookups: usize,
    created: usize,
}

impl Resolver {
    pub fn new(cache: Box<dyn ResolutionCache>, dry_run: bool) -> Self {
        Self {
            cache,
            probe: FieldProbe::new(),
            dry_run,
            warnings: Vec::new(),
            lookups: 0,
            created: 0,
        }
    }

    /// Whether `entity` exposes `field` (probed once per entity)
    pub async fn has_field<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        entity: &str,
        field: &str,
    ) -> Result<bool, RpcError> {
        self.probe.has_field(session, entity, field).await
    }

    /// Warnings collected since the last call
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Remote lookups issued so far
    pub fn lookups(&self) -> usize {
        self.lookups
    }

    pub fn created(&self) -> usize {
        self.created
    }

    /// Resolve `value` through the rule's attempts, creating it when allowed
    pub async fn resolve<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        rule: &ReferenceRule,
        value: &str,
        row: &Row,
    ) -> Result<Option<Resolved>, RpcError> {
        match self.lookup(session, rule, value).await? {
            Resolution::Found(id) => Ok(Some(Resolved::Existing(id))),
            Resolution::Missing => match &rule.create {
                Some(_) => self.create(session, rule, value, row).await.map(Some),
                None => Ok(None),
            },
        }
    }

    /// Resolve `value` without creating anything
    pub async fn lookup<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        rule: &ReferenceRule,
        value: &str,
    ) -> Result<Resolution, RpcError> {
        let key = cache_key(rule, value);
        if let Some(cached) = self.cache.get(&rule.entity, &key) {
            return Ok(cached);
        }

        for attempt in &rule.attempts {
            if !self.probe.has_field(session, &rule.entity, &attempt.field).await? {
                debug!("{} has no field '{}'; attempt skipped", rule.entity, attempt.field);
                continue;
            }

            self.lookups += 1;
            let domain = Domain::new().filter(
                attempt.field.as_str(),
                attempt.operator.operator(),
                value,
            );
            let fields = ["id", attempt.field.as_str()];
            let candidates = session
                .search_read(&rule.entity, &domain, &fields, Some(CANDIDATE_LIMIT))
                .await?;

            let field = (attempt.field.as_str(), attempt.operator);
            if let Some(id) = self.pick(&rule.entity, field, value, &candidates) {
                debug!("{} '{}' -> #{} via {}", rule.entity, value, id, attempt.field);
                self.cache.put(&rule.entity, &key, Resolution::Found(id));
                return Ok(Resolution::Found(id));
            }
        }

        self.cache.put(&rule.entity, &key, Resolution::Missing);
        Ok(Resolution::Missing)
    }

    /// Tie-break: exact canonical match first, else the lowest id
    fn pick(
        &mut self,
        entity: &str,
        (field, mode): (&str, MatchMode),
        value: &str,
        candidates: &[Record],
    ) -> Option<i64> {
        let id_of = |r: &Record| r.get("id").and_then(RpcValue::as_i64);

        match candidates {
            [] => None,
            [only] => id_of(only),
            _ => {
                let wanted = mode.canonical(value);
                let exact: Vec<i64> = candidates
                    .iter()
                    .filter(|r| {
                        r.get(field)
                            .and_then(RpcValue::as_str)
                            .is_some_and(|v| mode.canonical(v) == wanted)
                    })
                    .filter_map(id_of)
                    .collect();
                if let [id] = exact.as_slice() {
                    return Some(*id);
                }

                let pool: Vec<i64> = if exact.is_empty() {
                    candidates.iter().filter_map(id_of).collect()
                } else {
                    exact
                };
                let lowest = pool.iter().min().copied()?;
                self.warnings.push(format!(
                    "{} records of {} match {} '{}'; using the lowest id #{}",
                    pool.len(),
                    entity,
                    field,
                    value,
                    lowest
                ));
                Some(lowest)
            }
        }
    }

    async fn create<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        rule: &ReferenceRule,
        value: &str,
        row: &Row,
    ) -> Result<Resolved, RpcError> {
        let Some(template) = &rule.create else {
            return Err(RpcError::Malformed(format!("no creation template for {}", rule.entity)));
        };

        let mut values = Record::new();
        for (field, constant) in &template.fields {
            values.insert(field.clone(), constant.to_rpc());
        }
        for (field, column) in &template.columns {
            let cell = row.get(column);
            if !cell.is_null() {
                values.insert(field.clone(), cell.to_rpc());
            }
        }
        values.insert(template.value_field.clone(), RpcValue::from(value));

        if self.dry_run {
            info!("[dry-run] create {} {}", rule.entity, RpcValue::Struct(values));
            return Ok(Resolved::Planned);
        }

        let id = session.create(&rule.entity, values).await?;
        self.created += 1;
        info!("Created {} #{} for '{}'", rule.entity, id, value);
        self.cache.put(&rule.entity, &cache_key(rule, value), Resolution::Found(id));
        Ok(Resolved::Existing(id))
    }

    /// Resolve many values with bulk `in` queries on the rule's first exact
    /// attempt. Values not found stay uncached so fallbacks still run.
    pub async fn prefetch<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        rule: &ReferenceRule,
        values: &[String],
    ) -> Result<usize, RpcError> {
        let Some(attempt) = rule.attempts.first().filter(|a| a.operator == MatchMode::Exact) else {
            return Ok(0);
        };

        let mut pending: Vec<&String> = values
            .iter()
            .filter(|v| self.cache.get(&rule.entity, &cache_key(rule, v)).is_none())
            .collect();
        pending.sort();
        pending.dedup();
        if pending.is_empty()
            || !self.probe.has_field(session, &rule.entity, &attempt.field).await?
        {
            return Ok(0);
        }

        let mut resolved = 0;
        for chunk in pending.chunks(PREFETCH_CHUNK) {
            self.lookups += 1;
            let list: Vec<String> = chunk.iter().map(|v| v.to_string()).collect();
            let domain = Domain::new().is_in(attempt.field.as_str(), list);
            let records = session
                .search_read(&rule.entity, &domain, &["id", attempt.field.as_str()], None)
                .await?;

            let mut by_key: HashMap<String, Vec<i64>> = HashMap::new();
            for record in &records {
                let (Some(id), Some(key)) = (
                    record.get("id").and_then(RpcValue::as_i64),
                    record.get(&attempt.field).and_then(RpcValue::as_str),
                ) else {
                    continue;
                };
                by_key.entry(normalize_key(key)).or_default().push(id);
            }

            for value in chunk {
                // Several matches go through the per-value tie-break instead
                if let Some([id]) = by_key.get(&normalize_key(value)).map(Vec::as_slice) {
                    self.cache.put(&rule.entity, &cache_key(rule, value), Resolution::Found(*id));
                    resolved += 1;
                }
            }
        }

        debug!("Prefetched {}/{} {} keys", resolved, pending.len(), rule.entity);
        Ok(resolved)
    }
}
