//! Per-document upsert
//!
//! For each group: coerce the cells, resolve references, find the target by
//! its identity rule, then create it (lines embedded) or update it with
//! only the fields and lines that differ. Immutable targets are skipped and
//! an optional state-transition action runs last.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::api::client::ErpApi;
use crate::api::error::{FailureClass, RpcError};
use crate::api::operations::{Command, Operation};
use crate::api::query::Domain;
use crate::api::session::Session;
use crate::api::xmlrpc::{Record, RpcValue};
use crate::transfer::coerce::{coerce_field, coerce_value};
use crate::transfer::diff::{diff_record, lines_match, merge_lines, replace_lines};
use crate::transfer::resolve::{Resolved, Resolver};
use crate::transfer::types::{
    FailureKind, FieldSpec, Group, LinePolicy, Mapping, Outcome, Row, SuccessAction, Value,
    normalize_key,
};

/// Why a group stopped early
enum GroupError {
    /// Recorded against the group; the job continues
    Outcome(Outcome),
    /// Ends the job
    Fatal(RpcError),
}

impl From<RpcError> for GroupError {
    fn from(error: RpcError) -> Self {
        if error.is_fatal() {
            GroupError::Fatal(error)
        } else {
            GroupError::Outcome(Outcome::failure(failure_kind(&error), describe(&error)))
        }
    }
}

fn failure_kind(error: &RpcError) -> FailureKind {
    match error.class() {
        FailureClass::Semantic => FailureKind::SemanticRejection,
        FailureClass::Transient => FailureKind::TransientFailure,
        FailureClass::Fatal => match error {
            RpcError::AuthFailure(_) => FailureKind::AuthFailure,
            _ => FailureKind::Unreachable,
        },
    }
}

fn describe(error: &RpcError) -> String {
    match error {
        RpcError::RetriesExhausted { attempts, last } => {
            format!("gave up after {} attempts: {}", attempts, last.summary())
        }
        other => other.summary(),
    }
}

fn fail(kind: FailureKind, message: impl Into<String>) -> GroupError {
    GroupError::Outcome(Outcome::failure(kind, message))
}

type Coerced<'m> = Vec<(&'m FieldSpec, Value)>;

/// Applies one mapping, group by group
pub struct Executor<'m> {
    mapping: &'m Mapping,
    dry_run: bool,
    /// Identity keys already handled in this run, with their first line
    seen: HashMap<String, usize>,
    warnings: Vec<String>,
    planned: usize,
}

impl<'m> Executor<'m> {
    pub fn new(mapping: &'m Mapping, dry_run: bool) -> Self {
        Self {
            mapping,
            dry_run,
            seen: HashMap::new(),
            warnings: Vec::new(),
            planned: 0,
        }
    }

    /// Restore identities seen before an interruption
    pub fn with_seen(mut self, seen: HashMap<String, usize>) -> Self {
        self.seen = seen;
        self
    }

    pub fn seen(&self) -> &HashMap<String, usize> {
        &self.seen
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Operations logged instead of executed in dry runs
    pub fn planned(&self) -> usize {
        self.planned
    }

    /// Process one group. Only fatal remote errors are returned as `Err`.
    pub async fn process<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        resolver: &mut Resolver,
        group: &Group,
    ) -> Result<Outcome, RpcError> {
        match self.upsert(session, resolver, group).await {
            Ok(outcome) | Err(GroupError::Outcome(outcome)) => Ok(outcome),
            Err(GroupError::Fatal(error)) => Err(error),
        }
    }

    async fn upsert<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        resolver: &mut Resolver,
        group: &Group,
    ) -> Result<Outcome, GroupError> {
        let mapping = self.mapping;
        let Some(head) = group.head() else {
            return Ok(Outcome::success(SuccessAction::Unchanged, None));
        };

        let header = coerce_all(&mapping.header, head)?;
        let lines = self.coerce_lines(group)?;

        let identity = header
            .iter()
            .find(|(spec, _)| spec.column == mapping.identity.column)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        if identity.is_null() {
            return Err(fail(
                FailureKind::CoercionError,
                format!(
                    "line {}: identity column '{}' is empty",
                    head.line, mapping.identity.column
                ),
            ));
        }

        let key = normalize_key(&identity.to_string());
        if let Some(first) = self.seen.get(&key) {
            return Err(fail(
                FailureKind::DuplicateInBatch,
                format!("'{}' was already processed from line {}", identity, first),
            ));
        }
        self.seen.insert(key, head.line);

        let mut payload: Record = mapping
            .defaults
            .iter()
            .map(|(field, constant)| (field.clone(), constant.to_rpc()))
            .collect();
        let fields = self
            .build_payload(session, resolver, &mapping.target, &header, head)
            .await?;
        payload.extend(fields);

        let mut line_payloads = Vec::with_capacity(lines.len());
        if let Some(spec) = &mapping.lines {
            for (row, values) in &lines {
                line_payloads.push(
                    self.build_payload(session, resolver, &spec.entity, values, row)
                        .await?,
                );
            }
        }

        let identity_value = payload
            .get(&mapping.identity.field)
            .cloned()
            .unwrap_or_else(|| identity.to_rpc());
        let mut domain = Domain::new().eq(mapping.identity.field.as_str(), identity_value);
        for field in &mapping.identity.scope {
            if let Some(constant) = mapping.defaults.get(field) {
                domain = domain.eq(field.as_str(), constant.to_rpc());
            }
        }

        let matches = session.search(&mapping.target, &domain, Some(2)).await?;
        match matches.as_slice() {
            [] => self.create(session, payload, line_payloads, &identity).await,
            [id] => {
                self.update(session, resolver, *id, payload, line_payloads, &identity)
                    .await
            }
            _ => Err(fail(
                FailureKind::Ambiguous,
                format!(
                    "several {} records have {} = '{}'",
                    mapping.target, mapping.identity.field, identity
                ),
            )),
        }
    }

    /// Coerce line columns of every row that carries a line
    fn coerce_lines<'g>(
        &self,
        group: &'g Group,
    ) -> Result<Vec<(&'g Row, Coerced<'m>)>, GroupError> {
        let mapping = self.mapping;
        let columns = mapping.line_columns();
        if columns.is_empty() {
            return Ok(Vec::new());
        }
        let mut lines = Vec::new();
        for row in &group.rows {
            // A row without any line cell is a header-only row
            if columns.iter().all(|spec| row.get(&spec.column).is_null()) {
                continue;
            }
            lines.push((row, coerce_all(columns, row)?));
        }
        Ok(lines)
    }

    /// Translate coerced cells into a write payload for `entity`
    async fn build_payload<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        resolver: &mut Resolver,
        entity: &str,
        values: &[(&FieldSpec, Value)],
        row: &Row,
    ) -> Result<Record, GroupError> {
        let mapping = self.mapping;
        let mut payload = Record::new();

        for (spec, value) in values {
            if value.is_null() {
                continue;
            }
            if spec.probe && !resolver.has_field(session, entity, &spec.field).await? {
                debug!(
                    "{} has no field '{}'; column '{}' ignored",
                    entity, spec.field, spec.column
                );
                continue;
            }

            let Some(name) = &spec.reference else {
                payload.insert(spec.field.clone(), value.to_rpc());
                continue;
            };
            let Some(rule) = mapping.reference(name) else {
                return Err(fail(
                    FailureKind::UnresolvedReference,
                    format!("unknown reference rule '{}'", name),
                ));
            };

            let text = value.to_string();
            let keys: Vec<&str> = if spec.many {
                text.split(',').map(str::trim).filter(|k| !k.is_empty()).collect()
            } else {
                vec![text.as_str()]
            };

            let mut ids = Vec::new();
            let mut missing = Vec::new();
            for key in keys {
                match resolver.resolve(session, rule, key, row).await? {
                    Some(Resolved::Existing(id)) => ids.push(id),
                    Some(Resolved::Planned) => {}
                    None => missing.push(key.to_string()),
                }
            }

            if !missing.is_empty() {
                let tried: Vec<&str> = rule.attempts.iter().map(|a| a.field.as_str()).collect();
                let message = format!(
                    "line {}: {}: no {} matches '{}' (tried {})",
                    row.line,
                    spec.field,
                    rule.entity,
                    missing.join("', '"),
                    tried.join(", ")
                );
                if spec.required {
                    return Err(fail(FailureKind::UnresolvedReference, message));
                }
                warn!("{}", message);
                self.warnings.push(message);
                if !spec.many {
                    continue;
                }
            }

            let rpc = if spec.many {
                Command::list(&[Command::Set(ids)])
            } else {
                match ids.first() {
                    Some(id) => RpcValue::Int(*id),
                    // Planned creation in a dry run
                    None => RpcValue::from(format!("<new {} '{}'>", rule.entity, text)),
                }
            };
            payload.insert(spec.field.clone(), rpc);
        }

        Ok(payload)
    }

    async fn create<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        mut payload: Record,
        lines: Vec<Record>,
        identity: &Value,
    ) -> Result<Outcome, GroupError> {
        let mapping = self.mapping;
        if !mapping.create_missing {
            return Err(fail(
                FailureKind::UnresolvedReference,
                format!(
                    "no {} with {} = '{}'",
                    mapping.target, mapping.identity.field, identity
                ),
            ));
        }

        if let Some(spec) = &mapping.lines {
            if !lines.is_empty() {
                let commands: Vec<Command> = lines.into_iter().map(Command::Create).collect();
                payload.insert(spec.field.clone(), Command::list(&commands));
            }
        }

        let operation = Operation::create(mapping.target.as_str(), payload);
        if self.dry_run {
            self.plan(&operation);
            if let Some(action) = &mapping.post_action {
                info!("[dry-run] then call {}() on the new record", action);
            }
            return Ok(Outcome::success(SuccessAction::Created, None));
        }

        let id = operation.execute(session).await?.record_id();
        info!("Created {} #{} '{}'", mapping.target, id, identity);
        self.post(session, id).await?;
        Ok(Outcome::success(SuccessAction::Created, Some(id)))
    }

    async fn update<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        resolver: &mut Resolver,
        id: i64,
        payload: Record,
        lines: Vec<Record>,
        identity: &Value,
    ) -> Result<Outcome, GroupError> {
        let mapping = self.mapping;

        let mut fields: Vec<&str> = payload.keys().map(String::as_str).collect();
        if let Some(state_field) = &mapping.state_field {
            fields.push(state_field);
        }
        if let Some(spec) = &mapping.lines {
            fields.push(&spec.field);
        }

        let current = session
            .read(&mapping.target, &[id], &fields)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                fail(
                    FailureKind::SemanticRejection,
                    format!("{} #{} disappeared before it could be read", mapping.target, id),
                )
            })?;

        let state = mapping
            .state_field
            .as_ref()
            .map(|f| current.get(f).and_then(RpcValue::as_str).unwrap_or_default().to_string());
        // An unset state reads back as false
        let mutable = state
            .as_deref()
            .is_none_or(|s| s.is_empty() || mapping.is_mutable_state(s));

        let mut changes = diff_record(&payload, &current);

        if let Some(spec) = &mapping.lines {
            let line_ids = current.get(&spec.field).map(RpcValue::ids).unwrap_or_default();
            let mut line_fields: Vec<&str> = Vec::with_capacity(spec.columns.len() + 1);
            for column in &spec.columns {
                // Probed fields the line entity lacks were never written
                if column.probe
                    && !resolver.has_field(session, &spec.entity, &column.field).await?
                {
                    continue;
                }
                line_fields.push(&column.field);
            }
            if let Some(identity_field) = spec.identity.as_deref() {
                if !line_fields.contains(&identity_field) {
                    line_fields.push(identity_field);
                }
            }
            let mut stored = session.read(&spec.entity, &line_ids, &line_fields).await?;
            stored.sort_by_key(|line| {
                let id = line.get("id").and_then(RpcValue::as_i64);
                line_ids.iter().position(|l| Some(*l) == id)
            });

            let commands = match (spec.policy, spec.identity.as_deref()) {
                (LinePolicy::Merge, Some(identity_field)) => {
                    merge_lines(&lines, &stored, identity_field)
                }
                _ if spec.always_replace || !lines_match(&lines, &stored) => {
                    replace_lines(&lines, &stored)
                }
                _ => Vec::new(),
            };
            if !commands.is_empty() {
                changes.insert(spec.field.clone(), Command::list(&commands));
            }
        }

        if !mutable {
            if changes.is_empty() {
                return Ok(Outcome::success(SuccessAction::Unchanged, Some(id)));
            }
            return Err(fail(
                FailureKind::NotMutable,
                format!(
                    "{} #{} '{}' is {}; changes not applied",
                    mapping.target,
                    id,
                    identity,
                    state.unwrap_or_default()
                ),
            ));
        }

        if changes.is_empty() {
            // A document left in a mutable state still owes its transition
            if mapping.post_action.is_some() && mapping.state_field.is_some() {
                self.post(session, id).await?;
                return Ok(Outcome::success(SuccessAction::Updated, Some(id)));
            }
            return Ok(Outcome::success(SuccessAction::Unchanged, Some(id)));
        }

        let operation = Operation::write(mapping.target.as_str(), id, changes);
        if self.dry_run {
            self.plan(&operation);
        } else {
            operation.execute(session).await?;
            info!("Updated {} #{} '{}'", mapping.target, id, identity);
        }
        self.post(session, id).await?;
        Ok(Outcome::success(SuccessAction::Updated, Some(id)))
    }

    /// Run the mapping's state-transition action on `id`
    async fn post<A: ErpApi>(
        &mut self,
        session: &mut Session<A>,
        id: i64,
    ) -> Result<(), GroupError> {
        let mapping = self.mapping;
        let Some(action) = &mapping.post_action else {
            return Ok(());
        };
        let operation = Operation::action(mapping.target.as_str(), id, action.as_str());
        if self.dry_run {
            self.plan(&operation);
            return Ok(());
        }

        match operation.execute(session).await {
            Ok(_) => Ok(()),
            Err(error) if error.is_fatal() => Err(GroupError::Fatal(error)),
            Err(error) => Err(fail(
                failure_kind(&error),
                format!(
                    "{} #{} was saved but {} failed: {}",
                    mapping.target,
                    id,
                    action,
                    describe(&error)
                ),
            )),
        }
    }

    fn plan(&mut self, operation: &Operation) {
        self.planned += 1;
        info!("[dry-run] {}", operation);
    }

    /// Warm the resolver cache for a batch of groups with bulk queries
    pub async fn prefetch<A: ErpApi>(
        &self,
        session: &mut Session<A>,
        resolver: &mut Resolver,
        groups: &[Group],
    ) -> Result<(), RpcError> {
        let mut wanted: HashMap<&str, Vec<String>> = HashMap::new();

        let header = self.mapping.header.iter().filter(|s| s.reference.is_some() && !s.many);
        let line = self.mapping.line_columns().iter().filter(|s| s.reference.is_some() && !s.many);

        for group in groups {
            let Some(head) = group.head() else {
                continue;
            };
            let cells = header
                .clone()
                .map(|spec| (spec, head))
                .chain(group.rows.iter().flat_map(|row| line.clone().map(move |spec| (spec, row))));
            for (spec, row) in cells {
                let Some(name) = spec.reference.as_deref() else {
                    continue;
                };
                if let Ok(value) = coerce_value(spec.kind, spec.blank, row.get(&spec.column)) {
                    if !value.is_null() {
                        wanted.entry(name).or_default().push(value.to_string());
                    }
                }
            }
        }

        for (name, values) in wanted {
            let Some(rule) = self.mapping.reference(name) else {
                continue;
            };
            match resolver.prefetch(session, rule, &values).await {
                Ok(_) => {}
                Err(error) if error.is_fatal() => return Err(error),
                Err(error) => warn!("Prefetch of {} failed: {}", rule.entity, error),
            }
        }
        Ok(())
    }
}

fn coerce_all<'m>(specs: &'m [FieldSpec], row: &Row) -> Result<Coerced<'m>, GroupError> {
    specs
        .iter()
        .map(|spec| {
            coerce_field(spec, row)
                .map(|value| (spec, value))
                .map_err(|e| fail(FailureKind::CoercionError, format!("line {}: {}", row.line, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::fake::FakeErp;
    use crate::api::resilience::ResilienceConfig;
    use crate::transfer::types::MemoryCache;
    use std::sync::{Arc, Mutex};

    const BILLS: &str = r#"
name = "bills"
target = "account.move"
grouping_key = ["document"]
state_field = "state"
#TOP#

[identity]
column = "document"
field = "name"

[[header]]
column = "document"
field = "name"
required = true

[[header]]
column = "partner"
field = "partner_id"
type = "code"
reference = "partner"

[[header]]
column = "reference"
field = "ref"

[[header]]
column = "date"
field = "invoice_date"
type = "date"

[[header]]
column = "tags"
field = "tag_ids"
reference = "tag"
many = true

[lines]
field = "invoice_line_ids"
entity = "account.move.line"
#LINES#

[[lines.columns]]
column = "product"
field = "product_id"
type = "code"
required = true
reference = "product"

[[lines.columns]]
column = "quantity"
field = "quantity"
type = "decimal"

[[lines.columns]]
column = "note"
field = "x_note"
probe = true

[references.partner]
entity = "res.partner"
attempts = [{ field = "ref" }]

[references.product]
entity = "product.product"
attempts = [{ field = "default_code" }]

[references.tag]
entity = "account.account.tag"
attempts = [{ field = "name" }]
"#;

    fn mapping(top: &str, lines: &str) -> Mapping {
        Mapping::parse(&BILLS.replace("#TOP#", top).replace("#LINES#", lines)).unwrap()
    }

    fn row(line: usize, cells: &[(&str, &str)]) -> Row {
        Row {
            line,
            raw: cells
                .iter()
                .map(|(_, v)| Value::String(v.to_string()))
                .collect(),
            values: cells
                .iter()
                .map(|(c, v)| (c.to_string(), Value::String(v.to_string())))
                .collect(),
        }
    }

    /// One document: header cells on the first row, one row per line
    fn bill(index: usize, header: &[(&str, &str)], lines: &[(&str, &str)]) -> Group {
        let rows = lines
            .iter()
            .enumerate()
            .map(|(i, (product, quantity))| {
                let mut cells = vec![("product", *product), ("quantity", *quantity)];
                if i == 0 {
                    cells.extend_from_slice(header);
                }
                row(index * 10 + i + 2, &cells)
            })
            .collect();
        Group {
            index,
            key: Vec::new(),
            rows,
        }
    }

    struct Ids {
        gizmo: i64,
        urgent: i64,
        export: i64,
    }

    fn erp() -> (FakeErp, Ids) {
        let erp = FakeErp::new();
        erp.seed(
            "res.partner",
            &[("name", RpcValue::from("Acme")), ("ref", RpcValue::from("C001"))],
        );
        let product = |code: &str, name: &str| {
            erp.seed(
                "product.product",
                &[("name", RpcValue::from(name)), ("default_code", RpcValue::from(code))],
            )
        };
        product("A", "Widget");
        product("B", "Gadget");
        let gizmo = product("C", "Gizmo");
        let urgent = erp.seed("account.account.tag", &[("name", RpcValue::from("urgent"))]);
        let export = erp.seed("account.account.tag", &[("name", RpcValue::from("export"))]);

        erp.many2one("account.move", "partner_id", "res.partner")
            .one2many("account.move", "invoice_line_ids", "account.move.line", "move_id")
            .many2one("account.move.line", "product_id", "product.product")
            .many2many("account.move", "tag_ids")
            .declare_fields("account.move.line", &["product_id", "quantity", "move_id"]);

        let ids = Ids {
            gizmo,
            urgent,
            export,
        };
        (erp, ids)
    }

    /// Process `groups` in one fresh run; returns outcomes and warnings
    async fn run(
        erp: &FakeErp,
        mapping: &Mapping,
        groups: &[Group],
    ) -> (Vec<Outcome>, Vec<String>) {
        let mut session = Session::new(erp.clone(), &ResilienceConfig::disabled());
        session.authenticate().await.unwrap();
        let mut resolver = Resolver::new(Box::new(MemoryCache::new()), false);
        let mut executor = Executor::new(mapping, false);

        let mut outcomes = Vec::new();
        for group in groups {
            let outcome = executor.process(&mut session, &mut resolver, group).await.unwrap();
            outcomes.push(outcome);
        }
        session.close().await;

        let mut warnings = resolver.take_warnings();
        warnings.extend(executor.take_warnings());
        (outcomes, warnings)
    }

    fn created_id(outcome: &Outcome) -> i64 {
        match outcome {
            Outcome::Success {
                action: SuccessAction::Created,
                record_id: Some(id),
            } => *id,
            other => panic!("expected a creation, got {:?}", other),
        }
    }

    fn line_ids(erp: &FakeErp, id: i64) -> Vec<i64> {
        erp.record("account.move", id).unwrap()["invoice_line_ids"].ids()
    }

    #[tokio::test]
    async fn test_rerun_ignores_line_fields_the_server_lacks() {
        let (erp, _) = erp();
        let mapping = mapping("", "");
        let group = bill(
            0,
            &[("document", "INV-1"), ("partner", "C001"), ("note", "rush")],
            &[("A", "2")],
        );

        let (first, _) = run(&erp, &mapping, std::slice::from_ref(&group)).await;
        let id = created_id(&first[0]);
        let lines = line_ids(&erp, id);
        assert!(!erp.record("account.move.line", lines[0]).unwrap().contains_key("x_note"));

        let (second, _) = run(&erp, &mapping, &[group]).await;
        assert_eq!(second[0], Outcome::success(SuccessAction::Unchanged, Some(id)));
        assert_eq!(erp.calls_to("write"), 0);
    }

    #[tokio::test]
    async fn test_update_writes_only_changed_fields() {
        let (erp, _) = erp();
        let written: Arc<Mutex<Vec<Record>>> = Arc::default();
        let sink = Arc::clone(&written);
        erp.constraint("account.move", move |values| {
            sink.lock().unwrap().push(values.clone());
            None
        });
        let mapping = mapping("", "");
        let header = |reference| {
            vec![("document", "INV-1"), ("partner", "C001"), ("reference", reference)]
        };

        let (first, _) = run(&erp, &mapping, &[bill(0, &header("PO-1"), &[("A", "2")])]).await;
        let id = created_id(&first[0]);
        let (second, _) = run(&erp, &mapping, &[bill(0, &header("PO-2"), &[("A", "2")])]).await;

        assert_eq!(second[0], Outcome::success(SuccessAction::Updated, Some(id)));
        let last = written.lock().unwrap().last().cloned().unwrap();
        assert_eq!(last.keys().collect::<Vec<_>>(), vec!["ref"]);
        assert_eq!(erp.record("account.move", id).unwrap()["ref"], RpcValue::from("PO-2"));
    }

    #[tokio::test]
    async fn test_identity_matching_several_targets_is_ambiguous() {
        let (erp, _) = erp();
        erp.seed("account.move", &[("name", RpcValue::from("INV-1"))]);
        erp.seed("account.move", &[("name", RpcValue::from("INV-1"))]);

        let group = bill(0, &[("document", "INV-1")], &[("A", "1")]);
        let (outcomes, _) = run(&erp, &mapping("", ""), &[group]).await;

        assert_eq!(outcomes[0].failure_kind(), Some(FailureKind::Ambiguous));
        assert_eq!(erp.calls_to("create"), 0);
    }

    #[tokio::test]
    async fn test_repeated_identity_in_one_run_is_skipped() {
        let (erp, _) = erp();
        let groups = [
            bill(0, &[("document", "INV-1")], &[("A", "1")]),
            bill(1, &[("document", "INV-1")], &[("B", "1")]),
            bill(2, &[("document", "inv-1")], &[("B", "1")]),
        ];

        let (outcomes, _) = run(&erp, &mapping("", ""), &groups).await;

        created_id(&outcomes[0]);
        let Outcome::Failure { kind, message } = &outcomes[1] else {
            panic!("expected a duplicate, got {:?}", outcomes[1]);
        };
        assert_eq!(*kind, FailureKind::DuplicateInBatch);
        assert!(message.contains("line 2"), "{}", message);
        // Identities are case sensitive
        created_id(&outcomes[2]);
        assert_eq!(erp.count("account.move"), 2);
    }

    #[tokio::test]
    async fn test_merge_policy_keeps_matching_lines() {
        let (erp, ids) = erp();
        let mapping = mapping("", "policy = \"merge\"\nidentity = \"product_id\"");
        let header = [("document", "INV-1")];

        let (first, _) = run(&erp, &mapping, &[bill(0, &header, &[("A", "1"), ("B", "2")])]).await;
        let id = created_id(&first[0]);
        let before = line_ids(&erp, id);

        let (second, _) = run(&erp, &mapping, &[bill(0, &header, &[("A", "5"), ("C", "1")])]).await;
        assert_eq!(second[0], Outcome::success(SuccessAction::Updated, Some(id)));

        let after = line_ids(&erp, id);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0], before[0]);
        let widget_line = erp.record("account.move.line", before[0]).unwrap();
        assert_eq!(widget_line["quantity"], RpcValue::Double(5.0));
        assert!(erp.record("account.move.line", before[1]).is_none());
        let gizmo_line = erp.record("account.move.line", after[1]).unwrap();
        assert_eq!(gizmo_line["product_id"], RpcValue::Int(ids.gizmo));
    }

    #[tokio::test]
    async fn test_always_replace_recreates_matching_lines() {
        let (erp, _) = erp();
        let mapping = mapping("", "always_replace = true");
        let group = bill(0, &[("document", "INV-1")], &[("A", "1")]);

        let (first, _) = run(&erp, &mapping, std::slice::from_ref(&group)).await;
        let id = created_id(&first[0]);
        let before = line_ids(&erp, id);

        let (second, _) = run(&erp, &mapping, &[group]).await;

        assert_eq!(second[0], Outcome::success(SuccessAction::Updated, Some(id)));
        let after = line_ids(&erp, id);
        assert_eq!(after.len(), 1);
        assert_ne!(after, before);
        assert_eq!(erp.count("account.move.line"), 1);
    }

    #[tokio::test]
    async fn test_many_reference_replaces_the_set() {
        let (erp, ids) = erp();
        let groups = [
            bill(0, &[("document", "INV-1"), ("tags", "urgent, export")], &[("A", "1")]),
            bill(1, &[("document", "INV-2"), ("tags", "urgent, nope")], &[("A", "1")]),
        ];

        let (outcomes, warnings) = run(&erp, &mapping("", ""), &groups).await;

        let both = created_id(&outcomes[0]);
        let tags = erp.record("account.move", both).unwrap()["tag_ids"].ids();
        assert_eq!(tags, vec![ids.urgent, ids.export]);

        let partial = created_id(&outcomes[1]);
        let tags = erp.record("account.move", partial).unwrap()["tag_ids"].ids();
        assert_eq!(tags, vec![ids.urgent]);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("'nope'"), "{}", warnings[0]);
    }

    #[tokio::test]
    async fn test_missing_line_reference_fails_the_group() {
        let (erp, _) = erp();
        let group = bill(0, &[("document", "INV-1")], &[("A", "1"), ("Z-9", "1")]);

        let (outcomes, _) = run(&erp, &mapping("", ""), &[group]).await;

        assert_eq!(outcomes[0].failure_kind(), Some(FailureKind::UnresolvedReference));
        assert_eq!(erp.count("account.move"), 0);
    }

    #[tokio::test]
    async fn test_post_action_runs_once() {
        let (erp, _) = erp();
        let mapping = mapping("post_action = \"action_post\"", "");
        let group = bill(0, &[("document", "INV-1"), ("partner", "C001")], &[("A", "1")]);

        let (first, _) = run(&erp, &mapping, std::slice::from_ref(&group)).await;
        let id = created_id(&first[0]);
        assert_eq!(erp.record("account.move", id).unwrap()["state"], RpcValue::from("posted"));

        let (second, _) = run(&erp, &mapping, &[group]).await;
        assert_eq!(second[0], Outcome::success(SuccessAction::Unchanged, Some(id)));
        assert_eq!(erp.calls_to("action_post"), 1);
    }

    #[tokio::test]
    async fn test_failed_post_action_reports_the_saved_record() {
        let (erp, _) = erp();
        erp.constraint("account.move", |values| {
            (values.get("state") == Some(&RpcValue::from("posted")))
                .then(|| "The journal is locked".to_string())
        });
        let mapping = mapping("post_action = \"action_post\"", "");
        let group = bill(0, &[("document", "INV-1")], &[("A", "1")]);

        let (outcomes, _) = run(&erp, &mapping, &[group]).await;

        let Outcome::Failure { kind, message } = &outcomes[0] else {
            panic!("expected a failure, got {:?}", outcomes[0]);
        };
        assert_eq!(*kind, FailureKind::SemanticRejection);
        assert!(message.contains("was saved but action_post failed"), "{}", message);
        assert!(message.contains("The journal is locked"), "{}", message);
        assert_eq!(erp.count("account.move"), 1);
    }

    #[tokio::test]
    async fn test_date_with_conflicting_readings_is_a_coercion_error() {
        let (erp, _) = erp();
        let group = bill(0, &[("document", "INV-1"), ("date", "01-02-03")], &[("A", "1")]);

        let (outcomes, _) = run(&erp, &mapping("", ""), &[group]).await;

        let Outcome::Failure { kind, message } = &outcomes[0] else {
            panic!("expected a failure, got {:?}", outcomes[0]);
        };
        assert_eq!(*kind, FailureKind::CoercionError);
        assert!(message.contains("ambiguous"), "{}", message);
        assert_eq!(erp.calls_to("create"), 0);
    }
}
