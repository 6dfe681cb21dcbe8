//! Compare planned payloads with what the server already holds
//!
//! Writes are limited to the fields that differ, which is what makes a
//! second run over the same input a no-op. Values are compared the way the
//! server returns them: many-to-one fields read back as `[id, name]`,
//! empty fields as `false`, many-to-many fields as id lists.

use std::collections::HashSet;

use crate::api::operations::Command;
use crate::api::xmlrpc::{Record, RpcValue};

const EPSILON: f64 = 1e-6;

/// Whether a planned value matches the stored one
pub fn values_equal(desired: &RpcValue, current: &RpcValue) -> bool {
    match (desired, current) {
        (d, c) if d.is_empty_value() => c.is_empty_value(),
        (RpcValue::Int(d), RpcValue::Array(_)) => current.relation_id() == Some(*d),
        (RpcValue::Int(d), RpcValue::Int(c)) => d == c,
        (RpcValue::Int(_), RpcValue::Double(_))
        | (RpcValue::Double(_), RpcValue::Int(_))
        | (RpcValue::Double(_), RpcValue::Double(_)) => {
            match (desired.as_f64(), current.as_f64()) {
                (Some(d), Some(c)) => (d - c).abs() <= EPSILON * d.abs().max(c.abs()).max(1.0),
                _ => false,
            }
        }
        (RpcValue::String(d), RpcValue::String(c)) => d.trim() == c.trim(),
        (RpcValue::Array(commands), _) => match replace_set(commands) {
            Some(ids) => ids == current.ids().into_iter().collect::<HashSet<_>>(),
            None => desired == current,
        },
        _ => desired == current,
    }
}

/// Ids of a single `(6, 0, ids)` command list
fn replace_set(commands: &[RpcValue]) -> Option<HashSet<i64>> {
    let [command] = commands else {
        return None;
    };
    let parts = command.as_array()?;
    match parts {
        [RpcValue::Int(6), _, ids] => Some(ids.ids().into_iter().collect()),
        _ => None,
    }
}

/// Fields of `desired` whose value differs from `current`
pub fn diff_record(desired: &Record, current: &Record) -> Record {
    desired
        .iter()
        .filter(|(field, value)| {
            let stored = current.get(*field).cloned().unwrap_or(RpcValue::Bool(false));
            !values_equal(value, &stored)
        })
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

/// Whether the stored lines already equal the planned ones, in order
pub fn lines_match(desired: &[Record], current: &[Record]) -> bool {
    desired.len() == current.len()
        && desired
            .iter()
            .zip(current)
            .all(|(d, c)| diff_record(d, c).is_empty())
}

fn line_id(record: &Record) -> Option<i64> {
    record.get("id").and_then(RpcValue::as_i64)
}

/// Delete every stored line and create the planned ones
pub fn replace_lines(desired: &[Record], current: &[Record]) -> Vec<Command> {
    current
        .iter()
        .filter_map(line_id)
        .map(Command::Delete)
        .chain(desired.iter().cloned().map(Command::Create))
        .collect()
}

/// Pair planned and stored lines on `identity` and emit the minimal
/// update/create/delete commands. Repeated identities pair in order.
pub fn merge_lines(desired: &[Record], current: &[Record], identity: &str) -> Vec<Command> {
    let mut unmatched: Vec<&Record> = current.iter().collect();
    let mut commands = Vec::new();

    for line in desired {
        let key = line.get(identity).cloned().unwrap_or(RpcValue::Nil);
        let position = unmatched.iter().position(|stored| {
            let stored_key = stored.get(identity).cloned().unwrap_or(RpcValue::Bool(false));
            !key.is_empty_value() && values_equal(&key, &stored_key)
        });

        match position {
            Some(pos) => {
                let stored = unmatched.remove(pos);
                let changes = diff_record(line, stored);
                if let (false, Some(id)) = (changes.is_empty(), line_id(stored)) {
                    commands.push(Command::Update(id, changes));
                }
            }
            None => commands.push(Command::Create(line.clone())),
        }
    }

    commands.extend(unmatched.into_iter().filter_map(line_id).map(Command::Delete));
    commands
}
