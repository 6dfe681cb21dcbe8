//! Partition rows into documents
//!
//! Rows sharing a grouping-key tuple form one contiguous group. A blank key
//! cell continues the key of the group above it, so a document laid out as
//! one header row followed by line rows with empty key cells groups
//! correctly even when the key columns were not forward-filled.

use crate::transfer::types::{Group, Row, Value};

fn key_component(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Float(f) if f.fract() == 0.0 => Some(format!("{}", *f as i64)),
        other => {
            let text = other.to_string().trim().to_string();
            (!text.is_empty()).then_some(text)
        }
    }
}

/// Group rows by `key` columns, preserving source order
pub fn group_rows(rows: Vec<Row>, key: &[String]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();

    for row in rows {
        if key.is_empty() {
            groups.push(Group {
                index: groups.len(),
                key: Vec::new(),
                rows: vec![row],
            });
            continue;
        }

        let components: Vec<Option<String>> =
            key.iter().map(|column| key_component(row.get(column))).collect();

        let Some(current) = groups.last_mut() else {
            let key = components.into_iter().map(Option::unwrap_or_default).collect();
            groups.push(Group {
                index: 0,
                key,
                rows: vec![row],
            });
            continue;
        };

        // Blank components continue the current group's values
        let resolved: Vec<String> = components
            .into_iter()
            .zip(current.key.iter())
            .map(|(component, inherited)| component.unwrap_or_else(|| inherited.clone()))
            .collect();

        if resolved == current.key {
            current.rows.push(row);
        } else {
            let index = groups.len();
            groups.push(Group {
                index,
                key: resolved,
                rows: vec![row],
            });
        }
    }

    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn row(line: usize, cells: &[(&str, Option<&str>)]) -> Row {
        let values: HashMap<String, Value> = cells
            .iter()
            .map(|(k, v)| {
                let value = v.map_or(Value::Null, |s| Value::String(s.to_string()));
                (k.to_string(), value)
            })
            .collect();
        Row {
            line,
            raw: Vec::new(),
            values,
        }
    }

    fn lines(group: &Group) -> Vec<usize> {
        group.rows.iter().map(|r| r.line).collect()
    }

    #[test]
    fn test_blank_keys_continue_the_group() {
        let key = vec!["doc".to_string()];
        let rows = vec![
            row(2, &[("doc", Some("INV-42")), ("product", Some("P1"))]),
            row(3, &[("doc", None), ("product", Some("P2"))]),
            row(4, &[("doc", Some("INV-43")), ("product", Some("P3"))]),
        ];

        let groups = group_rows(rows, &key);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].key, vec!["INV-42"]);
        assert_eq!(lines(&groups[0]), vec![2, 3]);
        assert_eq!(groups[1].index, 1);
        assert_eq!(lines(&groups[1]), vec![4]);
    }

    #[test]
    fn test_no_key_means_one_row_per_group() {
        let rows = vec![row(2, &[("a", Some("x"))]), row(3, &[("a", Some("x"))])];
        let groups = group_rows(rows, &[]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].label(), "line 3");
    }

    #[test]
    fn test_extra_blank_key_cells_do_not_change_grouping() {
        let key = vec!["doc".to_string(), "partner".to_string()];
        let filled = vec![
            row(2, &[("doc", Some("D1")), ("partner", Some("C1"))]),
            row(3, &[("doc", Some("D1")), ("partner", Some("C1"))]),
        ];
        let blanked = vec![
            row(2, &[("doc", Some("D1")), ("partner", Some("C1"))]),
            row(3, &[("doc", None), ("partner", None)]),
        ];

        let a = group_rows(filled, &key);
        let b = group_rows(blanked, &key);
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(lines(&a[0]), lines(&b[0]));
    }

    #[test]
    fn test_repeated_key_after_gap_is_a_new_group() {
        let key = vec!["doc".to_string()];
        let rows = vec![
            row(2, &[("doc", Some("D1"))]),
            row(3, &[("doc", Some("D2"))]),
            row(4, &[("doc", Some("D1"))]),
        ];
        let groups = group_rows(rows, &key);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2].key, vec!["D1"]);
    }
}
