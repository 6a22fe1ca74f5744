//! Field-level differences between two record states
//!
//! Used for conflict reports in restore plans and for the diff summary in
//! audit entries. Records are compared through their JSON form.

use std::collections::BTreeSet;

use serde_json::Value;

const MAX_STRING_DISPLAY: usize = 48;

/// List every changed field as `path: before -> after`.
///
/// Arrays of plain strings (group members, managed policies, emails) are
/// reported as element additions and removals instead of positional edits.
pub fn diff_values(before: &Value, after: &Value) -> Vec<String> {
    let mut changes = Vec::new();
    collect_changes(before, after, "", &mut changes);
    changes
}

/// One-line summary, `None` when nothing changed
pub fn diff_summary(before: &Value, after: &Value) -> Option<String> {
    let changes = diff_values(before, after);
    if changes.is_empty() {
        None
    } else {
        Some(changes.join(", "))
    }
}

fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", prefix, key)
    }
}

fn collect_changes(before: &Value, after: &Value, path: &str, changes: &mut Vec<String>) {
    if before == after {
        return;
    }

    match (before, after) {
        (Value::Object(b), Value::Object(a)) => {
            for (key, before_val) in b {
                let field = join_path(path, key);
                match a.get(key) {
                    Some(after_val) => collect_changes(before_val, after_val, &field, changes),
                    None => changes.push(format!("{}: {} -> (removed)", field, render(before_val))),
                }
            }
            for (key, after_val) in a {
                if !b.contains_key(key) {
                    changes.push(format!(
                        "{}: (added) -> {}",
                        join_path(path, key),
                        render(after_val)
                    ));
                }
            }
        }
        (Value::Array(b), Value::Array(a)) => match (string_set(b), string_set(a)) {
            (Some(b), Some(a)) => {
                let added: Vec<&str> = a.difference(&b).copied().collect();
                let removed: Vec<&str> = b.difference(&a).copied().collect();
                let mut parts = Vec::new();
                if !added.is_empty() {
                    parts.push(format!("+{}", added.join(" +")));
                }
                if !removed.is_empty() {
                    parts.push(format!("-{}", removed.join(" -")));
                }
                if parts.is_empty() {
                    // Same elements, different order
                    changes.push(format!("{}: reordered", path));
                } else {
                    changes.push(format!("{}: {}", path, parts.join(" ")));
                }
            }
            _ => changes.push(format!("{}: {} -> {}", path, render(before), render(after))),
        },
        _ => changes.push(format!("{}: {} -> {}", path, render(before), render(after))),
    }
}

fn string_set(values: &[Value]) -> Option<BTreeSet<&str>> {
    values.iter().map(Value::as_str).collect()
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) if s.chars().count() > MAX_STRING_DISPLAY => {
            let head: String = s.chars().take(MAX_STRING_DISPLAY - 3).collect();
            format!("\"{}...\"", head)
        }
        Value::String(s) => format!("\"{}\"", s),
        Value::Array(items) => format!("[{} items]", items.len()),
        Value::Object(fields) => format!("{{{} fields}}", fields.len()),
    }
}
