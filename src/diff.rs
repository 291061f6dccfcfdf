//! Parameter and template diffing for the diff action and change previews.

use std::collections::BTreeMap;
use std::fmt;

/// Disposition of one key across old and new dictionaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    Unmodified,
}

/// One key's old and new values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictChange {
    pub key: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl DictChange {
    pub fn kind(&self) -> ChangeKind {
        match (&self.old, &self.new) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Removed,
            (Some(old), Some(new)) if old != new => ChangeKind::Modified,
            _ => ChangeKind::Unmodified,
        }
    }
}

impl fmt::Display for DictChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ChangeKind::Unmodified => {
                write!(f, " {} = {}", self.key, self.old.as_deref().unwrap_or(""))
            }
            ChangeKind::Added => {
                write!(f, "+{} = {}", self.key, self.new.as_deref().unwrap_or(""))
            }
            ChangeKind::Removed => {
                write!(f, "-{} = {}", self.key, self.old.as_deref().unwrap_or(""))
            }
            ChangeKind::Modified => {
                writeln!(f, "-{} = {}", self.key, self.old.as_deref().unwrap_or(""))?;
                write!(f, "+{} = {}", self.key, self.new.as_deref().unwrap_or(""))
            }
        }
    }
}

/// Diff two flat dictionaries, returning the change count and the full
/// (sorted) change list including unmodified entries.
pub fn diff_dictionaries(
    old: &BTreeMap<String, String>,
    new: &BTreeMap<String, String>,
) -> (usize, Vec<DictChange>) {
    let mut changes = Vec::new();
    let mut changed = 0usize;

    for (key, value) in new {
        if !old.contains_key(key) {
            changed += 1;
            changes.push(DictChange {
                key: key.clone(),
                old: None,
                new: Some(value.clone()),
            });
        }
    }
    for (key, value) in old {
        match new.get(key) {
            None => {
                changed += 1;
                changes.push(DictChange {
                    key: key.clone(),
                    old: Some(value.clone()),
                    new: None,
                });
            }
            Some(new_value) => {
                if value != new_value {
                    changed += 1;
                }
                changes.push(DictChange {
                    key: key.clone(),
                    old: Some(value.clone()),
                    new: Some(new_value.clone()),
                });
            }
        }
    }

    changes.sort_by(|a, b| a.key.cmp(&b.key));
    (changed, changes)
}

/// Render a parameter diff block, or None when nothing changed.
pub fn format_params_diff(changes: &[DictChange]) -> Option<String> {
    if changes.iter().all(|c| c.kind() == ChangeKind::Unmodified) {
        return None;
    }
    let mut out = String::from("--- Old Parameters\n+++ New Parameters\n******************\n");
    for change in changes {
        out.push_str(&change.to_string());
        out.push('\n');
    }
    Some(out)
}

/// Machine-readable form for event detail payloads.
pub fn params_diff_detail(changes: &[DictChange]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = changes
        .iter()
        .filter(|c| c.kind() != ChangeKind::Unmodified)
        .map(|c| {
            serde_json::json!({
                "key": c.key,
                "kind": format!("{:?}", c.kind()).to_lowercase(),
                "old": c.old,
                "new": c.new,
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

/// Whether two template bodies differ, by content digest.
pub fn templates_differ(old_body: &str, new_body: &str) -> bool {
    blake3::hash(old_body.as_bytes()) != blake3::hash(new_body.as_bytes())
}
