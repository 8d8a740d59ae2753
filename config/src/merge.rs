//! Config merge rules.
//!
//! All merging is expressed as `merge(winner, loser)`: the winner's values
//! survive conflicts. Preset folding uses the already-accumulated document
//! as the winner, so the project's own keys always beat its presets.
//!
//! Two paths get list-aware treatment instead of plain replacement:
//! handler lists concatenate loser-then-winner (so preset handlers run
//! before project handlers) with name dedup where the later declaration
//! wins, and preset lists union by source. Merging the same document twice
//! yields the same result, which is what makes cyclic preset graphs safe
//! to resolve with a processed-set.

use toml::{Table, Value};

const HANDLERS_PATH: [&str; 5] = ["tool", "burnish", "action", "*", "handlers"];
const PRESETS_PATH: [&str; 3] = ["tool", "burnish", "presets"];

/// Merge `loser` underneath `winner`.
#[must_use]
pub fn merge_tables(winner: &Table, loser: &Table) -> Table {
    merge_table_at(&mut Vec::new(), winner, loser)
}

/// Built-in base configuration merged underneath every project: the
/// dependency-light housekeeping actions every enabled project gets for
/// free. User declarations under the same action names win.
#[must_use]
pub fn base_config() -> Table {
    const BASE: &str = r#"
[tool.burnish.action.prepare_envs]
source = "burnish.action.prepare_envs"
handlers = [
    { name = "prepare_envs", source = "burnish.env.prepare", env = "dev_workspace" },
]

[tool.burnish.action.dump_config]
source = "burnish.action.dump_config"
handlers = [
    { name = "dump_config", source = "burnish.config.dump", env = "dev_workspace" },
]

[tool.burnish.action.list_files_by_lang]
source = "burnish.action.list_files_by_lang"
handlers = [
    { name = "by_extension", source = "burnish.classify.by_extension", env = "dev_workspace" },
]
"#;
    toml::from_str(BASE).expect("built-in base config parses")
}

fn merge_table_at(path: &mut Vec<String>, winner: &Table, loser: &Table) -> Table {
    let mut merged = Table::new();
    for (key, loser_value) in loser {
        if !winner.contains_key(key) {
            merged.insert(key.clone(), loser_value.clone());
        }
    }
    for (key, winner_value) in winner {
        let value = match loser.get(key) {
            Some(loser_value) => {
                path.push(key.clone());
                let merged_value = merge_value_at(path, winner_value, loser_value);
                path.pop();
                merged_value
            }
            None => winner_value.clone(),
        };
        merged.insert(key.clone(), value);
    }
    merged
}

fn merge_value_at(path: &mut Vec<String>, winner: &Value, loser: &Value) -> Value {
    match (winner, loser) {
        (Value::Table(w), Value::Table(l)) => Value::Table(merge_table_at(path, w, l)),
        (Value::Array(w), Value::Array(l)) if path_matches(path, &HANDLERS_PATH) => {
            Value::Array(merge_named_list(w, l, "name"))
        }
        (Value::Array(w), Value::Array(l)) if path_matches(path, &PRESETS_PATH) => {
            Value::Array(merge_named_list(w, l, "source"))
        }
        _ => winner.clone(),
    }
}

fn path_matches(path: &[String], pattern: &[&str]) -> bool {
    path.len() == pattern.len()
        && path
            .iter()
            .zip(pattern)
            .all(|(seg, pat)| *pat == "*" || seg == pat)
}

/// Concatenate loser-then-winner, collapsing entries that share the value
/// of `key_field`: the earliest occurrence keeps its position, the latest
/// occurrence supplies the value.
fn merge_named_list(winner: &[Value], loser: &[Value], key_field: &str) -> Vec<Value> {
    let mut merged: Vec<Value> = Vec::with_capacity(winner.len() + loser.len());
    for entry in loser.iter().chain(winner) {
        let key = entry.get(key_field).and_then(Value::as_str);
        let existing = key.and_then(|k| {
            merged
                .iter()
                .position(|m| m.get(key_field).and_then(Value::as_str) == Some(k))
        });
        match existing {
            Some(index) => merged[index] = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}
