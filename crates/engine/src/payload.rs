//! Payload flow between entities.
//!
//! A task's context is its parent's context plus the outputs of its runtime
//! prerequisites; a step's context is its task's context plus the outputs of
//! its prerequisites plus its fan-out seed. Adapters reshape what goes into
//! and comes out of an action.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use store::models::{Expansion, Id, NodeRow, RuntimeRef};
use store::repository::{edges, nodes, steps, tasks};
use store::Db;

use crate::EngineError;

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Follow a dotted path (`a.b.0.c`) into `value`. An empty path is `value`.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Shallow merge: keys of `source` overwrite keys of `target`.
///
/// A non-object `source` is stored under `name` instead; `null` adds nothing.
pub fn merge(target: &mut Value, name: &str, source: &Value) {
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Value::Object(target) = target else { return };
    match source {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                target.insert(k.clone(), v.clone());
            }
        }
        other => {
            target.insert(name.to_owned(), other.clone());
        }
    }
}

/// Build an object by resolving each adapter path against `source`.
///
/// An empty adapter passes `source` through unchanged; a path that does not
/// resolve yields `null`.
pub fn adapt(adapter: &BTreeMap<String, String>, source: &Value) -> Value {
    if adapter.is_empty() {
        return source.clone();
    }
    let shaped: Map<String, Value> = adapter
        .iter()
        .map(|(key, path)| (key.clone(), lookup(source, path).cloned().unwrap_or(Value::Null)))
        .collect();
    Value::Object(shaped)
}

// ---------------------------------------------------------------------------
// Contexts
// ---------------------------------------------------------------------------

/// Merge the output of one prerequisite into `context`.
///
/// Members of a fan-out group are gathered into an array under the node name.
fn contribute(
    db: &Db,
    context: &mut Value,
    prerequisite: RuntimeRef,
    gathered: &mut BTreeSet<Id>,
) -> Result<(), EngineError> {
    match prerequisite {
        RuntimeRef::Task(id) => {
            let task = tasks::get_task(db, id)?;
            merge(context, &task.name, &task.output);
        }
        RuntimeRef::Step(id) => {
            let step = steps::get_step(db, id)?;
            let node = nodes::get_node(db, step.node)?;
            if node.expansion == Expansion::Single {
                merge(context, &node.name, &step.output);
            } else if gathered.insert(node.id) {
                let outputs: Vec<Value> = steps::group_steps(db, step.task, step.node)
                    .into_iter()
                    .map(|s| s.output.clone())
                    .collect();
                merge(context, &node.name, &Value::Array(outputs));
            }
        }
    }
    Ok(())
}

/// Merge the outputs of `prerequisites` on top of `base`.
pub fn gather(db: &Db, base: &Value, prerequisites: &[RuntimeRef]) -> Result<Value, EngineError> {
    let mut context = match base {
        Value::Object(_) => base.clone(),
        Value::Null => Value::Object(Map::new()),
        other => {
            let mut map = Map::new();
            map.insert("input".into(), other.clone());
            Value::Object(map)
        }
    };
    let mut gathered = BTreeSet::new();
    for prerequisite in prerequisites {
        contribute(db, &mut context, *prerequisite, &mut gathered)?;
    }
    Ok(context)
}

/// Context of a sub-task about to start.
pub fn task_context(db: &Db, task: Id) -> Result<Value, EngineError> {
    let row = tasks::get_task(db, task)?;
    let base = match row.parent {
        Some(parent) => tasks::get_task(db, parent)?.context.clone(),
        None => row.input.clone(),
    };
    let prerequisites = edges::runtime_prerequisites(db, row.root, RuntimeRef::Task(task));
    gather(db, &base, &prerequisites)
}

/// Context of a step about to start: task context, prerequisite outputs, then
/// the step's own seed (`index`, `item`, `previous`).
pub fn step_context(db: &Db, step: Id) -> Result<Value, EngineError> {
    let row = steps::get_step(db, step)?;
    let task = tasks::get_task(db, row.task)?;
    let siblings: Vec<Id> = steps::group_steps(db, row.task, row.node).iter().map(|s| s.id).collect();
    // Earlier members of a sequential group reach the step through `previous`.
    let prerequisites: Vec<RuntimeRef> = edges::runtime_prerequisites(db, row.root, RuntimeRef::Step(step))
        .into_iter()
        .filter(|p| !matches!(p, RuntimeRef::Step(id) if siblings.contains(id)))
        .collect();

    let mut context = gather(db, &task.context, &prerequisites)?;
    if row.input.is_object() {
        merge(&mut context, "seed", &row.input);
    }
    Ok(context)
}

/// Context a node's group is expanded against: task context plus the
/// outputs of every step and sub-task the node depends on.
pub fn node_context(db: &Db, task: Id, prerequisites: &[RuntimeRef]) -> Result<Value, EngineError> {
    let row = tasks::get_task(db, task)?;
    gather(db, &row.context, prerequisites)
}

/// Action input for a node given its resolved context.
pub fn action_input(node: &NodeRow, context: &Value) -> Value {
    adapt(&node.input_adapter, context)
}

/// Step output after the node's output adapter.
pub fn action_output(node: &NodeRow, raw: &Value) -> Value {
    adapt(&node.output_adapter, raw)
}

/// Merge of the outputs of `children` nobody else in the tree depends on.
pub fn sink_output(db: &Db, root: Id, children: &[RuntimeRef]) -> Result<Value, EngineError> {
    let sinks: Vec<RuntimeRef> = children
        .iter()
        .copied()
        .filter(|c| !edges::has_runtime_dependents(db, root, *c))
        .collect();
    gather(db, &Value::Null, &sinks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lookup_follows_objects_and_arrays() {
        let v = json!({ "build": { "targets": ["x86", "arm"] } });
        assert_eq!(lookup(&v, "build.targets.1"), Some(&json!("arm")));
        assert_eq!(lookup(&v, ""), Some(&v));
        assert_eq!(lookup(&v, "build.missing"), None);
        assert_eq!(lookup(&v, "build.targets.x"), None);
    }

    #[test]
    fn merge_overwrites_keys_and_wraps_scalars() {
        let mut ctx = json!({ "a": 1, "b": 1 });
        merge(&mut ctx, "fetch", &json!({ "b": 2, "c": 3 }));
        merge(&mut ctx, "count", &json!(7));
        merge(&mut ctx, "nothing", &Value::Null);
        assert_eq!(ctx, json!({ "a": 1, "b": 2, "c": 3, "count": 7 }));
    }

    #[test]
    fn adapter_picks_paths() {
        let adapter: BTreeMap<String, String> =
            [("code".to_string(), "script.body".to_string()), ("gone".to_string(), "nope".to_string())]
                .into();
        let shaped = adapt(&adapter, &json!({ "script": { "body": "echo hi" } }));
        assert_eq!(shaped, json!({ "code": "echo hi", "gone": null }));
        assert_eq!(adapt(&BTreeMap::new(), &json!([1])), json!([1]));
    }

    #[test]
    fn scalar_base_is_wrapped() {
        let db = Db::default();
        assert_eq!(gather(&db, &json!("raw"), &[]).unwrap(), json!({ "input": "raw" }));
        assert_eq!(gather(&db, &Value::Null, &[]).unwrap(), json!({}));
    }
}
