//! Fan-out expander: decides how many steps a node gets inside one task.
//!
//! `none` and `fission` groups are materialized in one go and sealed.
//! `iterate` and `loop` groups get their first member up front; every later
//! member is appended by [`advance`] once its predecessor has succeeded.

use serde_json::{json, Map, Value};
use tracing::debug;

use store::models::{Cardinality, Expansion, Id, NewStep, NodeRow, StepRow};
use store::repository::{groups, nodes, steps};
use store::Db;

use crate::payload::lookup;
use crate::EngineError;

/// Whether the cardinality can only be computed from resolved input.
pub fn needs_input(expansion: &Expansion) -> bool {
    matches!(
        expansion,
        Expansion::Fission { cardinality: Cardinality::Items(_) }
            | Expansion::Iterate { cardinality: Cardinality::Items(_) }
    )
}

/// Open one empty group per node of `dag` inside `task`.
pub fn open_groups(db: &mut Db, task: Id, dag: Id) -> Result<(), EngineError> {
    let ids: Vec<Id> = nodes::nodes_of_dag(db, dag).iter().map(|n| n.id).collect();
    for node in ids {
        groups::insert_group(db, task, node)?;
    }
    Ok(())
}

/// Size of the group and, for collection cardinality, the items themselves.
fn cardinality(
    node: &NodeRow,
    cardinality: &Cardinality,
    context: &Value,
) -> Result<(usize, Option<Vec<Value>>), EngineError> {
    match cardinality {
        Cardinality::Count(n) => Ok((*n, None)),
        Cardinality::Items(path) => match lookup(context, path) {
            Some(Value::Array(items)) => Ok((items.len(), Some(items.clone()))),
            Some(other) => Err(EngineError::UnresolvableFanout {
                node: node.name.clone(),
                reason: format!("'{path}' is {}, not an array", kind_of(other)),
            }),
            None => Err(EngineError::UnresolvableFanout {
                node: node.name.clone(),
                reason: format!("'{path}' is missing from the input"),
            }),
        },
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn seed(index: usize, item: Option<&Value>, previous: Option<&Value>) -> Value {
    let mut map = Map::new();
    map.insert("index".into(), json!(index));
    if let Some(item) = item {
        map.insert("item".into(), item.clone());
    }
    if let Some(previous) = previous {
        map.insert("previous".into(), previous.clone());
    }
    Value::Object(map)
}

fn append(db: &mut Db, task: Id, node: &NodeRow, index: usize, seed: Value) -> Result<StepRow, EngineError> {
    let title = if node.expansion == Expansion::Single {
        node.title.clone()
    } else {
        format!("{} ({index})", node.title)
    };
    let step = steps::append_step(
        db,
        NewStep {
            task,
            node: node.id,
            identifier: format!("{}-{index}", node.name),
            name: node.name.clone(),
            title,
            fission_index: index,
            input: seed,
        },
    )?;
    debug!(task, step = %step.identifier, "step materialized");
    Ok(step)
}

/// Materialize the initial members of the (task, node) group.
///
/// `context` is only consulted for collection cardinality. Returns the
/// number of steps created.
pub fn expand(db: &mut Db, task: Id, node: &NodeRow, context: &Value) -> Result<usize, EngineError> {
    match &node.expansion {
        Expansion::Single => {
            append(db, task, node, 0, Value::Null)?;
            groups::seal_group(db, task, node.id)?;
            Ok(1)
        }
        Expansion::Fission { cardinality: c } => {
            let (n, items) = cardinality(node, c, context)?;
            for i in 0..n {
                let item = items.as_ref().and_then(|items| items.get(i));
                append(db, task, node, i, seed(i, item, None))?;
            }
            groups::seal_group(db, task, node.id)?;
            Ok(n)
        }
        Expansion::Iterate { cardinality: c } => {
            let (n, items) = cardinality(node, c, context)?;
            if n > 0 {
                let item = items.as_ref().and_then(|items| items.first());
                append(db, task, node, 0, seed(0, item, None))?;
            }
            if n <= 1 {
                groups::seal_group(db, task, node.id)?;
            }
            Ok(n.min(1))
        }
        Expansion::Loop { max_iterations, .. } => {
            append(db, task, node, 0, seed(0, None, None))?;
            if *max_iterations <= 1 {
                groups::seal_group(db, task, node.id)?;
            }
            Ok(1)
        }
    }
}

/// Called after a sequential member succeeded: append the next member or
/// seal the group. Returns the appended step, if any.
pub fn advance(db: &mut Db, finished: &StepRow, context: &Value) -> Result<Option<StepRow>, EngineError> {
    let node = nodes::get_node(db, finished.node)?.clone();
    let group = groups::get_group(db, finished.task, node.id)?;
    if group.sealed {
        return Ok(None);
    }
    let next = group.steps.len();

    let appended = match &node.expansion {
        Expansion::Iterate { cardinality: c } => {
            let (n, items) = cardinality(&node, c, context)?;
            if next < n {
                let item = items.as_ref().and_then(|items| items.get(next));
                let step = append(db, finished.task, &node, next, seed(next, item, Some(&finished.output)))?;
                if next + 1 >= n {
                    groups::seal_group(db, finished.task, node.id)?;
                }
                Some(step)
            } else {
                None
            }
        }
        Expansion::Loop { max_iterations, until } => {
            let done = until
                .as_ref()
                .is_some_and(|cond| lookup(&finished.output, &cond.field) == Some(&cond.equals));
            if !done && next < *max_iterations {
                let step = append(db, finished.task, &node, next, seed(next, None, Some(&finished.output)))?;
                if next + 1 >= *max_iterations {
                    groups::seal_group(db, finished.task, node.id)?;
                }
                Some(step)
            } else {
                None
            }
        }
        Expansion::Single | Expansion::Fission { .. } => None,
    };

    if appended.is_none() {
        groups::seal_group(db, finished.task, node.id)?;
    }
    Ok(appended)
}

/// A sequential group stops growing once one of its members did not succeed.
pub fn stop(db: &mut Db, step: &StepRow) -> Result<(), EngineError> {
    groups::seal_group(db, step.task, step.node)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use store::models::{LoopCondition, NewDag, NewNode, NewTask, State};
    use store::repository::{dags, tasks};
    use store::Store;

    fn setup(db: &mut Db, expansion: Expansion) -> (Id, NodeRow) {
        let dag = dags::insert_version(
            db,
            NewDag { name: "build".into(), title: "Build".into(), parent: None, timeout_ms: None },
        );
        let node = nodes::insert_node(
            db,
            NewNode {
                dag: dag.id,
                name: "build".into(),
                title: "Build".into(),
                target: None,
                expansion,
                input_adapter: BTreeMap::new(),
                output_adapter: BTreeMap::new(),
                timeout_ms: None,
            },
        )
        .unwrap();
        let task = tasks::insert_task(
            db,
            NewTask { dag: dag.id, name: "build".into(), title: "Build".into(), parent: None, input: json!({}) },
        )
        .unwrap();
        open_groups(db, task.id, dag.id).unwrap();
        (task.id, node)
    }

    fn succeed(db: &mut Db, step: Id, output: Value) -> StepRow {
        let row = steps::get_step_mut(db, step).unwrap();
        row.state = State::Success;
        row.output = output;
        row.clone()
    }

    #[test]
    fn single_node_gets_one_step() {
        Store::open().write(|db| {
            let (task, node) = setup(db, Expansion::Single);
            assert_eq!(expand(db, task, &node, &Value::Null).unwrap(), 1);
            let members = steps::group_steps(db, task, node.id);
            assert_eq!(members[0].identifier, "build-0");
            assert_eq!(members[0].title, "Build");
            assert_eq!((members[0].fission_index, members[0].fission_count), (0, 1));
            assert!(groups::get_group(db, task, node.id).unwrap().sealed);
        });
    }

    #[test]
    fn fission_from_collection() {
        Store::open().write(|db| {
            let fission = Expansion::Fission { cardinality: Cardinality::Items("targets".into()) };
            let (task, node) = setup(db, fission);
            let ctx = json!({ "targets": ["x86", "arm", "riscv"] });
            assert_eq!(expand(db, task, &node, &ctx).unwrap(), 3);

            let members = steps::group_steps(db, task, node.id);
            let ids: Vec<_> = members.iter().map(|s| s.identifier.as_str()).collect();
            assert_eq!(ids, vec!["build-0", "build-1", "build-2"]);
            assert!(members.iter().all(|s| s.fission_count == 3));
            assert_eq!(members[1].input, json!({ "index": 1, "item": "arm" }));
            assert_eq!(members[2].title, "Build (2)");
        });
    }

    #[test]
    fn empty_fission_is_sealed_without_steps() {
        Store::open().write(|db| {
            let (task, node) = setup(db, Expansion::Fission { cardinality: Cardinality::Count(0) });
            assert_eq!(expand(db, task, &node, &Value::Null).unwrap(), 0);
            let group = groups::get_group(db, task, node.id).unwrap();
            assert!(group.sealed && group.steps.is_empty());
        });
    }

    #[test]
    fn missing_collection_is_unresolvable() {
        Store::open().write(|db| {
            let fission = Expansion::Fission { cardinality: Cardinality::Items("targets".into()) };
            let (task, node) = setup(db, fission);
            let err = expand(db, task, &node, &json!({ "targets": "x86" })).unwrap_err();
            assert_eq!(
                err,
                EngineError::UnresolvableFanout {
                    node: "build".into(),
                    reason: "'targets' is a string, not an array".into()
                }
            );
            assert!(matches!(
                expand(db, task, &node, &json!({})),
                Err(EngineError::UnresolvableFanout { .. })
            ));
            assert!(steps::group_steps(db, task, node.id).is_empty());
        });
    }

    #[test]
    fn iterate_appends_one_member_at_a_time() {
        Store::open().write(|db| {
            let (task, node) = setup(db, Expansion::Iterate { cardinality: Cardinality::Count(3) });
            expand(db, task, &node, &Value::Null).unwrap();
            assert_eq!(steps::group_steps(db, task, node.id).len(), 1);

            let first = steps::group_steps(db, task, node.id)[0].id;
            let done = succeed(db, first, json!({ "n": 1 }));
            let second = advance(db, &done, &Value::Null).unwrap().expect("second member");
            assert_eq!(second.input, json!({ "index": 1, "previous": { "n": 1 } }));
            assert!(!groups::get_group(db, task, node.id).unwrap().sealed);

            let done = succeed(db, second.id, json!({ "n": 2 }));
            advance(db, &done, &Value::Null).unwrap().expect("third member");
            assert!(groups::get_group(db, task, node.id).unwrap().sealed);
            assert!(steps::group_steps(db, task, node.id).iter().all(|s| s.fission_count == 3));
        });
    }

    #[test]
    fn loop_stops_when_condition_holds() {
        Store::open().write(|db| {
            let looping = Expansion::Loop {
                max_iterations: 10,
                until: Some(LoopCondition { field: "status".into(), equals: json!("ready") }),
            };
            let (task, node) = setup(db, looping);
            expand(db, task, &node, &Value::Null).unwrap();

            let first = steps::group_steps(db, task, node.id)[0].id;
            let done = succeed(db, first, json!({ "status": "waiting" }));
            let second = advance(db, &done, &Value::Null).unwrap().expect("keeps polling");

            let done = succeed(db, second.id, json!({ "status": "ready" }));
            assert!(advance(db, &done, &Value::Null).unwrap().is_none());
            let group = groups::get_group(db, task, node.id).unwrap();
            assert!(group.sealed);
            assert_eq!(group.steps.len(), 2);
        });
    }

    #[test]
    fn loop_respects_max_iterations() {
        Store::open().write(|db| {
            let (task, node) = setup(db, Expansion::Loop { max_iterations: 2, until: None });
            expand(db, task, &node, &Value::Null).unwrap();
            let first = steps::group_steps(db, task, node.id)[0].id;
            let done = succeed(db, first, json!(1));
            advance(db, &done, &Value::Null).unwrap().expect("second member");
            assert!(groups::get_group(db, task, node.id).unwrap().sealed);
        });
    }
}
