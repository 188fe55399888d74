//! Dependency resolver: turns template edges into runtime edges.
//!
//! For a step of node `B` inside task `T`:
//! - `B` after node `A`, barrier join: every member of group (T, A).
//! - `B` after node `A`, zip join: member `i` of (T, A) for step `i`; once
//!   (T, A) is sealed without such a member, every member.
//! - `B` after sub-dag `D`, or `B` backed by `D`: the sub-task of `T`
//!   instantiated from `D`.
//! - a later member of a sequential group: the member before it.
//!
//! Sub-tasks follow the same rules against their parent task's children.
//! A prerequisite group that is not sealed yet leaves the resolution
//! incomplete; the entity waits. Resolving twice yields the same edges.

use std::collections::BTreeSet;

use store::models::{
    Id, JoinPolicy, NodeRow, NodeTarget, RuntimeRef, State, StepRow, TaskRow, TemplateRef,
};
use store::repository::{dags, edges, groups, nodes, steps, tasks};
use store::Db;

use crate::EngineError;

/// Whether an entity may leave `PENDING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Every prerequisite succeeded.
    Ready,
    /// Some prerequisite is not finished or not materialized yet.
    Waiting,
    /// Some prerequisite failed or was revoked; this will never become ready.
    Blocked,
}

/// The prerequisite set of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub prerequisites: BTreeSet<RuntimeRef>,
    /// No prerequisite group can still grow.
    pub complete: bool,
    /// Some prerequisite group failed to expand.
    pub blocked: bool,
}

impl Resolution {
    fn new() -> Self {
        Self { prerequisites: BTreeSet::new(), complete: true, blocked: false }
    }

    fn barrier(&mut self, db: &Db, task: Id, node: Id) -> Result<(), EngineError> {
        let group = groups::get_group(db, task, node)?;
        self.prerequisites.extend(group.steps.iter().map(|id| RuntimeRef::Step(*id)));
        self.complete &= group.sealed;
        self.blocked |= group.failed;
        Ok(())
    }

    fn zip(&mut self, db: &Db, task: Id, node: Id, index: usize) -> Result<(), EngineError> {
        let group = groups::get_group(db, task, node)?;
        match group.steps.get(index) {
            Some(id) => {
                self.prerequisites.insert(RuntimeRef::Step(*id));
            }
            None if group.sealed => self.barrier(db, task, node)?,
            None => self.complete = false,
        }
        Ok(())
    }

    fn sub_task(&mut self, db: &Db, parent: Id, dag: Id) {
        match tasks::find_sub_task(db, parent, dag) {
            Some(sub) => {
                self.prerequisites.insert(RuntimeRef::Task(sub.id));
            }
            None => self.complete = false,
        }
    }

    pub fn prerequisites(&self) -> Vec<RuntimeRef> {
        self.prerequisites.iter().copied().collect()
    }

    /// Evaluate against the current prerequisite states.
    pub fn readiness(&self, db: &Db) -> Result<Readiness, EngineError> {
        if self.blocked {
            return Ok(Readiness::Blocked);
        }
        let mut all_success = self.complete;
        for prerequisite in &self.prerequisites {
            match state_of(db, *prerequisite)? {
                State::Error | State::Revoked => return Ok(Readiness::Blocked),
                State::Success => {}
                State::Pending | State::Processing => all_success = false,
            }
        }
        Ok(if all_success { Readiness::Ready } else { Readiness::Waiting })
    }
}

pub fn state_of(db: &Db, entity: RuntimeRef) -> Result<State, EngineError> {
    Ok(match entity {
        RuntimeRef::Step(id) => steps::get_step(db, id)?.state,
        RuntimeRef::Task(id) => tasks::get_task(db, id)?.state,
    })
}

fn template_root(db: &Db, task: &TaskRow) -> Result<Id, EngineError> {
    Ok(dags::get_dag(db, task.dag)?.root)
}

/// Prerequisites of `node` inside `task`.
///
/// `member` is the fan-out index of the step being resolved; `None` resolves
/// for the group as a whole (barrier on everything).
pub fn resolve_node(
    db: &Db,
    task: &TaskRow,
    node: &NodeRow,
    member: Option<usize>,
) -> Result<Resolution, EngineError> {
    let root_dag = template_root(db, task)?;
    let mut resolution = Resolution::new();

    for edge in edges::template_prerequisites(db, root_dag, TemplateRef::Node(node.id)) {
        match (edge.prerequisite, edge.join, member) {
            (TemplateRef::Node(prereq), JoinPolicy::Zip, Some(index)) => {
                resolution.zip(db, task.id, prereq, index)?
            }
            (TemplateRef::Node(prereq), _, _) => resolution.barrier(db, task.id, prereq)?,
            (TemplateRef::Dag(dag), _, _) => resolution.sub_task(db, task.id, dag),
        }
    }

    if let Some(NodeTarget::SubDag { dag }) = node.target {
        resolution.sub_task(db, task.id, dag);
    }

    if let Some(index) = member.filter(|i| *i > 0 && node.expansion.is_sequential()) {
        let group = groups::get_group(db, task.id, node.id)?;
        if let Some(previous) = group.steps.get(index - 1) {
            resolution.prerequisites.insert(RuntimeRef::Step(*previous));
        }
    }

    Ok(resolution)
}

/// Prerequisites of a step.
pub fn resolve_step(db: &Db, step: &StepRow) -> Result<Resolution, EngineError> {
    let task = tasks::get_task(db, step.task)?;
    let node = nodes::get_node(db, step.node)?;
    resolve_node(db, task, node, Some(step.fission_index))
}

/// Prerequisites of a task: none for a root, sibling edges for a sub-task.
pub fn resolve_task(db: &Db, task: &TaskRow) -> Result<Resolution, EngineError> {
    let mut resolution = Resolution::new();
    let Some(parent) = task.parent else {
        return Ok(resolution);
    };

    let root_dag = template_root(db, task)?;
    for edge in edges::template_prerequisites(db, root_dag, TemplateRef::Dag(task.dag)) {
        match edge.prerequisite {
            // A task has no fan-out index to zip on.
            TemplateRef::Node(node) => resolution.barrier(db, parent, node)?,
            TemplateRef::Dag(dag) => resolution.sub_task(db, parent, dag),
        }
    }
    Ok(resolution)
}

/// Recompute and store the runtime edges of every entity under `root`.
pub fn refresh(db: &mut Db, root: Id) -> Result<(), EngineError> {
    for task_id in tasks::subtree(db, root) {
        let task = tasks::get_task(db, task_id)?.clone();
        let resolution = resolve_task(db, &task)?;
        edges::replace_runtime_prerequisites(db, root, RuntimeRef::Task(task_id), resolution.prerequisites);

        let step_rows: Vec<StepRow> = steps::steps_of_task(db, task_id).into_iter().cloned().collect();
        for step in step_rows {
            let resolution = resolve_step(db, &step)?;
            edges::replace_runtime_prerequisites(db, root, RuntimeRef::Step(step.id), resolution.prerequisites);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout;
    use std::collections::BTreeMap;
    use serde_json::{json, Value};
    use store::models::{Cardinality, Expansion, NewDag, NewNode, NewTask, TemplateEdge};
    use store::Store;

    struct Fixture {
        dag: Id,
        task: Id,
    }

    impl Fixture {
        fn new(db: &mut Db) -> Self {
            let dag = dags::insert_version(
                db,
                NewDag { name: "build".into(), title: String::new(), parent: None, timeout_ms: None },
            )
            .id;
            let task = tasks::insert_task(
                db,
                NewTask { dag, name: "build".into(), title: String::new(), parent: None, input: json!({}) },
            )
            .unwrap()
            .id;
            Self { dag, task }
        }

        fn node(&self, db: &mut Db, name: &str, expansion: Expansion) -> NodeRow {
            let node = nodes::insert_node(
                db,
                NewNode {
                    dag: self.dag,
                    name: name.into(),
                    title: name.into(),
                    target: None,
                    expansion,
                    input_adapter: BTreeMap::new(),
                    output_adapter: BTreeMap::new(),
                    timeout_ms: None,
                },
            )
            .unwrap();
            groups::insert_group(db, self.task, node.id).unwrap();
            node
        }

        fn edge(&self, db: &mut Db, dependent: &NodeRow, prerequisite: &NodeRow, join: JoinPolicy) {
            edges::insert_template_edge(
                db,
                self.dag,
                TemplateEdge {
                    dependent: TemplateRef::Node(dependent.id),
                    prerequisite: TemplateRef::Node(prerequisite.id),
                    join,
                },
            );
        }

        fn members(&self, db: &Db, node: &NodeRow) -> Vec<StepRow> {
            steps::group_steps(db, self.task, node.id).into_iter().cloned().collect()
        }
    }

    fn set_state(db: &mut Db, step: Id, state: State) {
        steps::get_step_mut(db, step).unwrap().state = state;
    }

    #[test]
    fn barrier_join_depends_on_every_member() {
        Store::open().write(|db| {
            let f = Fixture::new(db);
            let build = f.node(db, "build", Expansion::Fission { cardinality: Cardinality::Count(3) });
            let publish = f.node(db, "publish", Expansion::Single);
            f.edge(db, &publish, &build, JoinPolicy::Barrier);
            fanout::expand(db, f.task, &build, &Value::Null).unwrap();
            fanout::expand(db, f.task, &publish, &Value::Null).unwrap();

            let publish_step = f.members(db, &publish)[0].clone();
            let resolution = resolve_step(db, &publish_step).unwrap();
            let expected: BTreeSet<_> =
                f.members(db, &build).iter().map(|s| RuntimeRef::Step(s.id)).collect();
            assert_eq!(resolution.prerequisites, expected);
            assert_eq!(resolution.readiness(db).unwrap(), Readiness::Waiting);

            for s in f.members(db, &build) {
                set_state(db, s.id, State::Success);
            }
            assert_eq!(resolution.readiness(db).unwrap(), Readiness::Ready);
        });
    }

    #[test]
    fn zip_join_pairs_members_by_index() {
        Store::open().write(|db| {
            let f = Fixture::new(db);
            let fission = Expansion::Fission { cardinality: Cardinality::Count(2) };
            let compile = f.node(db, "compile", fission.clone());
            let test = f.node(db, "test", fission);
            f.edge(db, &test, &compile, JoinPolicy::Zip);
            fanout::expand(db, f.task, &compile, &Value::Null).unwrap();
            fanout::expand(db, f.task, &test, &Value::Null).unwrap();

            let compiled = f.members(db, &compile);
            for (i, step) in f.members(db, &test).iter().enumerate() {
                let resolution = resolve_step(db, step).unwrap();
                assert_eq!(resolution.prerequisites(), vec![RuntimeRef::Step(compiled[i].id)]);
            }

            set_state(db, compiled[0].id, State::Success);
            let tests = f.members(db, &test);
            assert_eq!(resolve_step(db, &tests[0]).unwrap().readiness(db).unwrap(), Readiness::Ready);
            assert_eq!(resolve_step(db, &tests[1]).unwrap().readiness(db).unwrap(), Readiness::Waiting);
        });
    }

    #[test]
    fn unsealed_prerequisite_keeps_waiting() {
        Store::open().write(|db| {
            let f = Fixture::new(db);
            let poll = f.node(db, "poll", Expansion::Loop { max_iterations: 5, until: None });
            let report = f.node(db, "report", Expansion::Single);
            f.edge(db, &report, &poll, JoinPolicy::Barrier);
            fanout::expand(db, f.task, &poll, &Value::Null).unwrap();
            fanout::expand(db, f.task, &report, &Value::Null).unwrap();

            set_state(db, f.members(db, &poll)[0].id, State::Success);
            let report_step = f.members(db, &report)[0].clone();
            let resolution = resolve_step(db, &report_step).unwrap();
            assert!(!resolution.complete);
            assert_eq!(resolution.readiness(db).unwrap(), Readiness::Waiting);
        });
    }

    #[test]
    fn failed_prerequisite_blocks() {
        Store::open().write(|db| {
            let f = Fixture::new(db);
            let extract = f.node(db, "extract", Expansion::Single);
            let load = f.node(db, "load", Expansion::Single);
            f.edge(db, &load, &extract, JoinPolicy::Barrier);
            fanout::expand(db, f.task, &extract, &Value::Null).unwrap();
            fanout::expand(db, f.task, &load, &Value::Null).unwrap();

            set_state(db, f.members(db, &extract)[0].id, State::Error);
            let load_step = f.members(db, &load)[0].clone();
            assert_eq!(resolve_step(db, &load_step).unwrap().readiness(db).unwrap(), Readiness::Blocked);
        });
    }

    #[test]
    fn refresh_is_idempotent() {
        Store::open().write(|db| {
            let f = Fixture::new(db);
            let build = f.node(db, "build", Expansion::Fission { cardinality: Cardinality::Count(3) });
            let publish = f.node(db, "publish", Expansion::Fission { cardinality: Cardinality::Count(2) });
            f.edge(db, &publish, &build, JoinPolicy::Barrier);
            fanout::expand(db, f.task, &build, &Value::Null).unwrap();
            fanout::expand(db, f.task, &publish, &Value::Null).unwrap();

            refresh(db, f.task).unwrap();
            assert_eq!(edges::runtime_edge_count(db, f.task), 6);
            refresh(db, f.task).unwrap();
            assert_eq!(edges::runtime_edge_count(db, f.task), 6);
        });
    }
}
