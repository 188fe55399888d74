//! Graph assembler: nested presentation views of a dag or task tree.
//!
//! Each level emits its own nodes (steps) first, then one entry per sub-dag
//! (sub-task) carrying its recursively assembled components. Every entity is
//! emitted exactly once, under its own parent. Identifiers follow the
//! `<kind>-<id>` form.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use actions::ActionKind;
use store::models::{
    DagRow, Expansion, Id, NodeRow, NodeTarget, RuntimeRef, State, StepRow, TaskRow, TemplateRef,
};
use store::repository::{actions as action_repo, dags, edges, nodes, steps, tasks};
use store::Db;

use crate::EngineError;

/// One entry of an assembled view.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Component {
    Node(NodeComponent),
    Dag(DagComponent),
    Step(StepComponent),
    Task(TaskComponent),
}

impl Component {
    pub fn identifier(&self) -> &str {
        match self {
            Self::Node(c) => &c.identifier,
            Self::Dag(c) => &c.identifier,
            Self::Step(c) => &c.identifier,
            Self::Task(c) => &c.identifier,
        }
    }

    /// This entity plus everything nested under it.
    pub fn count(&self) -> usize {
        match self {
            Self::Node(_) | Self::Step(_) => 1,
            Self::Dag(c) => 1 + c.components.iter().map(Component::count).sum::<usize>(),
            Self::Task(c) => 1 + c.components.iter().map(Component::count).sum::<usize>(),
        }
    }

    /// Pre-order list of every identifier in the view.
    pub fn identifiers(&self) -> Vec<String> {
        let mut out = vec![self.identifier().to_owned()];
        let nested: &[Component] = match self {
            Self::Dag(c) => c.components.as_slice(),
            Self::Task(c) => c.components.as_slice(),
            Self::Node(_) | Self::Step(_) => &[],
        };
        for child in nested {
            out.extend(child.identifiers());
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeComponent {
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub action: Option<String>,
    pub action_kind: Option<ActionKind>,
    pub expansion: Expansion,
    pub input_adapter: BTreeMap<String, String>,
    pub output_adapter: BTreeMap<String, String>,
    pub previous_nodes: Vec<String>,
    pub previous_dags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DagComponent {
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub version: u32,
    pub previous_nodes: Vec<String>,
    pub previous_dags: Vec<String>,
    pub child_nodes: Vec<String>,
    pub child_dags: Vec<String>,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepComponent {
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub state: State,
    pub state_display: &'static str,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub fission_index: usize,
    pub fission_count: usize,
    pub input: Value,
    pub output: Value,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub previous_steps: Vec<String>,
    pub previous_tasks: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskComponent {
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub state: State,
    pub state_display: &'static str,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub input: Value,
    pub output: Value,
    pub error: Option<String>,
    pub previous_steps: Vec<String>,
    pub previous_tasks: Vec<String>,
    pub child_steps: Vec<String>,
    pub child_tasks: Vec<String>,
    pub components: Vec<Component>,
}

// ---------------------------------------------------------------------------
// Template view
// ---------------------------------------------------------------------------

fn split_template(refs: impl IntoIterator<Item = TemplateRef>) -> (Vec<String>, Vec<String>) {
    let (mut nodes, mut dags) = (Vec::new(), Vec::new());
    for r in refs {
        match r {
            TemplateRef::Node(_) => nodes.push(r.to_string()),
            TemplateRef::Dag(_) => dags.push(r.to_string()),
        }
    }
    (nodes, dags)
}

fn node_component(db: &Db, node: &NodeRow) -> Result<Component, EngineError> {
    let prerequisites = edges::template_prerequisites(db, node.root, TemplateRef::Node(node.id));
    let (previous_nodes, previous_dags) = split_template(prerequisites.iter().map(|e| e.prerequisite));

    let (action, action_kind) = match node.target {
        Some(NodeTarget::Action { action }) => {
            let row = action_repo::get_action(db, action)?;
            (Some(row.name.clone()), Some(row.kind))
        }
        Some(NodeTarget::SubDag { dag }) => (Some(dags::get_dag(db, dag)?.name.clone()), None),
        None => (None, None),
    };

    Ok(Component::Node(NodeComponent {
        identifier: TemplateRef::Node(node.id).to_string(),
        name: node.name.clone(),
        title: node.title.clone(),
        action,
        action_kind,
        expansion: node.expansion.clone(),
        input_adapter: node.input_adapter.clone(),
        output_adapter: node.output_adapter.clone(),
        previous_nodes,
        previous_dags,
    }))
}

fn dag_component(db: &Db, dag: &DagRow) -> Result<Component, EngineError> {
    let level_nodes = nodes::nodes_of_dag(db, dag.id);
    let sub_dags = dags::sub_dags(db, dag.id);

    let mut components = Vec::with_capacity(level_nodes.len() + sub_dags.len());
    for node in &level_nodes {
        components.push(node_component(db, node)?);
    }
    for sub in &sub_dags {
        components.push(dag_component(db, sub)?);
    }

    let prerequisites = edges::template_prerequisites(db, dag.root, TemplateRef::Dag(dag.id));
    let (previous_nodes, previous_dags) = split_template(prerequisites.iter().map(|e| e.prerequisite));

    Ok(Component::Dag(DagComponent {
        identifier: TemplateRef::Dag(dag.id).to_string(),
        name: dag.name.clone(),
        title: dag.title.clone(),
        version: dag.version,
        previous_nodes,
        previous_dags,
        child_nodes: level_nodes.iter().map(|n| TemplateRef::Node(n.id).to_string()).collect(),
        child_dags: sub_dags.iter().map(|d| TemplateRef::Dag(d.id).to_string()).collect(),
        components,
    }))
}

/// Template view rooted at `dag` (usually a root dag).
pub fn assemble_dag(db: &Db, dag: Id) -> Result<Component, EngineError> {
    let row = dags::get_dag(db, dag)?;
    dag_component(db, row)
}

// ---------------------------------------------------------------------------
// Runtime view
// ---------------------------------------------------------------------------

fn split_runtime(refs: impl IntoIterator<Item = RuntimeRef>) -> (Vec<String>, Vec<String>) {
    let (mut steps, mut tasks) = (Vec::new(), Vec::new());
    for r in refs {
        match r {
            RuntimeRef::Step(_) => steps.push(r.to_string()),
            RuntimeRef::Task(_) => tasks.push(r.to_string()),
        }
    }
    (steps, tasks)
}

fn step_component(db: &Db, step: &StepRow) -> Component {
    let (previous_steps, previous_tasks) =
        split_runtime(edges::runtime_prerequisites(db, step.root, RuntimeRef::Step(step.id)));

    Component::Step(StepComponent {
        identifier: RuntimeRef::Step(step.id).to_string(),
        name: step.name.clone(),
        title: step.title.clone(),
        state: step.state,
        state_display: step.state.display_name(),
        start_time: step.start_time,
        end_time: step.end_time,
        duration: step.duration,
        fission_index: step.fission_index,
        fission_count: step.fission_count,
        input: step.input.clone(),
        output: step.output.clone(),
        logs: step.logs.clone(),
        error: step.error.clone(),
        previous_steps,
        previous_tasks,
    })
}

fn task_component(db: &Db, task: &TaskRow) -> Component {
    let level_steps = steps::steps_of_task(db, task.id);
    let sub_tasks = tasks::sub_tasks(db, task.id);

    let mut components: Vec<Component> = level_steps.iter().map(|s| step_component(db, s)).collect();
    components.extend(sub_tasks.iter().map(|t| task_component(db, t)));

    let (previous_steps, previous_tasks) =
        split_runtime(edges::runtime_prerequisites(db, task.root, RuntimeRef::Task(task.id)));

    Component::Task(TaskComponent {
        identifier: RuntimeRef::Task(task.id).to_string(),
        name: task.name.clone(),
        title: task.title.clone(),
        state: task.state,
        state_display: task.state.display_name(),
        start_time: task.start_time,
        end_time: task.end_time,
        duration: task.duration,
        input: task.input.clone(),
        output: task.output.clone(),
        error: task.error.clone(),
        previous_steps,
        previous_tasks,
        child_steps: level_steps.iter().map(|s| RuntimeRef::Step(s.id).to_string()).collect(),
        child_tasks: sub_tasks.iter().map(|t| RuntimeRef::Task(t.id).to_string()).collect(),
        components,
    })
}

/// Runtime view rooted at `task`.
pub fn assemble_task(db: &Db, task: Id) -> Result<Component, EngineError> {
    let row = tasks::get_task(db, task)?;
    Ok(task_component(db, row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DagSpec, NodeSpec, SubDagSpec};
    use crate::template;
    use actions::ActionSpec;
    use serde_json::json;
    use store::Store;

    fn release(store: &Store) -> DagRow {
        store.write(|db| {
            action_repo::insert_action(db, &ActionSpec::new("bash_script")).unwrap();
        });
        let spec = DagSpec::new(
            "release",
            vec![
                NodeSpec::new("build").action("bash_script").into(),
                SubDagSpec::new(
                    "publish",
                    vec![
                        NodeSpec::new("upload").action("bash_script").into(),
                        SubDagSpec::new("notify", vec![NodeSpec::new("mail").into()])
                            .after(&["upload"])
                            .into(),
                    ],
                )
                .after(&["build"])
                .into(),
                NodeSpec::new("tag").after(&["build"]).after_dags(&["publish"]).into(),
            ],
        );
        template::define_dag(store, &spec).unwrap()
    }

    #[test]
    fn template_view_visits_every_entity_once() {
        let store = Store::open();
        let dag = release(&store);
        let view = store.read(|db| assemble_dag(db, dag.id)).unwrap();

        // release, build, tag, publish, upload, notify, mail
        assert_eq!(view.count(), 7);
        let ids = view.identifiers();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());

        let Component::Dag(root) = &view else { panic!("dag expected") };
        assert_eq!(root.child_nodes.len(), 2);
        assert_eq!(root.child_dags.len(), 1);
        // nodes first, then sub-dags
        assert!(matches!(root.components[0], Component::Node(_)));
        assert!(matches!(root.components[2], Component::Dag(_)));

        let Component::Node(tag) = &root.components[1] else { panic!("node expected") };
        assert_eq!(tag.previous_nodes, vec![root.components[0].identifier().to_string()]);
        assert_eq!(tag.previous_dags, vec![root.components[2].identifier().to_string()]);
        assert_eq!(tag.action, None);

        let Component::Node(build) = &root.components[0] else { panic!("node expected") };
        assert_eq!(build.action_kind, Some(ActionKind::Default));
    }

    #[test]
    fn template_view_serializes_with_kind_tags() {
        let store = Store::open();
        let dag = release(&store);
        let view = store.read(|db| assemble_dag(db, dag.id)).unwrap();
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["kind"], json!("Dag"));
        assert_eq!(json["identifier"], json!(format!("dag-{}", dag.id)));
        assert_eq!(json["components"][0]["kind"], json!("Node"));
        assert_eq!(json["components"][2]["components"][1]["kind"], json!("Dag"));
    }

    #[test]
    fn unknown_entities_are_reported() {
        let store = Store::open();
        assert_eq!(
            store.read(|db| assemble_dag(db, 42)).unwrap_err(),
            EngineError::not_exist("dag", 42)
        );
        assert_eq!(
            store.read(|db| assemble_task(db, 42)).unwrap_err(),
            EngineError::not_exist("task", 42)
        );
    }
}
