//! Template graph store: validate a [`DagSpec`] and persist it as a new
//! immutable version.
//!
//! Rules enforced, per dag level:
//! 1. Names are non-empty and identifiers unique among siblings.
//! 2. `previous_nodes` / `previous_dags` reference existing siblings of the
//!    right kind, never the component itself.
//! 3. Every declared action exists in the catalog or names a sibling sub-dag.
//! 4. The level's dependency graph is acyclic (topological sort must succeed).
//!
//! Nothing is written unless the whole tree passes.

use std::collections::{HashMap, HashSet, VecDeque};

use actions::FieldError;
use tracing::{info, instrument};

use store::models::{
    Cardinality, DagRow, Expansion, Id, JoinPolicy, NewDag, NewNode, NodeRow, NodeTarget,
    TemplateEdge, TemplateRef,
};
use store::repository::{actions as action_repo, dags, edges, nodes};
use store::{Db, Store, StoreError};

use crate::models::{ComponentSpec, DagSpec};
use crate::EngineError;

/// What a validated node will run.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PlannedTarget {
    Action(Id),
    SubDag(String),
    PassThrough,
}

/// The validated shape of one dag level.
#[derive(Debug, Clone, Default)]
pub struct LevelPlan {
    /// Component identifiers in a valid execution order.
    pub order: Vec<String>,
    targets: HashMap<String, PlannedTarget>,
    children: HashMap<String, LevelPlan>,
}

impl LevelPlan {
    /// Plan of the sub-dag `key` at this level.
    pub fn child(&self, key: &str) -> Option<&LevelPlan> {
        self.children.get(key)
    }
}

/// Validate `spec`, then persist it as the next version of `spec.name`.
///
/// # Errors
/// - [`EngineError::ParamDefinition`] for malformed fields or references.
/// - [`EngineError::ResourceNotExist`] if a declared action is unknown.
/// - [`EngineError::CyclicGraph`] if any level contains a cycle.
#[instrument(skip(store, spec), fields(dag = %spec.name))]
pub fn define_dag(store: &Store, spec: &DagSpec) -> Result<DagRow, EngineError> {
    let plan = store.read(|db| validate_dag(db, spec))?;

    let dag = store.write(|db| commit(db, spec, &plan))?;
    info!(id = dag.id, version = dag.version, "dag defined");
    Ok(dag)
}

/// Validate the whole definition tree and return the root level's plan.
pub fn validate_dag(db: &Db, spec: &DagSpec) -> Result<LevelPlan, EngineError> {
    let mut errors = Vec::new();
    if spec.name.trim().is_empty() {
        errors.push(FieldError::new("name", "dag name must not be empty"));
    }
    check_fields("", &spec.components, &mut errors);
    if !errors.is_empty() {
        return Err(EngineError::ParamDefinition { errors });
    }

    plan_level(db, &spec.components)
}

/// Validate a fan-out policy on its own.
pub fn check_expansion(field: &str, expansion: &Expansion, errors: &mut Vec<FieldError>) {
    match expansion {
        Expansion::Single => {}
        Expansion::Fission { cardinality } | Expansion::Iterate { cardinality } => {
            if let Cardinality::Items(path) = cardinality {
                if path.trim().is_empty() {
                    errors.push(FieldError::new(
                        format!("{field}.cardinality.items"),
                        "collection path must not be empty",
                    ));
                }
            }
        }
        Expansion::Loop { max_iterations, until } => {
            if *max_iterations == 0 {
                errors.push(FieldError::new(
                    format!("{field}.max_iterations"),
                    "a loop needs at least one iteration",
                ));
            }
            if until.as_ref().is_some_and(|c| c.field.trim().is_empty()) {
                errors.push(FieldError::new(format!("{field}.until.field"), "must not be empty"));
            }
        }
    }
}

/// Replace a node's fan-out policy after validating it.
pub fn set_expansion(store: &Store, node: Id, expansion: Expansion) -> Result<NodeRow, EngineError> {
    let mut errors = Vec::new();
    check_expansion("expansion", &expansion, &mut errors);
    if !errors.is_empty() {
        return Err(EngineError::ParamDefinition { errors });
    }
    Ok(store.write(|db| nodes::set_expansion(db, node, expansion))?)
}

// ---------------------------------------------------------------------------
// Pass 1: field-level checks across the whole tree
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum Kind {
    Node,
    Dag,
}

fn check_fields(path: &str, components: &[ComponentSpec], errors: &mut Vec<FieldError>) {
    let mut kinds: HashMap<&str, Kind> = HashMap::new();

    for (i, component) in components.iter().enumerate() {
        let at = format!("{path}components[{i}]");
        let (name, kind) = match component {
            ComponentSpec::Node(n) => (n.name.as_str(), Kind::Node),
            ComponentSpec::Dag(d) => (d.name.as_str(), Kind::Dag),
        };
        if name.trim().is_empty() {
            errors.push(FieldError::new(format!("{at}.name"), "name must not be empty"));
        }
        if kinds.insert(component.key(), kind).is_some() {
            errors.push(FieldError::new(
                format!("{at}.identifier"),
                format!("duplicate identifier '{}'", component.key()),
            ));
        }
    }

    for (i, component) in components.iter().enumerate() {
        let at = format!("{path}components[{i}]");
        let key = component.key();

        for (j, edge) in component.previous_nodes().iter().enumerate() {
            let field = format!("{at}.previous_nodes[{j}]");
            match (edge.target() == key, kinds.get(edge.target())) {
                (true, _) => errors.push(FieldError::new(field, "a component cannot depend on itself")),
                (false, Some(Kind::Node)) => {}
                (false, Some(Kind::Dag)) => errors.push(FieldError::new(
                    field,
                    format!("'{}' is a sub-dag; list it in previous_dags", edge.target()),
                )),
                (false, None) => {
                    errors.push(FieldError::new(field, format!("unknown node '{}'", edge.target())))
                }
            }
        }

        for (j, target) in component.previous_dags().iter().enumerate() {
            let field = format!("{at}.previous_dags[{j}]");
            match (target == key, kinds.get(target.as_str())) {
                (true, _) => errors.push(FieldError::new(field, "a component cannot depend on itself")),
                (false, Some(Kind::Dag)) => {}
                (false, Some(Kind::Node)) => errors.push(FieldError::new(
                    field,
                    format!("'{target}' is a node; list it in previous_nodes"),
                )),
                (false, None) => {
                    errors.push(FieldError::new(field, format!("unknown sub-dag '{target}'")))
                }
            }
        }

        match component {
            ComponentSpec::Node(node) => {
                if node.action.as_deref().is_some_and(|a| a.trim().is_empty()) {
                    errors.push(FieldError::new(format!("{at}.action"), "action must not be empty"));
                }
                check_expansion(&format!("{at}.expansion"), &node.expansion, errors);
            }
            ComponentSpec::Dag(dag) => check_fields(&format!("{at}."), &dag.components, errors),
        }
    }
}

// ---------------------------------------------------------------------------
// Pass 2: action resolution and acyclicity, level by level
// ---------------------------------------------------------------------------

fn plan_level(db: &Db, components: &[ComponentSpec]) -> Result<LevelPlan, EngineError> {
    let mut plan = LevelPlan::default();
    let sub_dags: HashSet<&str> = components
        .iter()
        .filter(|c| matches!(c, ComponentSpec::Dag(_)))
        .map(ComponentSpec::key)
        .collect();

    // key -> prerequisite keys, in declaration order
    let mut prerequisites: Vec<(&str, Vec<&str>)> = Vec::with_capacity(components.len());

    for component in components {
        let mut before: Vec<&str> = component.previous_nodes().iter().map(|e| e.target()).collect();
        before.extend(component.previous_dags().iter().map(String::as_str));

        match component {
            ComponentSpec::Node(node) => {
                let target = match node.action.as_deref() {
                    None => PlannedTarget::PassThrough,
                    Some(name) => match action_repo::find_action(db, name) {
                        Some(action) => PlannedTarget::Action(action.id),
                        None if sub_dags.contains(name) => {
                            // The sub-dag must finish before the node can pass its output on.
                            before.push(name);
                            PlannedTarget::SubDag(name.to_owned())
                        }
                        None => return Err(EngineError::not_exist("action", name)),
                    },
                };
                plan.targets.insert(node.key().to_owned(), target);
            }
            ComponentSpec::Dag(dag) => {
                let child = plan_level(db, &dag.components)?;
                plan.children.insert(dag.key().to_owned(), child);
            }
        }

        prerequisites.push((component.key(), before));
    }

    plan.order = topological_order(&prerequisites)?;
    Ok(plan)
}

/// Kahn's algorithm over one level; returns keys in execution order or the
/// offending cycle.
fn topological_order(prerequisites: &[(&str, Vec<&str>)]) -> Result<Vec<String>, EngineError> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for (key, before) in prerequisites {
        in_degree.entry(key).or_insert(0);
        let unique: HashSet<&str> = before.iter().copied().collect();
        for prereq in unique {
            dependents.entry(prereq).or_default().push(key);
            *in_degree.entry(key).or_insert(0) += 1;
        }
    }

    // Seed in declaration order so the result is deterministic.
    let mut queue: VecDeque<&str> = prerequisites
        .iter()
        .map(|(key, _)| *key)
        .filter(|key| in_degree.get(key) == Some(&0))
        .collect();

    let mut sorted = Vec::with_capacity(prerequisites.len());
    while let Some(key) = queue.pop_front() {
        sorted.push(key.to_owned());
        for &next in dependents.get(key).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(deg) = in_degree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if sorted.len() == prerequisites.len() {
        return Ok(sorted);
    }

    let done: HashSet<&str> = sorted.iter().map(String::as_str).collect();
    Err(EngineError::CyclicGraph { cycle: find_cycle(prerequisites, &done) })
}

/// Walk prerequisite links among the unsorted keys until one repeats.
///
/// Every unsorted key still has an unsorted prerequisite, so the walk always
/// closes a loop.
fn find_cycle(prerequisites: &[(&str, Vec<&str>)], done: &HashSet<&str>) -> Vec<String> {
    let lookup: HashMap<&str, &Vec<&str>> = prerequisites.iter().map(|(k, b)| (*k, b)).collect();
    let Some(start) = prerequisites.iter().map(|(k, _)| *k).find(|k| !done.contains(k)) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    loop {
        if let Some(pos) = path.iter().position(|k| *k == current) {
            // path runs dependent -> prerequisite; report it in execution order.
            let mut cycle: Vec<String> = path[pos..].iter().rev().map(|k| k.to_string()).collect();
            cycle.insert(0, current.to_owned());
            return cycle;
        }
        path.push(current);
        match lookup
            .get(current)
            .and_then(|before| before.iter().find(|k| !done.contains(*k)))
        {
            Some(next) => current = next,
            None => return path.iter().map(|k| k.to_string()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

fn commit(db: &mut Db, spec: &DagSpec, plan: &LevelPlan) -> Result<DagRow, StoreError> {
    let root = dags::insert_version(
        db,
        NewDag {
            name: spec.name.clone(),
            title: title_or_name(&spec.title, &spec.name),
            parent: None,
            timeout_ms: spec.timeout_ms,
        },
    );
    commit_level(db, root.id, root.id, &spec.components, plan)?;
    Ok(root)
}

fn commit_level(
    db: &mut Db,
    dag: Id,
    root: Id,
    components: &[ComponentSpec],
    plan: &LevelPlan,
) -> Result<(), StoreError> {
    let mut refs: HashMap<&str, TemplateRef> = HashMap::new();

    // Sub-dags first so sub-dag backed nodes can point at them.
    for component in components {
        if let ComponentSpec::Dag(sub) = component {
            let row = dags::insert_sub_dag(
                db,
                NewDag {
                    name: sub.name.clone(),
                    title: title_or_name(&sub.title, &sub.name),
                    parent: Some(dag),
                    timeout_ms: sub.timeout_ms,
                },
            )?;
            refs.insert(sub.key(), TemplateRef::Dag(row.id));
            let child = plan
                .child(sub.key())
                .ok_or_else(|| StoreError::not_found("plan", sub.key()))?;
            commit_level(db, row.id, root, &sub.components, child)?;
        }
    }

    for component in components {
        if let ComponentSpec::Node(node) = component {
            let target = match plan.targets.get(node.key()) {
                Some(PlannedTarget::Action(action)) => Some(NodeTarget::Action { action: *action }),
                Some(PlannedTarget::SubDag(key)) => match refs.get(key.as_str()) {
                    Some(TemplateRef::Dag(id)) => Some(NodeTarget::SubDag { dag: *id }),
                    _ => return Err(StoreError::not_found("dag", key)),
                },
                Some(PlannedTarget::PassThrough) | None => None,
            };
            let row = nodes::insert_node(
                db,
                NewNode {
                    dag,
                    name: node.name.clone(),
                    title: title_or_name(&node.title, &node.name),
                    target,
                    expansion: node.expansion.clone(),
                    input_adapter: node.input_adapter.clone(),
                    output_adapter: node.output_adapter.clone(),
                    timeout_ms: node.timeout_ms,
                },
            )?;
            refs.insert(node.key(), TemplateRef::Node(row.id));
        }
    }

    for component in components {
        let lookup = |key: &str| {
            refs.get(key)
                .copied()
                .ok_or_else(|| StoreError::not_found("component", key))
        };
        let dependent = lookup(component.key())?;

        let mut new_edges = Vec::new();
        for edge in component.previous_nodes() {
            new_edges.push(TemplateEdge {
                dependent,
                prerequisite: lookup(edge.target())?,
                join: edge.join(),
            });
        }
        for target in component.previous_dags() {
            new_edges.push(TemplateEdge {
                dependent,
                prerequisite: lookup(target)?,
                join: JoinPolicy::Barrier,
            });
        }
        for edge in new_edges {
            edges::insert_template_edge(db, root, edge);
        }
    }

    Ok(())
}

fn title_or_name(title: &str, name: &str) -> String {
    if title.trim().is_empty() {
        name.to_owned()
    } else {
        title.to_owned()
    }
}
