//! Dependency edges, stored as adjacency sets keyed by the owning tree.
//!
//! Template edges are keyed by root dag, runtime edges by root task, so a
//! traversal scoped to one execution never touches another tree's edges.

use std::collections::BTreeSet;

use crate::models::{Id, RuntimeRef, TemplateEdge, TemplateRef};
use crate::Db;

/// Record a template edge inside the tree of `root_dag`.
pub fn insert_template_edge(db: &mut Db, root_dag: Id, edge: TemplateEdge) {
    db.template_edges.entry(root_dag).or_default().insert(edge);
}

/// Template edges whose dependent is `dependent`.
pub fn template_prerequisites(db: &Db, root_dag: Id, dependent: TemplateRef) -> Vec<TemplateEdge> {
    db.template_edges
        .get(&root_dag)
        .map(|edges| edges.iter().filter(|e| e.dependent == dependent).copied().collect())
        .unwrap_or_default()
}

/// Template edges whose prerequisite is `prerequisite`.
pub fn template_dependents(db: &Db, root_dag: Id, prerequisite: TemplateRef) -> Vec<TemplateEdge> {
    db.template_edges
        .get(&root_dag)
        .map(|edges| edges.iter().filter(|e| e.prerequisite == prerequisite).copied().collect())
        .unwrap_or_default()
}

/// Replace every runtime prerequisite of `dependent`. Idempotent.
pub fn replace_runtime_prerequisites(
    db: &mut Db,
    root_task: Id,
    dependent: RuntimeRef,
    prerequisites: BTreeSet<RuntimeRef>,
) {
    let tree = db.runtime_edges.entry(root_task).or_default();
    if prerequisites.is_empty() {
        tree.remove(&dependent);
    } else {
        tree.insert(dependent, prerequisites);
    }
}

/// Runtime prerequisites of `dependent`, in id order.
pub fn runtime_prerequisites(db: &Db, root_task: Id, dependent: RuntimeRef) -> Vec<RuntimeRef> {
    db.runtime_edges
        .get(&root_task)
        .and_then(|tree| tree.get(&dependent))
        .map(|set| set.iter().copied().collect())
        .unwrap_or_default()
}

/// Whether anything in the tree depends on `prerequisite`.
pub fn has_runtime_dependents(db: &Db, root_task: Id, prerequisite: RuntimeRef) -> bool {
    db.runtime_edges
        .get(&root_task)
        .is_some_and(|tree| tree.values().any(|set| set.contains(&prerequisite)))
}

/// Number of runtime edges in the tree.
pub fn runtime_edge_count(db: &Db, root_task: Id) -> usize {
    db.runtime_edges
        .get(&root_task)
        .map(|tree| tree.values().map(BTreeSet::len).sum())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JoinPolicy;
    use crate::Store;

    #[test]
    fn replacing_runtime_edges_is_idempotent() {
        let store = Store::open();
        store.write(|db| {
            let set: BTreeSet<_> = [RuntimeRef::Step(1), RuntimeRef::Step(2)].into();
            replace_runtime_prerequisites(db, 10, RuntimeRef::Step(3), set.clone());
            replace_runtime_prerequisites(db, 10, RuntimeRef::Step(3), set);
            assert_eq!(runtime_edge_count(db, 10), 2);
            assert!(has_runtime_dependents(db, 10, RuntimeRef::Step(1)));
            assert!(!has_runtime_dependents(db, 11, RuntimeRef::Step(1)));

            replace_runtime_prerequisites(db, 10, RuntimeRef::Step(3), BTreeSet::new());
            assert_eq!(runtime_edge_count(db, 10), 0);
        });
    }

    #[test]
    fn template_edges_are_scoped_by_root() {
        let store = Store::open();
        store.write(|db| {
            let edge = TemplateEdge {
                dependent: TemplateRef::Node(2),
                prerequisite: TemplateRef::Node(1),
                join: JoinPolicy::Barrier,
            };
            insert_template_edge(db, 1, edge);
            insert_template_edge(db, 1, edge);
            assert_eq!(template_prerequisites(db, 1, TemplateRef::Node(2)), vec![edge]);
            assert_eq!(template_dependents(db, 1, TemplateRef::Node(1)), vec![edge]);
            assert!(template_prerequisites(db, 2, TemplateRef::Node(2)).is_empty());
        });
    }
}
