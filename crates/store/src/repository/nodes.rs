//! Node operations.

use crate::models::{Expansion, Id, NewNode, NodeRow};
use crate::store::Sequences;
use crate::{Db, StoreError};

/// Insert a node into `new.dag`; the root is copied from the dag.
pub fn insert_node(db: &mut Db, new: NewNode) -> Result<NodeRow, StoreError> {
    let root = super::dags::get_dag(db, new.dag)?.root;

    let id = Sequences::next(&mut db.seq.node);
    let row = NodeRow {
        id,
        dag: new.dag,
        root,
        name: new.name,
        title: new.title,
        target: new.target,
        expansion: new.expansion,
        input_adapter: new.input_adapter,
        output_adapter: new.output_adapter,
        timeout_ms: new.timeout_ms,
    };
    db.dag_nodes.entry(new.dag).or_default().push(id);
    db.nodes.insert(id, row.clone());
    Ok(row)
}

pub fn get_node(db: &Db, id: Id) -> Result<&NodeRow, StoreError> {
    db.nodes.get(&id).ok_or_else(|| StoreError::not_found("node", id))
}

/// Nodes directly inside `dag`, in creation order.
pub fn nodes_of_dag(db: &Db, dag: Id) -> Vec<&NodeRow> {
    db.dag_nodes
        .get(&dag)
        .map(|ids| ids.iter().filter_map(|id| db.nodes.get(id)).collect())
        .unwrap_or_default()
}

/// Replace the fan-out policy. The only mutable part of a node.
pub fn set_expansion(db: &mut Db, id: Id, expansion: Expansion) -> Result<NodeRow, StoreError> {
    let node = db
        .nodes
        .get_mut(&id)
        .ok_or_else(|| StoreError::not_found("node", id))?;
    node.expansion = expansion;
    Ok(node.clone())
}
