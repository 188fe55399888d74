//! Fan-out group bookkeeping: one group per (task, node).

use crate::models::{GroupRow, Id};
use crate::{Db, StoreError};

/// Open an empty, unexpanded group.
pub fn insert_group(db: &mut Db, task: Id, node: Id) -> Result<GroupRow, StoreError> {
    if db.groups.contains_key(&(task, node)) {
        return Err(StoreError::Duplicate {
            entity: "group",
            key: format!("task-{task}/node-{node}"),
        });
    }
    let row = GroupRow { task, node, steps: Vec::new(), expanded: false, sealed: false, failed: false };
    db.groups.insert((task, node), row.clone());
    Ok(row)
}

pub fn get_group(db: &Db, task: Id, node: Id) -> Result<&GroupRow, StoreError> {
    db.groups
        .get(&(task, node))
        .ok_or_else(|| StoreError::not_found("group", format!("task-{task}/node-{node}")))
}

/// Groups of `task`, ordered by node id.
pub fn groups_of_task(db: &Db, task: Id) -> Vec<&GroupRow> {
    db.groups.range((task, 0)..=(task, Id::MAX)).map(|(_, g)| g).collect()
}

/// Mark the cardinality as decided.
pub fn mark_expanded(db: &mut Db, task: Id, node: Id) -> Result<(), StoreError> {
    group_mut(db, task, node)?.expanded = true;
    Ok(())
}

/// No more members will be appended.
pub fn seal_group(db: &mut Db, task: Id, node: Id) -> Result<(), StoreError> {
    let group = group_mut(db, task, node)?;
    group.expanded = true;
    group.sealed = true;
    Ok(())
}

/// Seal a group whose expansion failed.
pub fn fail_group(db: &mut Db, task: Id, node: Id) -> Result<(), StoreError> {
    let group = group_mut(db, task, node)?;
    group.expanded = true;
    group.sealed = true;
    group.failed = true;
    Ok(())
}

pub(crate) fn group_mut(db: &mut Db, task: Id, node: Id) -> Result<&mut GroupRow, StoreError> {
    db.groups
        .get_mut(&(task, node))
        .ok_or_else(|| StoreError::not_found("group", format!("task-{task}/node-{node}")))
}
