//! Task operations.

use serde_json::Value;

use crate::models::{Id, NewTask, State, TaskRow};
use crate::store::Sequences;
use crate::{Db, StoreError};

/// Insert a `PENDING` task. A task without a parent is its own root.
pub fn insert_task(db: &mut Db, new: NewTask) -> Result<TaskRow, StoreError> {
    let parent_root = match new.parent {
        Some(parent) => Some(get_task(db, parent)?.root),
        None => None,
    };

    let id = Sequences::next(&mut db.seq.task);
    let row = TaskRow {
        id,
        name: new.name,
        title: new.title,
        dag: new.dag,
        parent: new.parent,
        root: parent_root.unwrap_or(id),
        state: State::Pending,
        input: new.input,
        output: Value::Null,
        context: Value::Null,
        error: None,
        start_time: None,
        end_time: None,
        duration: None,
        deadline: None,
    };

    if let Some(parent) = new.parent {
        db.task_children.entry(parent).or_default().push(id);
    }
    db.tasks.insert(id, row.clone());
    Ok(row)
}

pub fn get_task(db: &Db, id: Id) -> Result<&TaskRow, StoreError> {
    db.tasks.get(&id).ok_or_else(|| StoreError::not_found("task", id))
}

pub fn get_task_mut(db: &mut Db, id: Id) -> Result<&mut TaskRow, StoreError> {
    db.tasks.get_mut(&id).ok_or_else(|| StoreError::not_found("task", id))
}

/// Direct sub-tasks of `parent`, in creation order.
pub fn sub_tasks(db: &Db, parent: Id) -> Vec<&TaskRow> {
    db.task_children
        .get(&parent)
        .map(|ids| ids.iter().filter_map(|id| db.tasks.get(id)).collect())
        .unwrap_or_default()
}

/// The sub-task of `parent` instantiated from `dag`, if any.
pub fn find_sub_task(db: &Db, parent: Id, dag: Id) -> Option<&TaskRow> {
    sub_tasks(db, parent).into_iter().find(|t| t.dag == dag)
}

/// `task` and all of its descendants, depth-first pre-order.
pub fn subtree(db: &Db, task: Id) -> Vec<Id> {
    let mut order = Vec::new();
    let mut stack = vec![task];
    while let Some(id) = stack.pop() {
        order.push(id);
        if let Some(children) = db.task_children.get(&id) {
            stack.extend(children.iter().rev());
        }
    }
    order
}

/// Root tasks only, newest first.
pub fn list_root_tasks(db: &Db) -> Vec<&TaskRow> {
    db.tasks.values().rev().filter(|t| t.parent.is_none()).collect()
}
