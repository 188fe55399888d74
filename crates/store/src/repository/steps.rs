//! Step operations.

use serde_json::Value;

use crate::models::{Id, NewStep, State, StepRow};
use crate::repository::{groups, tasks};
use crate::store::Sequences;
use crate::{Db, StoreError};

/// Append a `PENDING` member to the (task, node) group.
///
/// `fission_index` must be the next free index so the group always covers
/// `0..fission_count` without gaps; every member's `fission_count` is
/// updated to the new group size.
pub fn append_step(db: &mut Db, new: NewStep) -> Result<StepRow, StoreError> {
    let root = tasks::get_task(db, new.task)?.root;
    let size = groups::get_group(db, new.task, new.node)?.steps.len();
    if new.fission_index != size {
        return Err(StoreError::Duplicate { entity: "step", key: new.identifier });
    }

    let id = Sequences::next(&mut db.seq.step);
    let row = StepRow {
        id,
        identifier: new.identifier,
        name: new.name,
        title: new.title,
        node: new.node,
        task: new.task,
        root,
        state: State::Pending,
        input: new.input,
        output: Value::Null,
        logs: Vec::new(),
        error: None,
        start_time: None,
        end_time: None,
        duration: None,
        deadline: None,
        fission_index: new.fission_index,
        fission_count: size + 1,
    };
    db.steps.insert(id, row);

    let group = groups::group_mut(db, new.task, new.node)?;
    group.expanded = true;
    group.steps.push(id);
    let members = group.steps.clone();
    for member in &members {
        if let Some(step) = db.steps.get_mut(member) {
            step.fission_count = members.len();
        }
    }

    db.task_steps.entry(new.task).or_default().push(id);
    get_step(db, id).cloned()
}

pub fn get_step(db: &Db, id: Id) -> Result<&StepRow, StoreError> {
    db.steps.get(&id).ok_or_else(|| StoreError::not_found("step", id))
}

pub fn get_step_mut(db: &mut Db, id: Id) -> Result<&mut StepRow, StoreError> {
    db.steps.get_mut(&id).ok_or_else(|| StoreError::not_found("step", id))
}

/// Steps directly inside `task`, in creation order.
pub fn steps_of_task(db: &Db, task: Id) -> Vec<&StepRow> {
    db.task_steps
        .get(&task)
        .map(|ids| ids.iter().filter_map(|id| db.steps.get(id)).collect())
        .unwrap_or_default()
}

/// Members of the (task, node) group ordered by `fission_index`.
pub fn group_steps(db: &Db, task: Id, node: Id) -> Vec<&StepRow> {
    db.groups
        .get(&(task, node))
        .map(|g| g.steps.iter().filter_map(|id| db.steps.get(id)).collect())
        .unwrap_or_default()
}
