//! The synchronous half of the scheduler.
//!
//! Everything here runs inside one [`Store::write`](store::Store::write)
//! call: instantiate a tree, advance it to a fixpoint, or apply an executor
//! outcome. The async [`Scheduler`](crate::Scheduler) only moves dispatches
//! and outcomes between these functions and the executor.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use actions::{schema, ActionError, ActionOutput, DispatchRequest};
use store::models::{
    DagRow, Id, NewTask, NodeRow, NodeTarget, RuntimeRef, State, StepRow, TaskRow,
};
use store::repository::{actions as action_repo, dags, groups, nodes, steps, tasks};
use store::Db;

use crate::resolver::{self, Readiness};
use crate::scheduler::SchedulerConfig;
use crate::state::{self, StepOutcome};
use crate::{fanout, payload, EngineError};

/// A step handed to the executor.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub step: Id,
    pub request: DispatchRequest,
}

/// Result of one pass over a tree.
#[derive(Debug, Default)]
pub struct Tick {
    pub dispatches: Vec<Dispatch>,
    /// Steps whose in-flight dispatch should be cancelled.
    pub cancel: Vec<Id>,
    pub next_deadline: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Instantiation
// ---------------------------------------------------------------------------

fn create_task(db: &mut Db, dag: &DagRow, parent: Option<Id>, input: Value) -> Result<Id, EngineError> {
    let task = tasks::insert_task(
        db,
        NewTask {
            dag: dag.id,
            name: dag.name.clone(),
            title: dag.title.clone(),
            parent,
            input,
        },
    )?;
    fanout::open_groups(db, task.id, dag.id)?;

    let children: Vec<DagRow> = dags::sub_dags(db, dag.id).into_iter().cloned().collect();
    for child in &children {
        create_task(db, child, Some(task.id), Value::Null)?;
    }
    Ok(task.id)
}

/// Create the task tree for `dag`, start the root and materialize every
/// group whose size does not depend on runtime data.
pub fn instantiate(
    db: &mut Db,
    dag_id: Id,
    input: Value,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<TaskRow, EngineError> {
    let dag = dags::get_dag(db, dag_id)?.clone();
    if dag.parent.is_some() {
        return Err(EngineError::param(
            "dag",
            format!("dag-{} is a sub-dag; instantiate its root dag-{}", dag.id, dag.root),
        ));
    }

    let root = create_task(db, &dag, None, input)?;

    for task in tasks::subtree(db, root) {
        let pending: Vec<Id> = groups::groups_of_task(db, task).iter().map(|g| g.node).collect();
        for node_id in pending {
            let node = nodes::get_node(db, node_id)?.clone();
            if !fanout::needs_input(&node.expansion) {
                fanout::expand(db, task, &node, &Value::Null)?;
            }
        }
    }

    let context = payload::task_context(db, root)?;
    state::start_task(db, root, now, dag.timeout_ms.or(config.task_timeout_ms), context)?;
    resolver::refresh(db, root)?;
    state::aggregate(db, root, now)?;

    info!(task = root, dag = %dag.name, version = dag.version, "task instantiated");
    Ok(tasks::get_task(db, root)?.clone())
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// Advance the tree under `root` until nothing more can change without an
/// executor outcome. At most `free_slots` steps are dispatched.
pub fn tick(
    db: &mut Db,
    root: Id,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
    free_slots: usize,
) -> Result<Tick, EngineError> {
    let mut tick = Tick { cancel: state::expire(db, root, now)?, ..Tick::default() };

    loop {
        resolver::refresh(db, root)?;
        if advance_tasks(db, root, config, now)? {
            continue;
        }
        if !advance_steps(db, root, config, now, free_slots, &mut tick)? {
            break;
        }
    }

    tick.next_deadline = state::next_deadline(db, root);
    Ok(tick)
}

/// Start ready sub-tasks and expand deferred groups. Returns whether anything changed.
fn advance_tasks(db: &mut Db, root: Id, config: &SchedulerConfig, now: DateTime<Utc>) -> Result<bool, EngineError> {
    let mut changed = false;

    for task_id in tasks::subtree(db, root) {
        let task = tasks::get_task(db, task_id)?.clone();
        match task.state {
            State::Pending => {
                let parent_live = task.parent.is_some_and(|p| state::is_live(db, p));
                if parent_live && resolver::resolve_task(db, &task)?.readiness(db)? == Readiness::Ready {
                    let context = payload::task_context(db, task_id)?;
                    let timeout = dags::get_dag(db, task.dag)?.timeout_ms.or(config.task_timeout_ms);
                    state::start_task(db, task_id, now, timeout, context)?;
                    state::aggregate(db, task_id, now)?;
                    changed = true;
                }
            }
            State::Processing | State::Error if state::is_live(db, task_id) => {
                changed |= expand_deferred(db, &task, now)?;
            }
            _ => {}
        }
    }

    Ok(changed)
}

fn expand_deferred(db: &mut Db, task: &TaskRow, now: DateTime<Utc>) -> Result<bool, EngineError> {
    let waiting: Vec<Id> = groups::groups_of_task(db, task.id)
        .iter()
        .filter(|g| !g.expanded && !g.sealed)
        .map(|g| g.node)
        .collect();

    let mut changed = false;
    for node_id in waiting {
        let node = nodes::get_node(db, node_id)?.clone();
        let resolution = resolver::resolve_node(db, task, &node, None)?;
        if resolution.readiness(db)? != Readiness::Ready {
            continue;
        }
        let context = payload::node_context(db, task.id, &resolution.prerequisites())?;
        match fanout::expand(db, task.id, &node, &context) {
            Ok(count) => debug!(task = task.id, node = %node.name, count, "group expanded"),
            Err(err @ EngineError::UnresolvableFanout { .. }) => {
                warn!(task = task.id, error = %err, "fan-out failed");
                groups::fail_group(db, task.id, node.id)?;
                state::fail_task(db, task.id, now, &err)?;
                return Ok(true);
            }
            Err(err) => return Err(err),
        }
        changed = true;
    }
    Ok(changed)
}

/// Start every ready step of every live task. Returns whether anything changed.
fn advance_steps(
    db: &mut Db,
    root: Id,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
    free_slots: usize,
    tick: &mut Tick,
) -> Result<bool, EngineError> {
    let mut changed = false;

    for task_id in tasks::subtree(db, root) {
        if !state::is_live(db, task_id) {
            continue;
        }
        let pending: Vec<StepRow> = steps::steps_of_task(db, task_id)
            .into_iter()
            .filter(|s| s.state == State::Pending)
            .cloned()
            .collect();

        for step in pending {
            if resolver::resolve_step(db, &step)?.readiness(db)? != Readiness::Ready {
                continue;
            }
            let node = nodes::get_node(db, step.node)?.clone();
            match node.target {
                Some(NodeTarget::Action { action }) => {
                    if tick.dispatches.len() >= free_slots {
                        continue;
                    }
                    if let Some(dispatch) = start_action(db, &step, &node, action, config, now)? {
                        tick.dispatches.push(dispatch);
                    }
                }
                Some(NodeTarget::SubDag { dag }) => {
                    let sub_output = tasks::find_sub_task(db, task_id, dag)
                        .map(|t| t.output.clone())
                        .unwrap_or(Value::Null);
                    complete_inline(db, &step, &node, sub_output, now)?;
                }
                None => {
                    let context = payload::step_context(db, step.id)?;
                    let input = payload::action_input(&node, &context);
                    complete_inline(db, &step, &node, input, now)?;
                }
            }
            changed = true;
        }
    }

    Ok(changed)
}

/// Start an action-backed step. Returns `None` when the input was rejected
/// and the step failed without being dispatched.
fn start_action(
    db: &mut Db,
    step: &StepRow,
    node: &NodeRow,
    action: Id,
    config: &SchedulerConfig,
    now: DateTime<Utc>,
) -> Result<Option<Dispatch>, EngineError> {
    let action = action_repo::get_action(db, action)?.clone();
    let context = payload::step_context(db, step.id)?;
    let input = payload::action_input(node, &context);
    let timeout = node.timeout_ms.or(config.step_timeout_ms);

    if let Err(errors) = schema::validate(&action.input_schema, &input) {
        state::start_step(db, step.id, now, None, input)?;
        settle(db, step.id, now, StepOutcome::Failure(EngineError::ParamDefinition { errors }))?;
        return Ok(None);
    }

    state::start_step(db, step.id, now, timeout, input.clone())?;
    let task = tasks::get_task(db, step.task)?;
    Ok(Some(Dispatch {
        step: step.id,
        request: DispatchRequest {
            step_id: step.id,
            identifier: step.identifier.clone(),
            task_id: task.id,
            root_task_id: task.root,
            action: action.name,
            kind: action.kind,
            input,
        },
    }))
}

/// Pass-through and sub-dag backed steps finish as soon as they start.
fn complete_inline(db: &mut Db, step: &StepRow, node: &NodeRow, value: Value, now: DateTime<Utc>) -> Result<(), EngineError> {
    let input = match node.target {
        Some(NodeTarget::SubDag { .. }) => payload::action_input(node, &payload::step_context(db, step.id)?),
        _ => value.clone(),
    };
    state::start_step(db, step.id, now, None, input)?;
    let output = payload::action_output(node, &value);
    settle(db, step.id, now, StepOutcome::Success { output, logs: Vec::new() })
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Record a step outcome, grow or stop its sequential group, and re-derive
/// the enclosing tasks.
pub fn settle(db: &mut Db, step_id: Id, now: DateTime<Utc>, outcome: StepOutcome) -> Result<(), EngineError> {
    let succeeded = matches!(outcome, StepOutcome::Success { .. });
    if !state::finish_step(db, step_id, now, outcome)? {
        return Ok(());
    }

    let step = steps::get_step(db, step_id)?.clone();
    let node = nodes::get_node(db, step.node)?.clone();
    if node.expansion.is_sequential() {
        if succeeded && state::is_live(db, step.task) {
            let task = tasks::get_task(db, step.task)?.clone();
            let resolution = resolver::resolve_node(db, &task, &node, None)?;
            let context = payload::node_context(db, task.id, &resolution.prerequisites())?;
            if let Err(err) = fanout::advance(db, &step, &context) {
                groups::fail_group(db, step.task, step.node)?;
                state::fail_task(db, task.id, now, &err)?;
            }
        } else {
            fanout::stop(db, &step)?;
        }
    }

    state::aggregate(db, step.task, now)
}

/// Translate an executor result and record it on the step.
pub fn apply_outcome(
    db: &mut Db,
    step_id: Id,
    result: Result<ActionOutput, ActionError>,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let step = steps::get_step(db, step_id)?.clone();
    if step.state != State::Processing {
        debug!(step = %step.identifier, state = %step.state, "outcome for settled step ignored");
        return Ok(());
    }
    let node = nodes::get_node(db, step.node)?.clone();

    let outcome = match result {
        Ok(out) => {
            let output_schema = match node.target {
                Some(NodeTarget::Action { action }) => action_repo::get_action(db, action)?.output_schema.clone(),
                _ => Value::Null,
            };
            match schema::validate(&output_schema, &out.output) {
                Ok(()) => StepOutcome::Success {
                    output: payload::action_output(&node, &out.output),
                    logs: out.logs,
                },
                Err(errors) => StepOutcome::Failure(EngineError::ParamDefinition { errors }),
            }
        }
        Err(ActionError::Failed(message)) => StepOutcome::Failure(EngineError::ExternalActionFailed(message)),
        Err(ActionError::Cancelled) => {
            StepOutcome::Failure(EngineError::Revoked { entity: step.identifier.clone() })
        }
    };
    settle(db, step_id, now, outcome)
}

/// Root task of `task`.
pub fn root_of(db: &Db, task: Id) -> Result<Id, EngineError> {
    Ok(tasks::get_task(db, task)?.root)
}

/// Entities of the tree still waiting, for diagnostics.
pub fn waiting(db: &Db, root: Id) -> Vec<RuntimeRef> {
    let mut refs = Vec::new();
    for task in tasks::subtree(db, root) {
        if tasks::get_task(db, task).is_ok_and(|t| t.state == State::Pending) {
            refs.push(RuntimeRef::Task(task));
        }
        refs.extend(
            steps::steps_of_task(db, task)
                .into_iter()
                .filter(|s| s.state == State::Pending)
                .map(|s| RuntimeRef::Step(s.id)),
        );
    }
    refs
}
