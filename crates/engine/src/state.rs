//! Execution state machine.
//!
//! ```text
//! PENDING ──► PROCESSING ──► SUCCESS
//!    │             │
//!    │             └───────► ERROR
//!    └─────────────┴───────► REVOKED
//! ```
//!
//! Every transition is a compare-and-set on the row inside one store write,
//! so an entity starts at most once. A task's state is derived from its
//! direct children each time one of them settles.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use store::models::{Id, RuntimeRef, State, StepRow, TaskRow};
use store::repository::{groups, steps, tasks};
use store::Db;

use crate::{payload, EngineError};

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success { output: Value, logs: Vec<String> },
    Failure(EngineError),
}

fn seconds_between(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> Option<f64> {
    start.map(|s| (end - s).num_milliseconds() as f64 / 1000.0)
}

/// `None` when there is no timeout or it lies beyond the representable range.
fn deadline(now: DateTime<Utc>, timeout_ms: Option<u64>) -> Option<DateTime<Utc>> {
    let ms = i64::try_from(timeout_ms?).ok()?;
    now.checked_add_signed(TimeDelta::try_milliseconds(ms)?)
}

fn check_pending(entity: String, state: State) -> Result<(), EngineError> {
    if state == State::Pending {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { entity, from: state, to: State::Processing })
    }
}

// ---------------------------------------------------------------------------
// PENDING -> PROCESSING
// ---------------------------------------------------------------------------

pub fn start_task(
    db: &mut Db,
    task: Id,
    now: DateTime<Utc>,
    timeout_ms: Option<u64>,
    context: Value,
) -> Result<(), EngineError> {
    let row = tasks::get_task_mut(db, task)?;
    check_pending(RuntimeRef::Task(task).to_string(), row.state)?;
    row.state = State::Processing;
    row.start_time = Some(now);
    row.deadline = deadline(now, timeout_ms);
    row.context = context;
    info!(task, name = %row.name, "task started");
    Ok(())
}

pub fn start_step(
    db: &mut Db,
    step: Id,
    now: DateTime<Utc>,
    timeout_ms: Option<u64>,
    input: Value,
) -> Result<(), EngineError> {
    let row = steps::get_step_mut(db, step)?;
    check_pending(row.identifier.clone(), row.state)?;
    row.state = State::Processing;
    row.start_time = Some(now);
    row.deadline = deadline(now, timeout_ms);
    row.input = input;
    debug!(step = %row.identifier, "step started");
    Ok(())
}

// ---------------------------------------------------------------------------
// PROCESSING -> SUCCESS | ERROR
// ---------------------------------------------------------------------------

/// Record a step outcome. Returns `false` (and changes nothing) when the
/// step is no longer `PROCESSING`, e.g. it was revoked or timed out first.
pub fn finish_step(db: &mut Db, step: Id, now: DateTime<Utc>, outcome: StepOutcome) -> Result<bool, EngineError> {
    let row = steps::get_step_mut(db, step)?;
    if row.state != State::Processing {
        debug!(step = %row.identifier, state = %row.state, "late outcome ignored");
        return Ok(false);
    }

    row.end_time = Some(now);
    row.duration = seconds_between(row.start_time, now);
    match outcome {
        StepOutcome::Success { output, logs } => {
            row.state = State::Success;
            row.output = output;
            row.logs.extend(logs);
            debug!(step = %row.identifier, "step succeeded");
        }
        StepOutcome::Failure(err) => {
            row.state = State::Error;
            row.error = Some(err.to_string());
            warn!(step = %row.identifier, error = %err, "step failed");
        }
    }
    Ok(true)
}

fn finish_task(db: &mut Db, task: Id, now: DateTime<Utc>, state: State, output: Value, error: Option<String>) -> Result<(), EngineError> {
    let row = tasks::get_task_mut(db, task)?;
    row.state = state;
    row.output = output;
    row.error = error;
    row.end_time = Some(now);
    row.duration = seconds_between(row.start_time, now);
    info!(task, name = %row.name, state = %row.state, "task finished");
    Ok(())
}

/// Move a non-terminal task straight to `ERROR`, then re-derive its ancestors.
pub fn fail_task(db: &mut Db, task: Id, now: DateTime<Utc>, error: &EngineError) -> Result<(), EngineError> {
    let row = tasks::get_task(db, task)?;
    if row.state.is_terminal() {
        return Ok(());
    }
    let parent = row.parent;
    finish_task(db, task, now, State::Error, Value::Null, Some(error.to_string()))?;
    if let Some(parent) = parent {
        aggregate(db, parent, now)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Direct children of `task` as runtime references, steps first.
pub fn children(db: &Db, task: Id) -> Vec<RuntimeRef> {
    let mut refs: Vec<RuntimeRef> =
        steps::steps_of_task(db, task).iter().map(|s| RuntimeRef::Step(s.id)).collect();
    refs.extend(tasks::sub_tasks(db, task).iter().map(|t| RuntimeRef::Task(t.id)));
    refs
}

/// The state `task` should be in given its children, or `None` while it is
/// still running.
fn derive(db: &Db, task: Id) -> Result<Option<(State, Option<String>)>, EngineError> {
    let mut running = groups::groups_of_task(db, task).iter().any(|g| !g.sealed);
    let mut all_success = true;

    for child in children(db, task) {
        match crate::resolver::state_of(db, child)? {
            State::Error => return Ok(Some((State::Error, Some(format!("{child} failed"))))),
            State::Pending | State::Processing => running = true,
            State::Revoked => all_success = false,
            State::Success => {}
        }
    }

    Ok(match (running, all_success) {
        (true, _) => None,
        (false, true) => Some((State::Success, None)),
        (false, false) => Some((State::Revoked, Some(format!("task-{task} revoked")))),
    })
}

/// Re-derive `task` and then its ancestors, stopping at the first task that
/// is not `PROCESSING` or does not change.
pub fn aggregate(db: &mut Db, task: Id, now: DateTime<Utc>) -> Result<(), EngineError> {
    let mut current = Some(task);
    while let Some(id) = current {
        let row = tasks::get_task(db, id)?;
        if row.state != State::Processing {
            break;
        }
        let (root, parent) = (row.root, row.parent);

        let Some((state, error)) = derive(db, id)? else { break };
        let output = if state == State::Success {
            payload::sink_output(db, root, &children(db, id))?
        } else {
            Value::Null
        };
        finish_task(db, id, now, state, output, error)?;
        current = parent;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Cancellation and deadlines
// ---------------------------------------------------------------------------

fn revoke_step(db: &mut Db, step: Id, now: DateTime<Utc>) -> Result<bool, EngineError> {
    let row = steps::get_step_mut(db, step)?;
    if row.state.is_terminal() {
        return Ok(false);
    }
    let was_running = row.state == State::Processing;
    row.state = State::Revoked;
    row.error = Some(EngineError::Revoked { entity: row.identifier.clone() }.to_string());
    row.end_time = Some(now);
    row.duration = seconds_between(row.start_time, now);
    Ok(was_running)
}

/// Revoke every non-terminal entity strictly below `task`.
///
/// Returns the steps that were in flight.
fn revoke_below(db: &mut Db, task: Id, now: DateTime<Utc>) -> Result<Vec<Id>, EngineError> {
    let mut in_flight = Vec::new();
    for id in tasks::subtree(db, task) {
        if id != task {
            let row = tasks::get_task_mut(db, id)?;
            if !row.state.is_terminal() {
                row.state = State::Revoked;
                row.error = Some(EngineError::Revoked { entity: RuntimeRef::Task(id).to_string() }.to_string());
                row.end_time = Some(now);
                row.duration = seconds_between(row.start_time, now);
            }
        }
        let step_ids: Vec<Id> = steps::steps_of_task(db, id).iter().map(|s| s.id).collect();
        for step in step_ids {
            if revoke_step(db, step, now)? {
                in_flight.push(step);
            }
        }
        for group in groups::groups_of_task(db, id).iter().map(|g| g.node).collect::<Vec<_>>() {
            groups::seal_group(db, id, group)?;
        }
    }
    Ok(in_flight)
}

/// Cancel `task` and every non-terminal descendant.
///
/// Entities already `SUCCESS` or `ERROR` keep their state. Returns the steps
/// that were in flight so their dispatches can be signalled.
pub fn revoke(db: &mut Db, task: Id, now: DateTime<Utc>) -> Result<Vec<Id>, EngineError> {
    let row = tasks::get_task_mut(db, task)?;
    let parent = row.parent;
    if !row.state.is_terminal() {
        row.state = State::Revoked;
        row.error = Some(EngineError::Revoked { entity: RuntimeRef::Task(task).to_string() }.to_string());
        row.end_time = Some(now);
        row.duration = seconds_between(row.start_time, now);
        info!(task, "task revoked");
    }
    let in_flight = revoke_below(db, task, now)?;
    if let Some(parent) = parent {
        aggregate(db, parent, now)?;
    }
    Ok(in_flight)
}

fn after_ms(start: Option<DateTime<Utc>>, deadline: DateTime<Utc>) -> u64 {
    start
        .map(|s| (deadline - s).num_milliseconds())
        .and_then(|ms| u64::try_from(ms).ok())
        .unwrap_or(0)
}

fn expired(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    deadline.is_some_and(|d| d <= now)
}

/// Fail every `PROCESSING` task or step under `root` whose deadline passed.
///
/// A timed-out task takes its unfinished descendants down with it. Returns
/// the steps whose dispatches should be cancelled.
pub fn expire(db: &mut Db, root: Id, now: DateTime<Utc>) -> Result<Vec<Id>, EngineError> {
    let mut cancel = Vec::new();

    for id in tasks::subtree(db, root) {
        let row: TaskRow = tasks::get_task(db, id)?.clone();
        if !expired(row.deadline, now) {
            continue;
        }
        if row.state == State::Error && has_running(db, id) {
            warn!(task = id, "deadline elapsed on a failed task; revoking its remaining work");
            cancel.extend(revoke_below(db, id, now)?);
            continue;
        }
        if row.state != State::Processing {
            continue;
        }
        let error = EngineError::Timeout {
            entity: RuntimeRef::Task(id).to_string(),
            after_ms: row.deadline.map(|d| after_ms(row.start_time, d)).unwrap_or(0),
        };
        warn!(task = id, error = %error, "task deadline elapsed");
        finish_task(db, id, now, State::Error, Value::Null, Some(error.to_string()))?;
        cancel.extend(revoke_below(db, id, now)?);
        if let Some(parent) = row.parent {
            aggregate(db, parent, now)?;
        }
    }

    for id in tasks::subtree(db, root) {
        let overdue: Vec<StepRow> = steps::steps_of_task(db, id)
            .into_iter()
            .filter(|s| s.state == State::Processing && expired(s.deadline, now))
            .cloned()
            .collect();
        for step in overdue {
            let error = EngineError::Timeout {
                entity: step.identifier.clone(),
                after_ms: step.deadline.map(|d| after_ms(step.start_time, d)).unwrap_or(0),
            };
            if finish_step(db, step.id, now, StepOutcome::Failure(error))? {
                cancel.push(step.id);
                crate::fanout::stop(db, &step)?;
                aggregate(db, step.task, now)?;
            }
        }
    }

    Ok(cancel)
}

/// Earliest pending deadline under `root`.
pub fn next_deadline(db: &Db, root: Id) -> Option<DateTime<Utc>> {
    let mut earliest: Option<DateTime<Utc>> = None;
    for id in tasks::subtree(db, root) {
        let task_deadline = tasks::get_task(db, id)
            .ok()
            .filter(|t| t.state == State::Processing || (t.state == State::Error && has_running(db, id)))
            .and_then(|t| t.deadline);
        let step_deadlines = steps::steps_of_task(db, id)
            .into_iter()
            .filter(|s| s.state == State::Processing)
            .filter_map(|s| s.deadline);
        for d in task_deadline.into_iter().chain(step_deadlines) {
            earliest = Some(earliest.map_or(d, |e| e.min(d)));
        }
    }
    earliest
}

/// Whether some step or sub-task strictly below `task` is `PROCESSING`.
fn has_running(db: &Db, task: Id) -> bool {
    tasks::subtree(db, task).into_iter().any(|id| {
        let running_task = id != task && tasks::get_task(db, id).is_ok_and(|t| t.state == State::Processing);
        running_task || steps::steps_of_task(db, id).iter().any(|s| s.state == State::Processing)
    })
}

/// Whether new work may start under `task`: it and every ancestor have
/// started and none was revoked.
///
/// An `ERROR` task stays live so independent siblings of a failure still
/// run. A task that timed out has already revoked everything below it and
/// sealed its groups, so nothing new can start there either.
pub fn is_live(db: &Db, task: Id) -> bool {
    let mut current = Some(task);
    while let Some(id) = current {
        match tasks::get_task(db, id) {
            Ok(row) if matches!(row.state, State::Processing | State::Error) => current = row.parent,
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use store::models::{Expansion, NewDag, NewNode, NewStep, NewTask};
    use store::repository::{dags, nodes};
    use store::Store;

    /// Root task with one single-step node and one empty sub-task.
    fn setup(db: &mut Db) -> (Id, Id, Id) {
        let dag = dags::insert_version(
            db,
            NewDag { name: "p".into(), title: "p".into(), parent: None, timeout_ms: None },
        );
        let node = nodes::insert_node(
            db,
            NewNode {
                dag: dag.id,
                name: "work".into(),
                title: "work".into(),
                target: None,
                expansion: Expansion::Single,
                input_adapter: BTreeMap::new(),
                output_adapter: BTreeMap::new(),
                timeout_ms: None,
            },
        )
        .unwrap();
        let root = tasks::insert_task(
            db,
            NewTask { dag: dag.id, name: "p".into(), title: "p".into(), parent: None, input: json!({}) },
        )
        .unwrap();
        let sub = tasks::insert_task(
            db,
            NewTask { dag: dag.id, name: "sub".into(), title: "sub".into(), parent: Some(root.id), input: json!({}) },
        )
        .unwrap();
        groups::insert_group(db, root.id, node.id).unwrap();
        let step = steps::append_step(
            db,
            NewStep {
                task: root.id,
                node: node.id,
                identifier: "work-0".into(),
                name: "work".into(),
                title: "work".into(),
                fission_index: 0,
                input: Value::Null,
            },
        )
        .unwrap();
        groups::seal_group(db, root.id, node.id).unwrap();
        (root.id, sub.id, step.id)
    }

    #[test]
    fn a_step_starts_at_most_once() {
        Store::open().write(|db| {
            let (_, _, step) = setup(db);
            let now = Utc::now();
            start_step(db, step, now, None, json!({})).unwrap();
            let err = start_step(db, step, now, None, json!({})).unwrap_err();
            assert!(matches!(err, EngineError::InvalidTransition { from: State::Processing, .. }));
        });
    }

    #[test]
    fn late_outcomes_are_ignored() {
        Store::open().write(|db| {
            let (root, _, step) = setup(db);
            let now = Utc::now();
            start_task(db, root, now, None, json!({})).unwrap();
            start_step(db, step, now, None, json!({})).unwrap();
            revoke(db, root, now).unwrap();
            let applied = finish_step(
                db,
                step,
                now,
                StepOutcome::Success { output: json!({ "late": true }), logs: vec![] },
            )
            .unwrap();
            assert!(!applied);
            assert_eq!(steps::get_step(db, step).unwrap().state, State::Revoked);
        });
    }

    #[test]
    fn task_is_error_as_soon_as_one_child_fails() {
        Store::open().write(|db| {
            let (root, sub, step) = setup(db);
            let now = Utc::now();
            start_task(db, root, now, None, json!({})).unwrap();
            start_task(db, sub, now, None, json!({})).unwrap();
            start_step(db, step, now, None, json!({})).unwrap();

            finish_step(db, step, now, StepOutcome::Failure(EngineError::ExternalActionFailed("exit 1".into())))
                .unwrap();
            aggregate(db, root, now).unwrap();

            let root_row = tasks::get_task(db, root).unwrap();
            assert_eq!(root_row.state, State::Error);
            assert_eq!(root_row.error.as_deref(), Some(format!("step-{step} failed").as_str()));
            // the sibling sub-task is still running
            assert_eq!(tasks::get_task(db, sub).unwrap().state, State::Processing);
            assert_eq!(steps::get_step(db, step).unwrap().error.as_deref(), Some("exit 1"));
        });
    }

    #[test]
    fn task_succeeds_only_when_every_child_does() {
        Store::open().write(|db| {
            let (root, sub, step) = setup(db);
            let now = Utc::now();
            start_task(db, root, now, None, json!({})).unwrap();
            start_task(db, sub, now, None, json!({})).unwrap();
            // empty sub-task completes on its own
            aggregate(db, sub, now).unwrap();
            assert_eq!(tasks::get_task(db, sub).unwrap().state, State::Success);
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Processing);

            start_step(db, step, now, None, json!({})).unwrap();
            finish_step(db, step, now, StepOutcome::Success { output: json!({ "rows": 3 }), logs: vec![] })
                .unwrap();
            aggregate(db, root, now).unwrap();
            let root_row = tasks::get_task(db, root).unwrap();
            assert_eq!(root_row.state, State::Success);
            assert_eq!(root_row.output, json!({ "rows": 3 }));
            assert!(root_row.duration.is_some());
        });
    }

    #[test]
    fn revoke_keeps_finished_descendants() {
        Store::open().write(|db| {
            let (root, sub, step) = setup(db);
            let now = Utc::now();
            start_task(db, root, now, None, json!({})).unwrap();
            start_task(db, sub, now, None, json!({})).unwrap();
            aggregate(db, sub, now).unwrap();
            start_step(db, step, now, None, json!({})).unwrap();

            let in_flight = revoke(db, root, now).unwrap();
            assert_eq!(in_flight, vec![step]);
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Revoked);
            assert_eq!(tasks::get_task(db, sub).unwrap().state, State::Success);
            assert_eq!(steps::get_step(db, step).unwrap().state, State::Revoked);
        });
    }

    #[test]
    fn revoke_keeps_failed_descendants() {
        Store::open().write(|db| {
            let (root, sub, step) = setup(db);
            let now = Utc::now();
            start_task(db, root, now, None, json!({})).unwrap();
            start_task(db, sub, now, None, json!({})).unwrap();
            start_step(db, step, now, None, json!({})).unwrap();
            finish_step(db, step, now, StepOutcome::Failure(EngineError::ExternalActionFailed("exit 1".into())))
                .unwrap();
            let timeout = EngineError::Timeout { entity: format!("task-{sub}"), after_ms: 10 };
            fail_task(db, sub, now, &timeout).unwrap();

            let in_flight = revoke(db, root, now).unwrap();
            assert!(in_flight.is_empty());

            let step_row = steps::get_step(db, step).unwrap();
            assert_eq!(step_row.state, State::Error);
            assert_eq!(step_row.error.as_deref(), Some("exit 1"));
            let sub_row = tasks::get_task(db, sub).unwrap();
            assert_eq!(sub_row.state, State::Error);
            assert_eq!(sub_row.error, Some(format!("task-{sub} timed out after 10ms")));
            // the root had already failed through its children
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Error);
        });
    }

    #[test]
    fn overdue_step_times_out() {
        Store::open().write(|db| {
            let (root, _, step) = setup(db);
            let start = Utc::now();
            start_task(db, root, start, None, json!({})).unwrap();
            start_step(db, step, start, Some(50), json!({})).unwrap();

            assert!(expire(db, root, start).unwrap().is_empty());
            assert_eq!(next_deadline(db, root), Some(start + TimeDelta::milliseconds(50)));

            let cancel = expire(db, root, start + TimeDelta::milliseconds(60)).unwrap();
            assert_eq!(cancel, vec![step]);
            let row = steps::get_step(db, step).unwrap();
            assert_eq!(row.state, State::Error);
            assert_eq!(row.error.as_deref(), Some("work-0 timed out after 50ms"));
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Error);
        });
    }

    #[test]
    fn failed_task_deadline_still_revokes_running_work() {
        Store::open().write(|db| {
            let (root, sub, step) = setup(db);
            let start = Utc::now();
            start_task(db, root, start, Some(50), json!({})).unwrap();
            start_task(db, sub, start, None, json!({})).unwrap();
            start_step(db, step, start, None, json!({})).unwrap();
            finish_step(db, step, start, StepOutcome::Failure(EngineError::ExternalActionFailed("exit 1".into())))
                .unwrap();
            aggregate(db, root, start).unwrap();
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Error);
            assert_eq!(next_deadline(db, root), Some(start + TimeDelta::milliseconds(50)));

            expire(db, root, start + TimeDelta::milliseconds(60)).unwrap();
            assert_eq!(tasks::get_task(db, sub).unwrap().state, State::Revoked);
            let root_row = tasks::get_task(db, root).unwrap();
            assert_eq!(root_row.error, Some(format!("step-{step} failed")));
            assert_eq!(next_deadline(db, root), None);
        });
    }

    #[test]
    fn liveness_follows_the_parent_chain() {
        Store::open().write(|db| {
            let (root, sub, _) = setup(db);
            let now = Utc::now();
            assert!(!is_live(db, sub));
            start_task(db, root, now, None, json!({})).unwrap();
            start_task(db, sub, now, None, json!({})).unwrap();
            assert!(is_live(db, sub));

            fail_task(db, root, now, &EngineError::ExternalActionFailed("exit 1".into())).unwrap();
            assert_eq!(tasks::get_task(db, root).unwrap().state, State::Error);
            assert!(is_live(db, sub));

            revoke(db, root, now).unwrap();
            assert!(!is_live(db, sub));
        });
    }

    #[test]
    fn out_of_range_timeout_means_no_deadline() {
        let now = Utc::now();
        assert_eq!(deadline(now, None), None);
        assert_eq!(deadline(now, Some(u64::MAX)), None);
        assert_eq!(deadline(now, Some(10_000_000_000_000_000)), None);
        assert_eq!(deadline(now, Some(50)), Some(now + TimeDelta::milliseconds(50)));
    }
}
