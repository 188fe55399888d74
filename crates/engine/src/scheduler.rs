//! Workflow scheduler.
//!
//! `Scheduler` is the front door of the engine:
//! 1. Registers actions and defines versioned dags.
//! 2. Instantiates a dag into a task tree (`instantiate` / `trigger`).
//! 3. Drives one tree to completion (`run`): every eligible step is
//!    dispatched to the [`Executor`] concurrently, outcomes are applied as
//!    they arrive, and deadlines are enforced.
//! 4. Cancels a tree or sub-tree (`revoke`).
//! 5. Produces the nested template and runtime views.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use actions::{ActionError, ActionOutput, ActionSpec, Executor};
use store::models::{ActionRow, DagRow, Expansion, Id, NodeRow, StepRow, TaskRow};
use store::repository::{dags, steps, tasks};
use store::Store;

use crate::assembler::{self, Component};
use crate::driver::{self, Dispatch};
use crate::models::DagSpec;
use crate::{catalog, state, template, EngineError};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the scheduler.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of steps dispatched to the executor at once, per run.
    pub max_concurrency: usize,
    /// Deadline for steps whose node sets none.
    pub step_timeout_ms: Option<u64>,
    /// Deadline for tasks whose dag sets none.
    pub task_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            step_timeout_ms: None,
            task_timeout_ms: None,
        }
    }
}

type Joined = (Id, Result<ActionOutput, ActionError>);

/// A dispatched, unfinished step.
struct InFlight {
    token: CancellationToken,
    handle: AbortHandle,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the store handle and the executor; cheap to share behind an `Arc`.
pub struct Scheduler {
    store: Store,
    executor: Arc<dyn Executor>,
    config: SchedulerConfig,
    in_flight: Mutex<HashMap<Id, InFlight>>,
    wake: Notify,
}

impl Scheduler {
    pub fn new(store: Store, executor: Arc<dyn Executor>, config: SchedulerConfig) -> Self {
        Self {
            store,
            executor,
            config,
            in_flight: Mutex::new(HashMap::new()),
            wake: Notify::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Actions and templates
    // -----------------------------------------------------------------------

    pub fn register_action(&self, spec: ActionSpec) -> Result<ActionRow, EngineError> {
        catalog::register_action(&self.store, spec)
    }

    pub fn register_actions(&self, specs: Vec<ActionSpec>) -> Result<Vec<ActionRow>, EngineError> {
        catalog::register_actions(&self.store, specs)
    }

    pub fn list_actions(&self) -> Vec<ActionRow> {
        catalog::list_actions(&self.store)
    }

    /// Validate `spec` and store it as the next version of its name.
    pub fn define_dag(&self, spec: &DagSpec) -> Result<DagRow, EngineError> {
        template::define_dag(&self.store, spec)
    }

    pub fn get_dag(&self, id: Id) -> Result<DagRow, EngineError> {
        Ok(self.store.read(|db| dags::get_dag(db, id).cloned())?)
    }

    pub fn get_latest(&self, name: &str) -> Result<DagRow, EngineError> {
        Ok(self.store.read(|db| dags::get_latest(db, name).cloned())?)
    }

    /// Every version of `name`, oldest first.
    pub fn list_versions(&self, name: &str) -> Vec<DagRow> {
        self.store.read(|db| dags::list_versions(db, name).into_iter().cloned().collect())
    }

    /// Root dags, newest first.
    pub fn list_root_dags(&self) -> Vec<DagRow> {
        self.store.read(|db| dags::list_root_dags(db).into_iter().cloned().collect())
    }

    pub fn set_expansion(&self, node: Id, expansion: Expansion) -> Result<NodeRow, EngineError> {
        template::set_expansion(&self.store, node, expansion)
    }

    // -----------------------------------------------------------------------
    // Runtime
    // -----------------------------------------------------------------------

    /// Create the task tree of root dag `dag` with `input` and start its root.
    #[instrument(skip(self, input))]
    pub fn instantiate(&self, dag: Id, input: Value) -> Result<TaskRow, EngineError> {
        self.store.write(|db| driver::instantiate(db, dag, input, &self.config, Utc::now()))
    }

    /// Instantiate the latest version of `name`.
    pub fn trigger(&self, name: &str, input: Value) -> Result<TaskRow, EngineError> {
        let dag = self.get_latest(name)?;
        self.instantiate(dag.id, input)
    }

    pub fn get_task(&self, id: Id) -> Result<TaskRow, EngineError> {
        Ok(self.store.read(|db| tasks::get_task(db, id).cloned())?)
    }

    pub fn get_step(&self, id: Id) -> Result<StepRow, EngineError> {
        Ok(self.store.read(|db| steps::get_step(db, id).cloned())?)
    }

    /// Root tasks, newest first.
    pub fn list_root_tasks(&self) -> Vec<TaskRow> {
        self.store.read(|db| tasks::list_root_tasks(db).into_iter().cloned().collect())
    }

    /// Drive the tree containing `task` until nothing is in flight and nothing
    /// else can start, then return its root task.
    ///
    /// Execution failures are recorded on the entities, not returned. A tree
    /// whose remaining steps are blocked behind a failure is left as is.
    ///
    /// # Errors
    /// Returns `EngineError` only for lookup or store inconsistencies.
    #[instrument(skip(self))]
    pub async fn run(&self, task: Id) -> Result<TaskRow, EngineError> {
        let root = self.store.read(|db| driver::root_of(db, task))?;
        let mut joins: JoinSet<Joined> = JoinSet::new();

        loop {
            let free = self.config.max_concurrency.saturating_sub(joins.len());
            let tick = self.store.write(|db| driver::tick(db, root, &self.config, Utc::now(), free))?;
            self.cancel(&tick.cancel);
            for dispatch in tick.dispatches {
                self.spawn(&mut joins, dispatch);
            }

            if joins.is_empty() && tick.next_deadline.is_none() {
                break;
            }

            let wait = until(tick.next_deadline);
            tokio::select! {
                Some(joined) = joins.join_next() => match joined {
                    Ok((step, result)) => {
                        self.in_flight.lock().remove(&step);
                        self.store.write(|db| driver::apply_outcome(db, step, result, Utc::now()))?;
                    }
                    Err(err) if err.is_cancelled() => debug!("dispatch abandoned"),
                    Err(err) => error!(error = %err, "dispatch task failed"),
                },
                _ = tokio::time::sleep(wait), if tick.next_deadline.is_some() => {}
                _ = self.wake.notified() => {}
            }
        }

        let row = self.get_task(root)?;
        if row.state.is_terminal() {
            info!(task = root, state = %row.state, "execution finished");
        } else {
            let waiting = self.store.read(|db| driver::waiting(db, root));
            warn!(task = root, blocked = waiting.len(), "execution stalled behind unfinished prerequisites");
        }
        Ok(row)
    }

    /// Cancel `task` and its unfinished descendants, signalling in-flight
    /// dispatches.
    #[instrument(skip(self))]
    pub fn revoke(&self, task: Id) -> Result<TaskRow, EngineError> {
        let in_flight = self.store.write(|db| state::revoke(db, task, Utc::now()))?;
        self.cancel(&in_flight);
        self.wake.notify_waiters();
        self.get_task(task)
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    pub fn assemble_dag(&self, dag: Id) -> Result<Component, EngineError> {
        self.store.read(|db| assembler::assemble_dag(db, dag))
    }

    pub fn assemble_task(&self, task: Id) -> Result<Component, EngineError> {
        self.store.read(|db| assembler::assemble_task(db, task))
    }

    // -----------------------------------------------------------------------
    // Internal
    // -----------------------------------------------------------------------

    fn spawn(&self, joins: &mut JoinSet<Joined>, dispatch: Dispatch) {
        let Dispatch { step, request } = dispatch;
        let token = CancellationToken::new();
        let signal = token.clone();
        let executor = Arc::clone(&self.executor);
        debug!(step = %request.identifier, action = %request.action, "dispatching");

        let handle = joins.spawn(async move {
            // A panicking executor fails its step instead of the whole run.
            let inner = tokio::spawn(async move { executor.dispatch(&request, token).await });
            let result = inner
                .await
                .unwrap_or_else(|e| Err(ActionError::Failed(format!("executor task failed: {e}"))));
            (step, result)
        });
        self.in_flight.lock().insert(step, InFlight { token: signal, handle });
    }

    fn cancel(&self, steps: &[Id]) {
        let mut in_flight = self.in_flight.lock();
        for step in steps {
            // The executor sees the token; the run stops waiting on it at once.
            if let Some(InFlight { token, handle }) = in_flight.remove(step) {
                debug!(step, "cancelling dispatch");
                token.cancel();
                handle.abort();
            }
        }
    }
}

fn until(deadline: Option<DateTime<Utc>>) -> Duration {
    deadline
        .and_then(|d| (d - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
        + Duration::from_millis(1)
}
