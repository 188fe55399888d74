//! The shared in-memory store handle.
//!
//! All tables live in one [`Db`] behind a single `RwLock`. A closure passed
//! to [`Store::write`] runs with exclusive access, so every repository call
//! made inside it is applied atomically with respect to other writers and
//! readers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::models::{
    ActionRow, DagRow, GroupRow, Id, NodeRow, RuntimeRef, StepRow, TaskRow, TemplateEdge,
};

/// Per-table primary key sequences.
#[derive(Debug, Default)]
pub(crate) struct Sequences {
    pub action: Id,
    pub dag: Id,
    pub node: Id,
    pub task: Id,
    pub step: Id,
}

impl Sequences {
    pub fn next(counter: &mut Id) -> Id {
        *counter += 1;
        *counter
    }
}

/// Every table plus the secondary indexes the engine traverses.
#[derive(Debug, Default)]
pub struct Db {
    pub(crate) seq: Sequences,

    pub(crate) actions: BTreeMap<Id, ActionRow>,
    pub(crate) action_names: HashMap<String, Id>,

    pub(crate) dags: BTreeMap<Id, DagRow>,
    /// Root dag name -> versions in ascending order.
    pub(crate) dag_versions: HashMap<String, Vec<Id>>,
    pub(crate) dag_children: HashMap<Id, Vec<Id>>,
    pub(crate) dag_nodes: HashMap<Id, Vec<Id>>,
    pub(crate) nodes: BTreeMap<Id, NodeRow>,

    pub(crate) tasks: BTreeMap<Id, TaskRow>,
    pub(crate) task_children: HashMap<Id, Vec<Id>>,
    pub(crate) task_steps: HashMap<Id, Vec<Id>>,
    pub(crate) steps: BTreeMap<Id, StepRow>,
    /// (task, node) -> fan-out group.
    pub(crate) groups: BTreeMap<(Id, Id), GroupRow>,

    /// Root dag -> template edges of that tree.
    pub(crate) template_edges: HashMap<Id, BTreeSet<TemplateEdge>>,
    /// Root task -> dependent -> prerequisites.
    pub(crate) runtime_edges: HashMap<Id, BTreeMap<RuntimeRef, BTreeSet<RuntimeRef>>>,
}

/// Cheaply clonable handle shared by the engine and its readers.
#[derive(Debug, Clone, Default)]
pub struct Store {
    db: Arc<RwLock<Db>>,
}

impl Store {
    /// Open an empty store.
    pub fn open() -> Self {
        info!("Opening in-memory store");
        Self::default()
    }

    /// Run `f` with shared access.
    pub fn read<R>(&self, f: impl FnOnce(&Db) -> R) -> R {
        f(&self.db.read())
    }

    /// Run `f` with exclusive access.
    pub fn write<R>(&self, f: impl FnOnce(&mut Db) -> R) -> R {
        f(&mut self.db.write())
    }
}
