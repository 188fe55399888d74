//! Row structs for every table in the store.
//!
//! These are *persistence* models; they carry no scheduling behaviour.
//! The definition DSL and the graph algorithms live in the `engine` crate.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use actions::ActionKind;

/// Numeric primary key. Each table has its own sequence.
pub type Id = u64;

// ---------------------------------------------------------------------------
// state
// ---------------------------------------------------------------------------

/// Lifecycle shared by tasks and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Pending,
    Processing,
    Success,
    Error,
    Revoked,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Revoked)
    }

    /// Human-readable label used by presentation layers.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Pending    => "Pending",
            Self::Processing => "Processing",
            Self::Success    => "Success",
            Self::Error      => "Error",
            Self::Revoked    => "Revoked",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending    => write!(f, "PENDING"),
            Self::Processing => write!(f, "PROCESSING"),
            Self::Success    => write!(f, "SUCCESS"),
            Self::Error      => write!(f, "ERROR"),
            Self::Revoked    => write!(f, "REVOKED"),
        }
    }
}

impl std::str::FromStr for State {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING"    => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCESS"    => Ok(Self::Success),
            "ERROR"      => Ok(Self::Error),
            "REVOKED"    => Ok(Self::Revoked),
            other        => Err(format!("unknown state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// actions
// ---------------------------------------------------------------------------

/// A registered action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRow {
    pub id: Id,
    pub name: String,
    pub title: String,
    pub kind: ActionKind,
    pub input_schema: Value,
    pub output_schema: Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// template policies
// ---------------------------------------------------------------------------

/// What a node runs when its step starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeTarget {
    /// Dispatch the registered action to the executor.
    Action { action: Id },
    /// Wait for the sibling sub-dag's task and pass its output through.
    SubDag { dag: Id },
}

/// How many members a fan-out group gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// A fixed number of members.
    Count(usize),
    /// One member per element of the array at this dotted input path.
    Items(String),
}

/// Stop condition evaluated against the latest loop output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopCondition {
    /// Dotted path into the output.
    pub field: String,
    pub equals: Value,
}

/// Fan-out policy of a node, independent of its target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Expansion {
    /// Exactly one step.
    #[default]
    #[serde(rename = "none")]
    Single,
    /// `N` independent, concurrent steps.
    Fission { cardinality: Cardinality },
    /// Sequential steps, each seeing the previous member's output.
    Iterate { cardinality: Cardinality },
    /// Sequential steps until `until` holds or `max_iterations` is reached.
    Loop {
        max_iterations: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        until: Option<LoopCondition>,
    },
}

impl Expansion {
    /// Whether members are materialized one at a time.
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::Iterate { .. } | Self::Loop { .. })
    }
}

/// How dependent steps attach to a fanned-out prerequisite group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Every dependent waits for every member.
    #[default]
    Barrier,
    /// Dependent `i` waits for member `i` only.
    Zip,
}

// ---------------------------------------------------------------------------
// dags / nodes
// ---------------------------------------------------------------------------

/// A template graph. Sub-dags share their root's version and are never latest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRow {
    pub id: Id,
    pub name: String,
    pub title: String,
    pub version: u32,
    pub latest: bool,
    pub parent: Option<Id>,
    pub root: Id,
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDag {
    pub name: String,
    pub title: String,
    pub parent: Option<Id>,
    pub timeout_ms: Option<u64>,
}

/// A template unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: Id,
    pub dag: Id,
    pub root: Id,
    pub name: String,
    pub title: String,
    /// `None` for pass-through nodes.
    pub target: Option<NodeTarget>,
    pub expansion: Expansion,
    /// Action input key -> dotted context path.
    pub input_adapter: BTreeMap<String, String>,
    /// Output key -> dotted action-output path.
    pub output_adapter: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub dag: Id,
    pub name: String,
    pub title: String,
    pub target: Option<NodeTarget>,
    pub expansion: Expansion,
    pub input_adapter: BTreeMap<String, String>,
    pub output_adapter: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// tasks / steps
// ---------------------------------------------------------------------------

/// One instantiation of a dag or sub-dag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Id,
    pub name: String,
    pub title: String,
    pub dag: Id,
    pub parent: Option<Id>,
    pub root: Id,
    pub state: State,
    pub input: Value,
    pub output: Value,
    pub context: Value,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Seconds between start and end.
    pub duration: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub dag: Id,
    pub name: String,
    pub title: String,
    pub parent: Option<Id>,
    pub input: Value,
}

/// One instantiation of a node; one member of a fan-out group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRow {
    pub id: Id,
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub node: Id,
    pub task: Id,
    pub root: Id,
    pub state: State,
    pub input: Value,
    pub output: Value,
    pub logs: Vec<String>,
    pub error: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub fission_index: usize,
    pub fission_count: usize,
}

#[derive(Debug, Clone)]
pub struct NewStep {
    pub task: Id,
    pub node: Id,
    pub identifier: String,
    pub name: String,
    pub title: String,
    pub fission_index: usize,
    /// Seed input (fan-out item, previous iteration output).
    pub input: Value,
}

/// The fan-out group of one node inside one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupRow {
    pub task: Id,
    pub node: Id,
    /// Member step ids ordered by `fission_index`.
    pub steps: Vec<Id>,
    /// Cardinality has been decided (at least the first member exists).
    pub expanded: bool,
    /// No further member will be materialized.
    pub sealed: bool,
    /// The cardinality could not be computed; dependents never become ready.
    pub failed: bool,
}

// ---------------------------------------------------------------------------
// edges
// ---------------------------------------------------------------------------

/// Endpoint of a template edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TemplateRef {
    Node(Id),
    Dag(Id),
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "node-{id}"),
            Self::Dag(id)  => write!(f, "dag-{id}"),
        }
    }
}

/// Endpoint of a runtime edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RuntimeRef {
    Step(Id),
    Task(Id),
}

impl fmt::Display for RuntimeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step(id) => write!(f, "step-{id}"),
            Self::Task(id) => write!(f, "task-{id}"),
        }
    }
}

/// `dependent` may only start after `prerequisite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TemplateEdge {
    pub dependent: TemplateRef,
    pub prerequisite: TemplateRef,
    pub join: JoinPolicy,
}
