//! The `Executor` trait: the outbound contract for running an action.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{ActionError, ActionKind};

/// Everything an executor needs to run one step.
///
/// Defined here (in the actions crate) so both the engine and executor
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Numeric id of the step being executed.
    pub step_id: u64,
    /// Step identifier, unique within its fan-out group (`build-2`).
    pub identifier: String,
    /// Task that owns the step.
    pub task_id: u64,
    /// Root task of the execution tree.
    pub root_task_id: u64,
    /// Registered action name.
    pub action: String,
    pub kind: ActionKind,
    /// Resolved input, already validated against the action's input schema.
    pub input: Value,
}

/// Successful result of one dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    pub output: Value,
    /// Log lines produced while running, in order.
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ActionOutput {
    pub fn new(output: Value) -> Self {
        Self { output, logs: Vec::new() }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

/// The external collaborator that performs an action's side effects.
///
/// `cancel` is a best-effort signal: implementations should stop early and
/// return [`ActionError::Cancelled`] when it fires, but the engine ignores
/// any response that arrives after the step has been revoked or timed out.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ActionOutput, ActionError>;
}
