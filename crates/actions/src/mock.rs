//! `MockExecutor`: a test double for `Executor`.
//!
//! Useful in unit and integration tests where a real action runner is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{ActionError, ActionOutput, DispatchRequest, Executor};

/// Behaviour injected into `MockExecutor` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value (merged with `{"step": <identifier>}`).
    ReturnValue(Value),
    /// Return the dispatched input unchanged.
    Echo,
    /// Return the n-th value on the n-th call; the last one repeats.
    Sequence(Vec<Value>),
    /// Fail with the given message.
    Fail(String),
    /// Block until cancelled.
    Hang,
    /// Block until `gate` is cancelled (released), then return the value.
    Gated { gate: CancellationToken, value: Value },
}

/// A mock executor that records every dispatch it receives and returns a
/// programmer-specified result.
pub struct MockExecutor {
    /// What the executor will do when `dispatch` is called.
    pub behaviour: MockBehaviour,
    /// All requests seen by this executor (in call order).
    pub calls: Arc<Mutex<Vec<DispatchRequest>>>,
}

impl MockExecutor {
    fn with(behaviour: MockBehaviour) -> Self {
        Self { behaviour, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self::with(MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that returns its input.
    pub fn echo() -> Self {
        Self::with(MockBehaviour::Echo)
    }

    /// Create a mock that returns `values` in order.
    pub fn sequence(values: Vec<Value>) -> Self {
        Self::with(MockBehaviour::Sequence(values))
    }

    /// Create a mock that always fails.
    pub fn failing(msg: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Fail(msg.into()))
    }

    /// Create a mock that never finishes unless cancelled.
    pub fn hanging() -> Self {
        Self::with(MockBehaviour::Hang)
    }

    /// Create a mock that waits for `gate` before returning `value`.
    pub fn gated(gate: CancellationToken, value: Value) -> Self {
        Self::with(MockBehaviour::Gated { gate, value })
    }

    /// Number of dispatches received so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Identifiers of the dispatched steps, in call order.
    pub fn identifiers(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|r| r.identifier.clone()).collect()
    }

    /// Inputs of the dispatched steps, in call order.
    pub fn inputs(&self) -> Vec<Value> {
        self.calls.lock().unwrap().iter().map(|r| r.input.clone()).collect()
    }
}

fn tagged(request: &DispatchRequest, v: &Value) -> Value {
    // Merge the value with the step identifier so tests can trace the data
    // flowing through the graph.
    let mut out = json!({ "step": request.identifier });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
        out
    } else {
        v.clone()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ActionOutput, ActionError> {
        let call_index = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(request.clone());
            calls.len() - 1
        };

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(ActionOutput::new(tagged(request, v))
                .with_logs(vec![format!("{} done", request.identifier)])),
            MockBehaviour::Echo => Ok(ActionOutput::new(request.input.clone())),
            MockBehaviour::Sequence(values) => {
                let v = values
                    .get(call_index)
                    .or_else(|| values.last())
                    .cloned()
                    .unwrap_or(Value::Null);
                Ok(ActionOutput::new(v))
            }
            MockBehaviour::Fail(msg) => Err(ActionError::Failed(msg.clone())),
            MockBehaviour::Hang => {
                cancel.cancelled().await;
                Err(ActionError::Cancelled)
            }
            MockBehaviour::Gated { gate, value } => {
                gate.cancelled().await;
                if cancel.is_cancelled() {
                    return Err(ActionError::Cancelled);
                }
                Ok(ActionOutput::new(tagged(request, value)))
            }
        }
    }
}
