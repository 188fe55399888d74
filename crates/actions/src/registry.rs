//! Routes dispatches to per-action executor implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ActionError, ActionOutput, DispatchRequest, Executor};

/// Maps action names to `Executor` implementations, with an optional
/// fallback for actions that have no dedicated handler.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    handlers: HashMap<String, Arc<dyn Executor>>,
    fallback: Option<Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `action`, replacing any previous one.
    pub fn register(mut self, action: impl Into<String>, handler: Arc<dyn Executor>) -> Self {
        self.handlers.insert(action.into(), handler);
        self
    }

    /// Handler used when no dedicated handler matches.
    pub fn with_fallback(mut self, handler: Arc<dyn Executor>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action) || self.fallback.is_some()
    }
}

#[async_trait]
impl Executor for ExecutorRegistry {
    async fn dispatch(
        &self,
        request: &DispatchRequest,
        cancel: CancellationToken,
    ) -> Result<ActionOutput, ActionError> {
        let handler = self
            .handlers
            .get(&request.action)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                ActionError::Failed(format!(
                    "no executor registered for action '{}'",
                    request.action
                ))
            })?;

        debug!(step = %request.identifier, action = %request.action, "routing dispatch");
        handler.dispatch(request, cancel).await
    }
}
