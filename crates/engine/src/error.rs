//! Engine-level error types.

use thiserror::Error;

use actions::FieldError;
use store::models::State;
use store::StoreError;

/// Errors produced by the engine (definition, expansion, execution).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    // ------ Lookup / validation errors ------

    /// A referenced dag, node, action, task or step does not exist.
    #[error("{kind} '{key}' does not exist")]
    ResourceNotExist { kind: &'static str, key: String },

    /// A definition or payload failed validation.
    #[error("invalid parameters: {}", join_fields(.errors))]
    ParamDefinition { errors: Vec<FieldError> },

    // ------ Structural errors ------

    /// The dependency graph of one dag level contains a cycle.
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicGraph { cycle: Vec<String> },

    /// The fan-out cardinality of a node could not be computed.
    #[error("cannot expand node '{node}': {reason}")]
    UnresolvableFanout { node: String, reason: String },

    // ------ Execution errors (recorded on entities) ------

    /// The entity was cancelled.
    #[error("{entity} revoked")]
    Revoked { entity: String },

    /// The entity's deadline elapsed while processing.
    #[error("{entity} timed out after {after_ms}ms")]
    Timeout { entity: String, after_ms: u64 },

    /// The executor reported a failure; the message is kept verbatim.
    #[error("{0}")]
    ExternalActionFailed(String),

    /// A state change the lifecycle does not allow.
    #[error("{entity} cannot move from {from} to {to}")]
    InvalidTransition { entity: String, from: State, to: State },
}

fn join_fields(errors: &[FieldError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl EngineError {
    pub fn not_exist(kind: &'static str, key: impl ToString) -> Self {
        Self::ResourceNotExist { kind, key: key.to_string() }
    }

    pub fn param(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParamDefinition { errors: vec![FieldError::new(field, message)] }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, key } => Self::ResourceNotExist { kind: entity, key },
            StoreError::Duplicate { entity, key } => Self::ParamDefinition {
                errors: vec![FieldError::new(entity, format!("'{key}' already exists"))],
            },
            StoreError::StaleState { entity, expected, actual } => Self::InvalidTransition {
                entity,
                from: actual,
                to: expected,
            },
        }
    }
}
