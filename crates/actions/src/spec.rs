//! Action definitions: the catalog entries the registry holds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{self, FieldError};

/// How an action is carried out. Purely descriptive for the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Runs in-process on a worker.
    #[default]
    Default,
    /// Carries data between steps without side effects.
    Carrier,
    /// Calls out to an external service.
    External,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default  => write!(f, "default"),
            Self::Carrier  => write!(f, "carrier"),
            Self::External => write!(f, "external"),
        }
    }
}

/// A named, schema-typed capability that nodes may reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub name: String,
    /// Defaults to `name` when omitted or empty.
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "type")]
    pub kind: ActionKind,
    /// JSON Schema for the resolved step input. `null` accepts anything.
    #[serde(default)]
    pub input_schema: Value,
    /// JSON Schema for the action output. `null` accepts anything.
    #[serde(default)]
    pub output_schema: Value,
}

impl ActionSpec {
    /// Convenience constructor with permissive schemas.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            title: name.clone(),
            name,
            kind: ActionKind::Default,
            input_schema: Value::Null,
            output_schema: Value::Null,
        }
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    /// Fill defaults and check the definition, collecting every field error.
    pub fn normalized(mut self) -> Result<Self, Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push(FieldError::new("name", "action name must not be empty"));
        }
        if self.title.trim().is_empty() {
            self.title = self.name.clone();
        }
        if let Err(e) = schema::check_schema(&self.input_schema) {
            errors.push(FieldError::new("input_schema", e));
        }
        if let Err(e) = schema::check_schema(&self.output_schema) {
            errors.push(FieldError::new("output_schema", e));
        }

        if errors.is_empty() {
            Ok(self)
        } else {
            Err(errors)
        }
    }
}
