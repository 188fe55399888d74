//! JSON-schema checks for action inputs and outputs.
//!
//! Schemas are plain JSON Schema documents. `null` means "no schema" and
//! accepts every instance.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Field path: a DSL path like `components[1].name` or a JSON pointer like `/code`.
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.field.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.field, self.message)
        }
    }
}

/// Check that `schema` compiles.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    if schema.is_null() {
        return Ok(());
    }
    jsonschema::validator_for(schema)
        .map(|_| ())
        .map_err(|e| e.to_string())
}

/// Validate `instance` against `schema`, collecting every violation.
pub fn validate(schema: &Value, instance: &Value) -> Result<(), Vec<FieldError>> {
    if schema.is_null() {
        return Ok(());
    }

    let validator = jsonschema::validator_for(schema)
        .map_err(|e| vec![FieldError::new("", format!("invalid schema: {e}"))])?;

    let errors: Vec<FieldError> = validator
        .iter_errors(instance)
        .map(|e| FieldError::new(e.instance_path.to_string(), e.to_string()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn code_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "code": { "type": "string" } },
            "required": ["code"]
        })
    }

    #[test]
    fn null_schema_accepts_anything() {
        assert!(validate(&Value::Null, &json!([1, 2, 3])).is_ok());
        assert!(check_schema(&Value::Null).is_ok());
    }

    #[test]
    fn valid_instance_passes() {
        assert!(validate(&code_schema(), &json!({ "code": "print(1)" })).is_ok());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let errors = validate(&code_schema(), &json!({})).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("code"));
    }

    #[test]
    fn wrong_type_points_at_the_field() {
        let errors = validate(&code_schema(), &json!({ "code": 7 })).unwrap_err();
        assert_eq!(errors[0].field, "/code");
    }

    #[test]
    fn broken_schema_does_not_compile() {
        assert!(check_schema(&json!({ "type": "nonsense" })).is_err());
    }
}
