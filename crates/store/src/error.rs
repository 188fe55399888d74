//! Typed error type for the store crate.

use thiserror::Error;

use crate::models::State;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{entity} '{key}' not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} '{key}' already exists")]
    Duplicate { entity: &'static str, key: String },

    /// A compare-and-set state update lost a race.
    #[error("{entity} is {actual}, expected {expected}")]
    StaleState {
        entity: String,
        expected: State,
        actual: State,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound { entity, key: key.to_string() }
    }
}
