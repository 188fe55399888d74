//! Action registry: register and look up the actions nodes may run.

use actions::{ActionSpec, FieldError};
use tracing::info;

use store::models::ActionRow;
use store::repository::actions as action_repo;
use store::Store;

use crate::EngineError;

/// Register one action. Names are unique.
pub fn register_action(store: &Store, spec: ActionSpec) -> Result<ActionRow, EngineError> {
    let mut rows = register_actions(store, vec![spec])?;
    rows.pop().ok_or_else(|| EngineError::param("actions", "nothing registered"))
}

/// Register a batch of actions; either all are stored or none.
pub fn register_actions(store: &Store, specs: Vec<ActionSpec>) -> Result<Vec<ActionRow>, EngineError> {
    let mut errors = Vec::new();
    let mut normalized = Vec::with_capacity(specs.len());
    for (i, spec) in specs.into_iter().enumerate() {
        match spec.normalized() {
            Ok(spec) => {
                if normalized.iter().any(|s: &ActionSpec| s.name == spec.name) {
                    errors.push(FieldError::new(
                        format!("[{i}].name"),
                        format!("duplicate action '{}'", spec.name),
                    ));
                }
                normalized.push(spec);
            }
            Err(found) => errors.extend(
                found
                    .into_iter()
                    .map(|e| FieldError::new(format!("[{i}].{}", e.field), e.message)),
            ),
        }
    }
    if !errors.is_empty() {
        return Err(EngineError::ParamDefinition { errors });
    }

    let rows = store.write(|db| {
        if let Some(taken) = normalized.iter().find(|s| action_repo::find_action(db, &s.name).is_some()) {
            return Err(EngineError::param("name", format!("action '{}' already exists", taken.name)));
        }
        normalized
            .iter()
            .map(|spec| action_repo::insert_action(db, spec).map_err(EngineError::from))
            .collect::<Result<Vec<_>, _>>()
    })?;

    for row in &rows {
        info!(id = row.id, name = %row.name, kind = %row.kind, "action registered");
    }
    Ok(rows)
}

/// Every registered action, newest first.
pub fn list_actions(store: &Store) -> Vec<ActionRow> {
    store.read(|db| action_repo::list_actions(db).into_iter().cloned().collect())
}

pub fn get_action(store: &Store, name: &str) -> Result<ActionRow, EngineError> {
    store.read(|db| {
        action_repo::find_action(db, name)
            .cloned()
            .ok_or_else(|| EngineError::not_exist("action", name))
    })
}
