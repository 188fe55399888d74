//! Action catalog operations.

use chrono::Utc;

use ::actions::ActionSpec;

use crate::models::{ActionRow, Id};
use crate::store::Sequences;
use crate::{Db, StoreError};

/// Insert a registered action. Names are unique.
pub fn insert_action(db: &mut Db, spec: &ActionSpec) -> Result<ActionRow, StoreError> {
    if db.action_names.contains_key(&spec.name) {
        return Err(StoreError::Duplicate { entity: "action", key: spec.name.clone() });
    }

    let id = Sequences::next(&mut db.seq.action);
    let row = ActionRow {
        id,
        name: spec.name.clone(),
        title: spec.title.clone(),
        kind: spec.kind,
        input_schema: spec.input_schema.clone(),
        output_schema: spec.output_schema.clone(),
        created_at: Utc::now(),
    };

    db.action_names.insert(row.name.clone(), id);
    db.actions.insert(id, row.clone());
    Ok(row)
}

pub fn get_action(db: &Db, id: Id) -> Result<&ActionRow, StoreError> {
    db.actions.get(&id).ok_or_else(|| StoreError::not_found("action", id))
}

/// Look an action up by its unique name.
pub fn find_action<'a>(db: &'a Db, name: &str) -> Option<&'a ActionRow> {
    db.action_names.get(name).and_then(|id| db.actions.get(id))
}

/// All actions, newest first.
pub fn list_actions(db: &Db) -> Vec<&ActionRow> {
    db.actions.values().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    #[test]
    fn names_are_unique() {
        let store = Store::open();
        store.write(|db| {
            insert_action(db, &ActionSpec::new("python_script")).unwrap();
            let err = insert_action(db, &ActionSpec::new("python_script")).unwrap_err();
            assert!(matches!(err, StoreError::Duplicate { entity: "action", .. }));
        });
    }

    #[test]
    fn lookup_by_name_and_listing_order() {
        let store = Store::open();
        store.write(|db| {
            insert_action(db, &ActionSpec::new("python_script")).unwrap();
            insert_action(db, &ActionSpec::new("bash_script")).unwrap();
        });
        store.read(|db| {
            assert_eq!(find_action(db, "bash_script").unwrap().id, 2);
            assert!(find_action(db, "ruby_script").is_none());
            let names: Vec<_> = list_actions(db).iter().map(|a| a.name.as_str()).collect();
            assert_eq!(names, vec!["bash_script", "python_script"]);
        });
    }
}
