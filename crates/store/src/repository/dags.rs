//! Dag versioning and lookup.

use chrono::Utc;

use crate::models::{DagRow, Id, NewDag};
use crate::store::Sequences;
use crate::{Db, StoreError};

/// Insert a new version of the root dag `new.name`.
///
/// The version is one past the highest existing version of that name, the
/// previous latest loses its flag and the new row gains it. Runs inside a
/// single write so no reader ever sees zero or two latest rows.
pub fn insert_version(db: &mut Db, new: NewDag) -> DagRow {
    let id = Sequences::next(&mut db.seq.dag);
    let versions = db.dag_versions.entry(new.name.clone()).or_default();

    let mut version = 1;
    if let Some(prev_id) = versions.last().copied() {
        if let Some(prev) = db.dags.get_mut(&prev_id) {
            version = prev.version + 1;
            prev.latest = false;
        }
    }
    versions.push(id);

    let row = DagRow {
        id,
        name: new.name,
        title: new.title,
        version,
        latest: true,
        parent: None,
        root: id,
        timeout_ms: new.timeout_ms,
        created_at: Utc::now(),
    };
    db.dags.insert(id, row.clone());
    row
}

/// Insert a sub-dag under `new.parent`. Its root and version come from the parent.
pub fn insert_sub_dag(db: &mut Db, new: NewDag) -> Result<DagRow, StoreError> {
    let parent_id = new
        .parent
        .ok_or_else(|| StoreError::not_found("dag", "<parent>"))?;
    let parent = get_dag(db, parent_id)?;
    let (root, version) = (parent.root, parent.version);

    let id = Sequences::next(&mut db.seq.dag);
    let row = DagRow {
        id,
        name: new.name,
        title: new.title,
        version,
        latest: false,
        parent: Some(parent_id),
        root,
        timeout_ms: new.timeout_ms,
        created_at: Utc::now(),
    };
    db.dag_children.entry(parent_id).or_default().push(id);
    db.dags.insert(id, row.clone());
    Ok(row)
}

pub fn get_dag(db: &Db, id: Id) -> Result<&DagRow, StoreError> {
    db.dags.get(&id).ok_or_else(|| StoreError::not_found("dag", id))
}

/// The version of `name` currently flagged latest.
pub fn get_latest<'a>(db: &'a Db, name: &str) -> Result<&'a DagRow, StoreError> {
    db.dag_versions
        .get(name)
        .and_then(|ids| ids.last())
        .and_then(|id| db.dags.get(id))
        .ok_or_else(|| StoreError::not_found("dag", name))
}

/// Every version of `name`, oldest first.
pub fn list_versions<'a>(db: &'a Db, name: &str) -> Vec<&'a DagRow> {
    db.dag_versions
        .get(name)
        .map(|ids| ids.iter().filter_map(|id| db.dags.get(id)).collect())
        .unwrap_or_default()
}

/// Root dags only, newest first.
pub fn list_root_dags(db: &Db) -> Vec<&DagRow> {
    db.dags.values().rev().filter(|d| d.parent.is_none()).collect()
}

/// Direct sub-dags of `parent`, in creation order.
pub fn sub_dags(db: &Db, parent: Id) -> Vec<&DagRow> {
    db.dag_children
        .get(&parent)
        .map(|ids| ids.iter().filter_map(|id| db.dags.get(id)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Store;

    fn new_dag(name: &str, parent: Option<Id>) -> NewDag {
        NewDag { name: name.into(), title: name.into(), parent, timeout_ms: None }
    }

    #[test]
    fn new_version_takes_over_latest_flag() {
        let store = Store::open();
        let (v1, v2) = store.write(|db| {
            let v1 = insert_version(db, new_dag("pipeline", None));
            let v2 = insert_version(db, new_dag("pipeline", None));
            (v1, v2)
        });
        assert_eq!((v1.version, v2.version), (1, 2));

        store.read(|db| {
            let versions = list_versions(db, "pipeline");
            assert_eq!(versions.len(), 2);
            assert_eq!(versions.iter().filter(|d| d.latest).count(), 1);
            assert_eq!(get_latest(db, "pipeline").unwrap().id, v2.id);
            assert!(!get_dag(db, v1.id).unwrap().latest);
        });
    }

    #[test]
    fn versions_are_per_name() {
        let store = Store::open();
        store.write(|db| {
            insert_version(db, new_dag("pipeline", None));
            let other = insert_version(db, new_dag("ml_workflow", None));
            assert_eq!(other.version, 1);
            assert!(other.latest);
        });
    }

    #[test]
    fn sub_dag_inherits_root_and_version() {
        let store = Store::open();
        store.write(|db| {
            insert_version(db, new_dag("build", None));
            let root = insert_version(db, new_dag("build", None));
            let child = insert_sub_dag(db, new_dag("package", Some(root.id))).unwrap();
            let grandchild = insert_sub_dag(db, new_dag("sign", Some(child.id))).unwrap();

            assert_eq!(grandchild.root, root.id);
            assert_eq!(grandchild.version, 2);
            assert!(!grandchild.latest);
            assert_eq!(sub_dags(db, root.id).len(), 1);
            assert_eq!(list_root_dags(db).len(), 2);
        });
    }

    #[test]
    fn missing_latest_is_not_found() {
        let store = Store::open();
        store.read(|db| {
            assert!(matches!(
                get_latest(db, "nope"),
                Err(StoreError::NotFound { entity: "dag", .. })
            ));
        });
    }
}
