//! Snapshot iteration, the immutable record of one committed
//! transaction.
//!
//! Iterations chain through `precedingIteration` and
//! `successiveIterations` pointers, forming the history graph that
//! powers undo, concurrent readers and the pruner. The successor list is
//! the single field rewritten in place, appended when a branch is
//! created off an already committed iteration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::{collections::BTreeMap, ffi, path};

use crate::dated::DatedId;

/// Pointer to one datastore as of one iteration.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreRef {
    /// Rendered datastore key, `{name}-{token:016X}`.
    pub key: String,
    /// Datastore id.
    pub id: DatedId,
    /// Current root id.
    pub root: DatedId,
}

/// One committed transaction's snapshot of the world.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotIteration {
    pub id: DatedId,
    #[serde(with = "crate::util::iso8601")]
    pub creation_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preceding_iteration: Option<DatedId>,
    #[serde(default)]
    pub successive_iterations: Vec<DatedId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
    /// Map from datastore name to its pointers.
    #[serde(default)]
    pub data_stores: BTreeMap<String, DatastoreRef>,
    #[serde(default)]
    pub added_datastores: Vec<DatedId>,
    #[serde(default)]
    pub removed_datastores: Vec<DatedId>,
    #[serde(default)]
    pub added_datastore_roots: Vec<DatedId>,
    #[serde(default)]
    pub removed_datastore_roots: Vec<DatedId>,
}

impl SnapshotIteration {
    /// The iteration a fresh snapshot starts from, empty world, no
    /// predecessor.
    pub fn new_initial(action_name: Option<&str>) -> SnapshotIteration {
        SnapshotIteration {
            id: DatedId::generate(),
            creation_date: Utc::now(),
            preceding_iteration: None,
            successive_iterations: vec![],
            action_name: action_name.map(|name| name.to_string()),
            data_stores: BTreeMap::new(),
            added_datastores: vec![],
            removed_datastores: vec![],
            added_datastore_roots: vec![],
            removed_datastore_roots: vec![],
        }
    }

    /// Start a successor of this iteration, same world, empty delta sets.
    /// The commit fills in the deltas and appends the new id to this
    /// iteration's successor list.
    pub fn successor(&self, action_name: Option<&str>) -> SnapshotIteration {
        SnapshotIteration {
            id: DatedId::generate(),
            creation_date: Utc::now(),
            preceding_iteration: Some(self.id.clone()),
            successive_iterations: vec![],
            action_name: action_name.map(|name| name.to_string()),
            data_stores: self.data_stores.clone(),
            added_datastores: vec![],
            removed_datastores: vec![],
            added_datastore_roots: vec![],
            removed_datastore_roots: vec![],
        }
    }
}

/// Compose the location of an iteration file under its snapshot
/// directory, nested into dated sub-directories.
pub fn to_iteration_location(snapshot_dir: &ffi::OsStr, id: &DatedId) -> ffi::OsString {
    let [y, md, hm] = id.to_dated_dirs();
    let mut loc = path::PathBuf::from(snapshot_dir.to_os_string());
    loc.push("Iterations");
    loc.push(y);
    loc.push(md);
    loc.push(hm);
    loc.push(format!("{}.json", id));
    loc.into_os_string()
}

#[cfg(test)]
#[path = "iteration_test.rs"]
mod iteration_test;
