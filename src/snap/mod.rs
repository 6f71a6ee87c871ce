//! Module `snap` implement the snapshot, one history of iterations
//! within a persistence.
//!
//! A snapshot directory holds its `Manifest.json` naming the current
//! iteration, the `Iterations/` history, the `Datastores/` payload, an
//! `Inbox/` drop zone reserved for external writers and, while a cleanup
//! is in flight, the `Dirty` marker file. Normal snapshots are subject to
//! retention trimming; backup snapshots are user-pinned copies under
//! `Backups/` and never trimmed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::{cell::RefCell, collections::HashSet, ffi, fmt, fs, path, result};

use crate::{dated::DatedId, util, Error, Result};

pub mod iteration;

pub use iteration::{to_iteration_location, DatastoreRef, SnapshotIteration};

/// A snapshot directory is named by its dated identifier,
/// `format!("{}.snapshot", id)`.
#[derive(Clone)]
pub struct SnapshotDirName(pub ffi::OsString);

impl From<DatedId> for SnapshotDirName {
    fn from(id: DatedId) -> SnapshotDirName {
        let dir_name = format!("{}.snapshot", id);
        SnapshotDirName(AsRef::<ffi::OsStr>::as_ref(&dir_name).to_os_string())
    }
}

impl From<SnapshotDirName> for ffi::OsString {
    fn from(name: SnapshotDirName) -> ffi::OsString {
        name.0
    }
}

impl fmt::Display for SnapshotDirName {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// Compose the directory of one snapshot under the `Snapshots/` (or
/// `Backups/`) root, nested into dated sub-directories.
pub fn to_snapshot_dir(snapshots_root: &ffi::OsStr, id: &DatedId) -> ffi::OsString {
    let [y, md, hm] = id.to_dated_dirs();
    let dir_name: ffi::OsString = SnapshotDirName::from(id.clone()).into();
    let mut loc = path::PathBuf::from(snapshots_root.to_os_string());
    loc.push(y);
    loc.push(md);
    loc.push(hm);
    loc.push(dir_name);
    loc.into_os_string()
}

/// Normal snapshots auto-trim under retention; backups are user-pinned.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum SnapshotKind {
    Normal,
    Backup,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotManifest {
    pub version: String,
    pub id: DatedId,
    #[serde(with = "crate::util::iso8601")]
    pub modification_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_iteration: Option<DatedId>,
}

thread_local! {
    // snapshots this thread is currently updating, reentrancy guard.
    static UPDATING: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// One history of iterations.
pub struct Snapshot {
    token: u64,
    dir: ffi::OsString,
    kind: SnapshotKind,
    manifest: SnapshotManifest,
    cached: Option<SnapshotIteration>,
}

impl Snapshot {
    /// Create a fresh snapshot under `snapshots_root`, with its manifest
    /// and the fixed directory skeleton.
    pub fn create(
        snapshots_root: &ffi::OsStr,
        id: DatedId,
        kind: SnapshotKind,
    ) -> Result<Snapshot> {
        let dir = to_snapshot_dir(snapshots_root, &id);
        for sub in ["Iterations", "Datastores", "Inbox"].iter() {
            let mut loc = path::PathBuf::from(&dir);
            loc.push(sub);
            err_at!(IOError, fs::create_dir_all(&loc))?;
        }

        let manifest = SnapshotManifest {
            version: crate::persist::info::FORMAT_VERSION.to_string(),
            id: id.clone(),
            modification_date: Utc::now(),
            current_iteration: None,
        };
        let snapshot = Snapshot {
            token: rand::random::<u64>(),
            dir,
            kind,
            manifest,
            cached: None,
        };
        util::save_json(&snapshot.manifest_location(), &snapshot.manifest)?;
        log::info!("created {:?} snapshot {}", kind, id);
        Ok(snapshot)
    }

    /// Load the snapshot at `dir`.
    pub fn load(dir: &ffi::OsStr, kind: SnapshotKind) -> Result<Snapshot> {
        let mut snapshot = Snapshot {
            token: rand::random::<u64>(),
            dir: dir.to_os_string(),
            kind,
            manifest: SnapshotManifest {
                version: crate::persist::info::FORMAT_VERSION.to_string(),
                id: DatedId::generate(),
                modification_date: Utc::now(),
                current_iteration: None,
            },
            cached: None,
        };
        snapshot.manifest = util::load_json(&snapshot.manifest_location())?;
        Ok(snapshot)
    }

    pub fn to_id(&self) -> DatedId {
        self.manifest.id.clone()
    }

    pub fn to_kind(&self) -> SnapshotKind {
        self.kind
    }

    pub fn as_dir(&self) -> &ffi::OsStr {
        &self.dir
    }

    pub fn datastores_dir(&self) -> ffi::OsString {
        let mut loc = path::PathBuf::from(&self.dir);
        loc.push("Datastores");
        loc.into_os_string()
    }

    fn manifest_location(&self) -> ffi::OsString {
        let mut loc = path::PathBuf::from(&self.dir);
        loc.push("Manifest.json");
        loc.into_os_string()
    }

    fn dirty_location(&self) -> path::PathBuf {
        let mut loc = path::PathBuf::from(&self.dir);
        loc.push("Dirty");
        loc
    }

    /// The `Dirty` marker is present while a cleanup sweep is in flight;
    /// finding it on open means the previous sweep did not finish.
    pub fn is_dirty(&self) -> bool {
        self.dirty_location().is_file()
    }

    pub fn set_dirty(&self, on: bool) -> Result<()> {
        let loc = self.dirty_location();
        match on {
            true => err_at!(IOError, fs::write(&loc, b""))?,
            false => {
                fs::remove_file(&loc).ok();
            }
        }
        Ok(())
    }

    /// Serialized mutation of this snapshot's state. Re-entering from
    /// inside the closure is a bug in the caller and raises
    /// `NestedSnapshotWrite`.
    pub fn update<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Snapshot) -> Result<T>,
    {
        let token = self.token;
        let entered = UPDATING.with(|set| set.borrow_mut().insert(token));
        if !entered {
            return err_at!(NestedSnapshotWrite, msg: "snapshot {}", self.manifest.id);
        }
        let res = f(self);
        UPDATING.with(|set| set.borrow_mut().remove(&token));
        res
    }

    /// Shared read access; nested reads from inside an update see the
    /// same in-memory copy and must not mutate.
    pub fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Snapshot) -> Result<T>,
    {
        f(self)
    }

    pub fn to_current_iteration_id(&self) -> Option<DatedId> {
        self.manifest.current_iteration.clone()
    }

    /// Currently referenced iteration, cached after the first load.
    pub fn current_iteration(&mut self) -> Result<Option<SnapshotIteration>> {
        let id = match &self.manifest.current_iteration {
            Some(id) => id.clone(),
            None => return Ok(None),
        };
        if let Some(cached) = &self.cached {
            if cached.id == id {
                return Ok(Some(cached.clone()));
            }
        }
        let iteration = self.load_iteration(&id)?;
        self.cached = Some(iteration.clone());
        Ok(Some(iteration))
    }

    pub fn load_iteration(&self, id: &DatedId) -> Result<SnapshotIteration> {
        util::load_json(&to_iteration_location(&self.dir, id))
    }

    /// Record a freshly committed iteration: write its file, append it to
    /// the predecessor's successor list, then repoint the manifest. The
    /// manifest rewrite is the single commit point.
    pub fn commit_iteration(&mut self, iteration: SnapshotIteration) -> Result<()> {
        util::save_json(&to_iteration_location(&self.dir, &iteration.id), &iteration)?;

        if let Some(prev_id) = &iteration.preceding_iteration {
            let mut prev = self.load_iteration(prev_id)?;
            if !prev.successive_iterations.contains(&iteration.id) {
                prev.successive_iterations.push(iteration.id.clone());
                util::save_json(&to_iteration_location(&self.dir, prev_id), &prev)?;
            }
        }

        self.manifest.current_iteration = Some(iteration.id.clone());
        self.manifest.modification_date = Utc::now();
        util::save_json(&self.manifest_location(), &self.manifest)?;
        self.cached = Some(iteration);
        Ok(())
    }

    /// Full logical copy of this snapshot under `dest_root`, as a
    /// stream-copy of every file, registered under `new_id`.
    pub fn copy_to(&self, dest_root: &ffi::OsStr, new_id: DatedId) -> Result<Snapshot> {
        let dest_dir = to_snapshot_dir(dest_root, &new_id);
        let src_root = path::PathBuf::from(&self.dir);

        util::walk(&src_root, &mut |loc: &path::Path, is_dir: bool| {
            let rel = match loc.strip_prefix(&src_root) {
                Ok(rel) => rel.to_path_buf(),
                Err(_) => return err_at!(Fatal, msg: "walk escaped {:?}", loc),
            };
            let mut dest = path::PathBuf::from(&dest_dir);
            dest.push(rel);
            if is_dir {
                err_at!(IOError, fs::create_dir_all(&dest))?;
            } else {
                if let Some(parent) = dest.parent() {
                    err_at!(IOError, fs::create_dir_all(parent))?;
                }
                err_at!(IOError, fs::copy(loc, &dest), "copy {:?}", loc)?;
            }
            Ok(())
        })?;

        let mut copy = Snapshot::load(&dest_dir, SnapshotKind::Backup)?;
        copy.manifest.id = new_id;
        copy.manifest.modification_date = Utc::now();
        util::save_json(&copy.manifest_location(), &copy.manifest)?;
        Ok(copy)
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
