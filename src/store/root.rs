//! Datastore root, the immutable pointer structure locating one
//! datastore's indexes at one iteration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use std::{ffi, path};

use crate::{
    dated::DatedId,
    index::IndexKind,
    store::descriptor::{Descriptor, IndexDescriptor},
    Error, Result,
};

/// Pointer to one index: its name, index id and current manifest id.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub name: String,
    pub id: DatedId,
    pub manifest: DatedId,
}

impl IndexInfo {
    fn fresh(name: &str) -> IndexInfo {
        IndexInfo {
            name: name.to_string(),
            id: DatedId::generate(),
            manifest: DatedId::generate(),
        }
    }
}

/// Index declarations that changed while merging a descriptor, so the
/// caller can create, populate or drop the backing files.
#[derive(Clone, Debug)]
pub enum IndexChange {
    Added { kind: IndexKind, info: IndexInfo },
    Removed { kind: IndexKind, info: IndexInfo },
}

/// Immutable snapshot of one datastore at one iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreRoot {
    pub id: DatedId,
    #[serde(with = "crate::util::iso8601")]
    pub modification_date: DateTime<Utc>,
    pub descriptor: Descriptor,
    pub primary_index_manifest: IndexInfo,
    #[serde(default)]
    pub direct_index_manifests: Vec<IndexInfo>,
    #[serde(default, alias = "referenceIndexManifests")]
    pub secondary_index_manifests: Vec<IndexInfo>,
    #[serde(default)]
    pub added_indexes: Vec<DatedId>,
    #[serde(default)]
    pub removed_indexes: Vec<DatedId>,
    #[serde(default)]
    pub added_index_manifests: Vec<DatedId>,
    #[serde(default)]
    pub removed_index_manifests: Vec<DatedId>,
}

impl DatastoreRoot {
    /// Root for a brand new datastore, every declared index starts out
    /// with an empty manifest.
    pub fn new_fresh(descriptor: Descriptor) -> DatastoreRoot {
        let primary = IndexInfo::fresh("Primary");
        let direct: Vec<IndexInfo> = descriptor
            .direct_indexes
            .iter()
            .map(|d| IndexInfo::fresh(&d.name))
            .collect();
        let secondary: Vec<IndexInfo> = descriptor
            .secondary_indexes
            .iter()
            .map(|d| IndexInfo::fresh(&d.name))
            .collect();

        let mut added_indexes = vec![primary.id.clone()];
        let mut added_manifests = vec![primary.manifest.clone()];
        for info in direct.iter().chain(secondary.iter()) {
            added_indexes.push(info.id.clone());
            added_manifests.push(info.manifest.clone());
        }

        DatastoreRoot {
            id: DatedId::generate(),
            modification_date: Utc::now(),
            descriptor,
            primary_index_manifest: primary,
            direct_index_manifests: direct,
            secondary_index_manifests: secondary,
            added_indexes,
            removed_indexes: vec![],
            added_index_manifests: added_manifests,
            removed_index_manifests: vec![],
        }
    }

    /// Baseline for the next iteration, same pointers under a fresh root
    /// identity with empty delta sets.
    pub fn carried_forward(&self) -> DatastoreRoot {
        let mut root = self.clone();
        root.id = DatedId::generate();
        root.modification_date = Utc::now();
        root.added_indexes = vec![];
        root.removed_indexes = vec![];
        root.added_index_manifests = vec![];
        root.removed_index_manifests = vec![];
        root
    }

    pub fn find_index(&self, kind: IndexKind, name: &str) -> Option<&IndexInfo> {
        match kind {
            IndexKind::Primary => Some(&self.primary_index_manifest),
            IndexKind::Direct => {
                self.direct_index_manifests.iter().find(|ix| ix.name == name)
            }
            IndexKind::Reference => self
                .secondary_index_manifests
                .iter()
                .find(|ix| ix.name == name),
        }
    }

    /// Every index this root points at, primary first.
    pub fn all_indexes(&self) -> Vec<(IndexKind, IndexInfo)> {
        let mut all = vec![(IndexKind::Primary, self.primary_index_manifest.clone())];
        for info in self.direct_index_manifests.iter() {
            all.push((IndexKind::Direct, info.clone()));
        }
        for info in self.secondary_index_manifests.iter() {
            all.push((IndexKind::Reference, info.clone()));
        }
        all
    }

    /// Merge a newly declared descriptor. Indexes present in both keep
    /// their stored version field; newly declared indexes are added with
    /// empty manifests; stored indexes absent from `declared` are
    /// removed. Returns None when nothing changed.
    pub fn apply_descriptor(
        &self,
        declared: &Descriptor,
    ) -> Option<(DatastoreRoot, Vec<IndexChange>)> {
        let mut root = self.carried_forward();
        let mut changes = vec![];

        let merge = |stored: &[IndexDescriptor], declared: &[IndexDescriptor]| {
            declared
                .iter()
                .map(|d| match stored.iter().find(|s| s.name == d.name) {
                    Some(s) => {
                        IndexDescriptor::new(&d.name, &d.indexed_type, &s.version)
                    }
                    None => d.clone(),
                })
                .collect::<Vec<IndexDescriptor>>()
        };

        let descriptor = Descriptor {
            version: declared.version.clone(),
            instance_type: declared.instance_type.clone(),
            identifier_type: declared.identifier_type.clone(),
            direct_indexes: merge(&self.descriptor.direct_indexes, &declared.direct_indexes),
            secondary_indexes: merge(
                &self.descriptor.secondary_indexes,
                &declared.secondary_indexes,
            ),
        };

        for (kind, declared_names, stored_infos) in [
            (
                IndexKind::Direct,
                descriptor.direct_indexes.iter().map(|d| d.name.clone()).collect::<Vec<String>>(),
                self.direct_index_manifests.clone(),
            ),
            (
                IndexKind::Reference,
                descriptor
                    .secondary_indexes
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<String>>(),
                self.secondary_index_manifests.clone(),
            ),
        ]
        .iter()
        {
            // drop stored indexes no longer declared.
            for info in stored_infos.iter() {
                if !declared_names.contains(&info.name) {
                    match kind {
                        IndexKind::Direct => {
                            root.direct_index_manifests.retain(|ix| ix.id != info.id)
                        }
                        _ => root
                            .secondary_index_manifests
                            .retain(|ix| ix.id != info.id),
                    }
                    root.removed_indexes.push(info.id.clone());
                    root.removed_index_manifests.push(info.manifest.clone());
                    changes.push(IndexChange::Removed {
                        kind: *kind,
                        info: info.clone(),
                    });
                }
            }
            // add newly declared ones.
            for name in declared_names.iter() {
                if !stored_infos.iter().any(|ix| &ix.name == name) {
                    let info = IndexInfo::fresh(name);
                    root.added_indexes.push(info.id.clone());
                    root.added_index_manifests.push(info.manifest.clone());
                    match kind {
                        IndexKind::Direct => {
                            root.direct_index_manifests.push(info.clone())
                        }
                        _ => root.secondary_index_manifests.push(info.clone()),
                    }
                    changes.push(IndexChange::Added { kind: *kind, info });
                }
            }
        }

        let unchanged = changes.is_empty() && descriptor == self.descriptor;
        root.descriptor = descriptor;
        match unchanged {
            true => None,
            false => Some((root, changes)),
        }
    }

    /// Repoint index `index_id` at `new_manifest`. A manifest added
    /// within this same iteration and replaced again collapses out of the
    /// added set instead of lingering.
    pub fn replace_manifest(
        &mut self,
        index_id: &DatedId,
        new_manifest: DatedId,
    ) -> Result<()> {
        let info = match self.find_info_mut(index_id) {
            Some(info) => info,
            None => return err_at!(IndexNotFound, msg: "index {}", index_id),
        };
        let old = std::mem::replace(&mut info.manifest, new_manifest.clone());
        if old == new_manifest {
            return Ok(());
        }

        match self.added_index_manifests.iter().position(|id| *id == old) {
            Some(off) => {
                self.added_index_manifests.remove(off);
            }
            None => self.removed_index_manifests.push(old),
        }
        self.added_index_manifests.push(new_manifest);
        Ok(())
    }

    /// Drop index `index_id` from this root. Deleting the primary index
    /// replaces it with a fresh empty one, the primary must always exist.
    pub fn delete_index(&mut self, index_id: &DatedId) -> Result<IndexChange> {
        if self.primary_index_manifest.id == *index_id {
            let old = std::mem::replace(
                &mut self.primary_index_manifest,
                IndexInfo::fresh("Primary"),
            );
            self.forget_index(&old);
            self.added_indexes.push(self.primary_index_manifest.id.clone());
            self.added_index_manifests.push(self.primary_index_manifest.manifest.clone());
            return Ok(IndexChange::Removed {
                kind: IndexKind::Primary,
                info: old,
            });
        }

        if let Some(off) = self.direct_index_manifests.iter().position(|ix| ix.id == *index_id)
        {
            let old = self.direct_index_manifests.remove(off);
            self.forget_index(&old);
            return Ok(IndexChange::Removed {
                kind: IndexKind::Direct,
                info: old,
            });
        }
        if let Some(off) = self
            .secondary_index_manifests
            .iter()
            .position(|ix| ix.id == *index_id)
        {
            let old = self.secondary_index_manifests.remove(off);
            self.forget_index(&old);
            return Ok(IndexChange::Removed {
                kind: IndexKind::Reference,
                info: old,
            });
        }
        err_at!(IndexNotFound, msg: "index {}", index_id)
    }

    // account a dropped index in the delta sets, collapsing same
    // iteration additions.
    fn forget_index(&mut self, info: &IndexInfo) {
        match self.added_indexes.iter().position(|id| *id == info.id) {
            Some(off) => {
                self.added_indexes.remove(off);
            }
            None => self.removed_indexes.push(info.id.clone()),
        }
        match self
            .added_index_manifests
            .iter()
            .position(|id| *id == info.manifest)
        {
            Some(off) => {
                self.added_index_manifests.remove(off);
            }
            None => self.removed_index_manifests.push(info.manifest.clone()),
        }
    }

    fn find_info_mut(&mut self, index_id: &DatedId) -> Option<&mut IndexInfo> {
        if self.primary_index_manifest.id == *index_id {
            return Some(&mut self.primary_index_manifest);
        }
        self.direct_index_manifests
            .iter_mut()
            .chain(self.secondary_index_manifests.iter_mut())
            .find(|ix| ix.id == *index_id)
    }
}

/// Compose the location of a root file under its datastore directory.
pub fn to_root_location(datastore_dir: &ffi::OsStr, id: &DatedId) -> ffi::OsString {
    let mut loc = path::PathBuf::from(datastore_dir.to_os_string());
    loc.push("Root");
    loc.push(format!("{}.json", id));
    loc.into_os_string()
}

#[cfg(test)]
#[path = "root_test.rs"]
mod root_test;
