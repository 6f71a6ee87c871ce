//! Retention policy and the prune sweep.
//!
//! A policy is a predicate over `(iteration, distance-from-current)`
//! deciding which iterations may be trimmed off the far end of the
//! history chain. The sweep then deletes every root, manifest and page
//! named in the removed sets encountered while walking from the oldest
//! still-retained iteration backward, plus dead branches rooted in the
//! pruned range. Files referenced by any retained iteration, or pinned by
//! a live reader, are never touched, and a second sweep over the same
//! state deletes nothing.

use chrono::Utc;

use std::{collections::HashSet, ffi, fs, path, time};

use crate::{
    dated::DatedId,
    index::{manifest, IndexManifest},
    page,
    snap::{to_iteration_location, Snapshot, SnapshotIteration},
    store::{root, DatastoreRoot},
    util, Result,
};

/// Decides which iterations may be pruned.
#[derive(Clone, Debug)]
pub enum RetentionPolicy {
    /// Retain nothing beyond the current iteration.
    None,
    /// Never prune.
    Indefinite,
    /// Retain the last `n` iterations behind the current one.
    TransactionCount(usize),
    /// Retain iterations younger than the given age.
    Duration(time::Duration),
    /// Prune only when both policies agree.
    Both(Box<RetentionPolicy>, Box<RetentionPolicy>),
    /// Prune when either policy agrees.
    Either(Box<RetentionPolicy>, Box<RetentionPolicy>),
}

impl<'a> arbitrary::Arbitrary<'a> for RetentionPolicy {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        let policy = match u.arbitrary::<u8>()? % 4 {
            0 => RetentionPolicy::None,
            1 => RetentionPolicy::Indefinite,
            2 => RetentionPolicy::TransactionCount(*u.choose(&[1, 3, 10, 100])?),
            _ => RetentionPolicy::Duration(time::Duration::from_secs(
                *u.choose(&[1, 60, 3600, 86400])?,
            )),
        };
        Ok(policy)
    }
}

impl RetentionPolicy {
    /// Whether `iteration`, sitting `distance` steps behind the current
    /// one, may be pruned. The current iteration itself never is.
    pub fn should_prune(&self, iteration: &SnapshotIteration, distance: usize) -> bool {
        if distance == 0 {
            return false;
        }
        match self {
            RetentionPolicy::None => true,
            RetentionPolicy::Indefinite => false,
            RetentionPolicy::TransactionCount(n) => distance > *n,
            RetentionPolicy::Duration(keep) => {
                let age = Utc::now()
                    .signed_duration_since(iteration.creation_date)
                    .to_std()
                    .unwrap_or(time::Duration::from_secs(0));
                age > *keep
            }
            RetentionPolicy::Both(a, b) => {
                a.should_prune(iteration, distance) && b.should_prune(iteration, distance)
            }
            RetentionPolicy::Either(a, b) => {
                a.should_prune(iteration, distance) || b.should_prune(iteration, distance)
            }
        }
    }
}

/// What one sweep removed.
#[derive(Clone, Default, Debug)]
pub struct PruneStats {
    pub n_iterations: usize,
    pub n_roots: usize,
    pub n_manifests: usize,
    pub n_pages: usize,
    pub n_indexes: usize,
    pub n_datastores: usize,
}

impl PruneStats {
    pub fn is_empty(&self) -> bool {
        self.n_iterations == 0
            && self.n_roots == 0
            && self.n_manifests == 0
            && self.n_pages == 0
            && self.n_indexes == 0
            && self.n_datastores == 0
    }
}

// files and directories one sweep will delete, collected up front so the
// read phase never observes its own deletions.
#[derive(Default)]
struct Doomed {
    roots: Vec<ffi::OsString>,
    manifests: Vec<ffi::OsString>,
    pages: Vec<ffi::OsString>,
    index_dirs: Vec<ffi::OsString>,
    datastore_dirs: Vec<ffi::OsString>,
    iterations: Vec<DatedId>,
}

/// Evaluate `policy` over the iteration chain of `snapshot` and delete
/// whatever fell out of retention. `pinned` holds iteration ids currently
/// served to readers; they and everything newer stay.
pub fn sweep(
    snapshot: &mut Snapshot,
    policy: &RetentionPolicy,
    pinned: &HashSet<DatedId>,
) -> Result<PruneStats> {
    let current = match snapshot.current_iteration()? {
        Some(current) => current,
        None => return Ok(PruneStats::default()),
    };

    // the chain, current first, oldest last. A missing predecessor file
    // terminates the walk, it only means the chain was trimmed before.
    let mut chain = vec![current];
    loop {
        let prev_id = match &chain.last().unwrap().preceding_iteration {
            Some(prev_id) => prev_id.clone(),
            None => break,
        };
        match snapshot.load_iteration(&prev_id) {
            Ok(prev) => chain.push(prev),
            Err(_) => break,
        }
    }

    let mut cut = chain.len();
    for (distance, iteration) in chain.iter().enumerate() {
        if policy.should_prune(iteration, distance) {
            cut = distance;
            break;
        }
    }
    // a reader pinned deep in history extends retention past it.
    for distance in cut..chain.len() {
        if pinned.contains(&chain[distance].id) {
            cut = distance + 1;
        }
    }

    // read phase: walk from the oldest retained iteration backward,
    // collecting everything the removed sets name.
    let mut doomed = Doomed::default();
    if cut < chain.len() {
        for distance in (cut - 1)..chain.len() {
            let predecessor = chain.get(distance + 1);
            collect_removed(snapshot, &chain[distance], predecessor, &mut doomed)?;
        }
        for distance in cut..chain.len() {
            let keep: HashSet<DatedId> = match distance {
                0 => HashSet::new(),
                _ => [chain[distance - 1].id.clone()].iter().cloned().collect(),
            };
            collect_dead_branches(snapshot, &chain[distance], &keep, &mut doomed)?;
            doomed.iterations.push(chain[distance].id.clone());
        }
    }

    // delete phase, under the dirty marker.
    snapshot.set_dirty(true)?;
    let mut stats = delete_doomed(snapshot, doomed)?;
    if cut < chain.len() {
        // the oldest retained iteration no longer has a predecessor.
        let mut oldest = chain[cut - 1].clone();
        oldest.preceding_iteration = None;
        util::save_json(&to_iteration_location(snapshot.as_dir(), &oldest.id), &oldest)?;
    }

    // crashed transactions leave pages, manifests and roots that no
    // iteration ever references; collect them too.
    let orphans = collect_orphans(snapshot)?;
    stats.n_pages += orphans.n_pages;
    stats.n_manifests += orphans.n_manifests;
    stats.n_roots += orphans.n_roots;
    snapshot.set_dirty(false)?;

    if !stats.is_empty() {
        log::info!(
            "pruned {} iterations, {} roots, {} manifests, {} pages",
            stats.n_iterations,
            stats.n_roots,
            stats.n_manifests,
            stats.n_pages
        );
    }
    Ok(stats)
}

// mark every root, manifest and page reachable from any iteration file
// still on disk, then sweep the datastore tree for unmarked files.
// Leftover `.tmp` files from interrupted atomic writes go with them.
fn collect_orphans(snapshot: &Snapshot) -> Result<PruneStats> {
    let mut iterations = vec![];
    let mut undecidable = false;
    {
        let mut iter_dir = path::PathBuf::from(snapshot.as_dir());
        iter_dir.push("Iterations");
        if iter_dir.is_dir() {
            util::walk(&iter_dir, &mut |loc: &path::Path, is_dir: bool| {
                if !is_dir && loc.extension().map(|e| e == "json").unwrap_or(false) {
                    match util::load_json::<SnapshotIteration>(loc.as_os_str()) {
                        Ok(iteration) => iterations.push(iteration),
                        // an unreadable iteration makes reachability
                        // undecidable.
                        Err(_) => undecidable = true,
                    }
                }
                Ok(())
            })?;
        }
    }
    if undecidable {
        log::warn!("unreadable iteration file, skipping orphan sweep");
        return Ok(PruneStats::default());
    }

    let mut roots: HashSet<String> = HashSet::new();
    let mut manifests: HashSet<String> = HashSet::new();
    let mut pages: HashSet<String> = HashSet::new();
    for iteration in iterations.iter() {
        for ds_ref in iteration.data_stores.values() {
            roots.insert(ds_ref.root.to_string());
            let (ds_dir, root) = match load_root(snapshot, &ds_ref.key, &ds_ref.root) {
                Some(loaded) => loaded,
                None => continue,
            };
            for id in root
                .added_index_manifests
                .iter()
                .chain(root.removed_index_manifests.iter())
            {
                manifests.insert(id.to_string());
            }
            for (kind, info) in root.all_indexes().into_iter() {
                manifests.insert(info.manifest.to_string());
                let dir = crate::store::to_index_dir(&ds_dir, kind, &info.name, &info.id);
                let loc = manifest::to_manifest_location(&dir, &info.manifest);
                if let Ok(data) = fs::read(path::Path::new(&loc)) {
                    if let Ok(m) = IndexManifest::decode(info.manifest.clone(), &data) {
                        for page_id in m.ordered_page_ids() {
                            pages.insert(page_id.to_string());
                        }
                        for page_id in m.removed_page_ids() {
                            pages.insert(page_id.to_string());
                        }
                    }
                }
            }
        }
    }

    let mut stats = PruneStats::default();
    let ds_root = path::PathBuf::from(snapshot.datastores_dir());
    if !ds_root.is_dir() {
        return Ok(stats);
    }
    util::walk(&ds_root, &mut |loc: &path::Path, is_dir: bool| {
        if is_dir {
            return Ok(());
        }
        let stem = loc
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("")
            .to_string();
        let ext = loc.extension().and_then(|ext| ext.to_str()).unwrap_or("");
        let in_root_dir = loc
            .parent()
            .and_then(|parent| parent.file_name())
            .map(|d| d == "Root")
            .unwrap_or(false);
        let orphan = match ext {
            "tmp" => true,
            "datastorepage" => !pages.contains(&stem),
            "indexmanifest" => !manifests.contains(&stem),
            "json" if in_root_dir => !roots.contains(&stem),
            _ => false,
        };
        if orphan && fs::remove_file(loc).is_ok() {
            match ext {
                "datastorepage" => stats.n_pages += 1,
                "indexmanifest" => stats.n_manifests += 1,
                "json" => stats.n_roots += 1,
                _ => (),
            }
        }
        Ok(())
    })?;
    Ok(stats)
}

fn datastore_dir(snapshot: &Snapshot, key: &str) -> ffi::OsString {
    let mut loc = path::PathBuf::from(snapshot.datastores_dir());
    loc.push(format!("{}.datastore", key));
    loc.into_os_string()
}

fn load_root(
    snapshot: &Snapshot,
    key: &str,
    root_id: &DatedId,
) -> Option<(ffi::OsString, DatastoreRoot)> {
    let ds_dir = datastore_dir(snapshot, key);
    let loc = root::to_root_location(&ds_dir, root_id);
    util::load_json::<DatastoreRoot>(&loc).ok().map(|root| (ds_dir, root))
}

// gather the files iteration `it`'s removed sets make obsolete. Those
// files were current in `it`'s predecessor and nowhere else.
fn collect_removed(
    snapshot: &Snapshot,
    it: &SnapshotIteration,
    predecessor: Option<&SnapshotIteration>,
    doomed: &mut Doomed,
) -> Result<()> {
    for ds_ref in it.data_stores.values() {
        let (ds_dir, root) = match load_root(snapshot, &ds_ref.key, &ds_ref.root) {
            Some(loaded) => loaded,
            None => continue,
        };

        let index_dirs: Vec<(DatedId, ffi::OsString)> = root
            .all_indexes()
            .into_iter()
            .map(|(kind, info)| {
                let dir = crate::store::to_index_dir(&ds_dir, kind, &info.name, &info.id);
                (info.id, dir)
            })
            .collect();

        // manifests demoted by this iteration live in one of its index
        // directories.
        for manifest_id in root.removed_index_manifests.iter() {
            for (_, dir) in index_dirs.iter() {
                let loc = manifest::to_manifest_location(dir, manifest_id);
                if path::Path::new(&loc).is_file() {
                    doomed.manifests.push(loc);
                    break;
                }
            }
        }

        // pages demoted by the live manifests of this iteration.
        for (kind, info) in root.all_indexes().into_iter() {
            let dir = crate::store::to_index_dir(&ds_dir, kind, &info.name, &info.id);
            let loc = manifest::to_manifest_location(&dir, &info.manifest);
            let data = match fs::read(path::Path::new(&loc)) {
                Ok(data) => data,
                Err(_) => continue,
            };
            if let Ok(m) = IndexManifest::decode(info.manifest.clone(), &data) {
                for page_id in m.removed_page_ids() {
                    doomed.pages.push(page::to_page_location(&dir, &page_id));
                }
            }
        }

        // indexes dropped wholesale; their directories live in the
        // predecessor's root for this datastore.
        if !root.removed_indexes.is_empty() {
            let old = predecessor
                .and_then(|prev| prev.data_stores.get(&datastore_name(&ds_ref.key)))
                .and_then(|prev_ref| load_root(snapshot, &prev_ref.key, &prev_ref.root));
            if let Some((old_dir, old_root)) = old {
                for index_id in root.removed_indexes.iter() {
                    for (kind, info) in old_root.all_indexes().into_iter() {
                        if &info.id == index_id {
                            doomed.index_dirs.push(crate::store::to_index_dir(
                                &old_dir, kind, &info.name, &info.id,
                            ));
                        }
                    }
                }
            }
        }
    }

    // roots replaced by this iteration.
    for root_id in it.removed_datastore_roots.iter() {
        let prev_ref = predecessor.and_then(|prev| {
            prev.data_stores.values().find(|r| &r.root == root_id)
        });
        match prev_ref {
            Some(prev_ref) => {
                let ds_dir = datastore_dir(snapshot, &prev_ref.key);
                doomed.roots.push(root::to_root_location(&ds_dir, root_id));
            }
            // no predecessor on file, probe this iteration's datastores.
            None => {
                for ds_ref in it.data_stores.values() {
                    let ds_dir = datastore_dir(snapshot, &ds_ref.key);
                    let loc = root::to_root_location(&ds_dir, root_id);
                    if path::Path::new(&loc).is_file() {
                        doomed.roots.push(loc);
                        break;
                    }
                }
            }
        }
    }

    // datastores dropped by this iteration.
    for ds_id in it.removed_datastores.iter() {
        if let Some(prev) = predecessor {
            for prev_ref in prev.data_stores.values() {
                if &prev_ref.id == ds_id {
                    doomed
                        .datastore_dirs
                        .push(datastore_dir(snapshot, &prev_ref.key));
                }
            }
        }
    }

    Ok(())
}

fn datastore_name(key: &str) -> String {
    match key.rfind('-') {
        Some(at) => key[..at].to_string(),
        None => key.to_string(),
    }
}

// a pruned iteration's successors, other than the chain child, root dead
// branches; everything those branches added dies with them.
fn collect_dead_branches(
    snapshot: &Snapshot,
    it: &SnapshotIteration,
    keep: &HashSet<DatedId>,
    doomed: &mut Doomed,
) -> Result<()> {
    for succ_id in it.successive_iterations.iter() {
        if keep.contains(succ_id) {
            continue;
        }
        let branch = match snapshot.load_iteration(succ_id) {
            Ok(branch) => branch,
            Err(_) => continue,
        };

        for ds_ref in branch.data_stores.values() {
            if branch.added_datastores.contains(&ds_ref.id) {
                doomed.datastore_dirs.push(datastore_dir(snapshot, &ds_ref.key));
                continue;
            }
            if !branch.added_datastore_roots.contains(&ds_ref.root) {
                continue;
            }
            let (ds_dir, root) = match load_root(snapshot, &ds_ref.key, &ds_ref.root) {
                Some(loaded) => loaded,
                None => continue,
            };
            for (kind, info) in root.all_indexes().into_iter() {
                let dir = crate::store::to_index_dir(&ds_dir, kind, &info.name, &info.id);
                if root.added_index_manifests.contains(&info.manifest) {
                    let loc = manifest::to_manifest_location(&dir, &info.manifest);
                    if let Ok(data) = fs::read(path::Path::new(&loc)) {
                        if let Ok(m) = IndexManifest::decode(info.manifest.clone(), &data)
                        {
                            for page_id in m.added_page_ids() {
                                doomed
                                    .pages
                                    .push(page::to_page_location(&dir, &page_id));
                            }
                        }
                    }
                    doomed.manifests.push(loc);
                }
            }
            doomed.roots.push(root::to_root_location(&ds_dir, &ds_ref.root));
        }

        collect_dead_branches(snapshot, &branch, &HashSet::new(), doomed)?;
        doomed.iterations.push(succ_id.clone());
    }
    Ok(())
}

fn delete_doomed(snapshot: &Snapshot, doomed: Doomed) -> Result<PruneStats> {
    let mut stats = PruneStats::default();

    for loc in doomed.pages.iter() {
        if fs::remove_file(path::Path::new(loc)).is_ok() {
            stats.n_pages += 1;
        }
    }
    for loc in doomed.manifests.iter() {
        if fs::remove_file(path::Path::new(loc)).is_ok() {
            stats.n_manifests += 1;
        }
    }
    for loc in doomed.roots.iter() {
        if fs::remove_file(path::Path::new(loc)).is_ok() {
            stats.n_roots += 1;
        }
    }
    for loc in doomed.index_dirs.iter() {
        if fs::remove_dir_all(path::Path::new(loc)).is_ok() {
            stats.n_indexes += 1;
        }
    }
    for loc in doomed.datastore_dirs.iter() {
        if fs::remove_dir_all(path::Path::new(loc)).is_ok() {
            stats.n_datastores += 1;
        }
    }
    for id in doomed.iterations.iter() {
        let loc = to_iteration_location(snapshot.as_dir(), id);
        if fs::remove_file(path::Path::new(&loc)).is_ok() {
            stats.n_iterations += 1;
        }
    }

    // tidy dated directories that just became empty; the snapshot's
    // fixed skeleton (Inbox, Datastores, Iterations) stays.
    for sub in ["Iterations", "Datastores"].iter() {
        let mut loc = path::PathBuf::from(snapshot.as_dir());
        loc.push(sub);
        util::remove_empty_dirs(&loc).ok();
    }
    Ok(stats)
}

#[cfg(test)]
#[path = "retain_test.rs"]
mod retain_test;
