//! Module `store` implement the datastore, one record collection inside
//! a snapshot.
//!
//! A [Datastore] value is the in-process registry for one collection:
//! its key, declared descriptor, observer bus and tracked page handles.
//! Transactions materialize a [WorkingStore], a copy-on-write working
//! copy of the datastore's root and indexes; nothing a working copy does
//! is visible until the owning transaction commits.

use std::{
    collections::HashMap,
    ffi, fmt, path, result,
    sync::{Arc, Mutex},
};

use crate::{
    dated::DatedId,
    index::{
        manifest, CursorPos, EntryKey, Index, IndexKind, IndexManifest, IndexSel,
        Lookup, Scan,
    },
    page::{Entry, Page, WeakPage},
    persist::cache::Caches,
    util, Error, Result,
};

pub mod descriptor;
pub mod observer;
pub mod root;

pub use descriptor::{Descriptor, IndexDescriptor};
pub use observer::{BufferingPolicy, Event, Observer, ObserverBus};
pub use root::{DatastoreRoot, IndexChange, IndexInfo};

/// Closure extracting the indexed value for one secondary index from a
/// record's `(content, identifier)`. Returning None leaves the record out
/// of that index. Supplied by the typed facade at registration time; the
/// engine needs it to repopulate an index added between runs.
pub type ValueExtractor = Arc<dyn Fn(&[u8], &[u8]) -> Result<Option<Vec<u8>>> + Send + Sync>;

/// Key identifying one datastore within a persistence. The 64-bit token
/// disambiguates the on-disk directory; equality and lookups go by name.
#[derive(Clone, Debug)]
pub struct DatastoreKey {
    pub(crate) name: String,
    pub(crate) token: u64,
    pub(crate) store_token: u64,
}

impl fmt::Display for DatastoreKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        write!(f, "{}-{:016X}", self.name, self.token)
    }
}

impl DatastoreKey {
    pub(crate) fn new(name: &str, token: u64, store_token: u64) -> DatastoreKey {
        DatastoreKey {
            name: name.to_string(),
            token,
            store_token,
        }
    }

    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    /// Directory name for this datastore,
    /// `format!("{}-{:016X}.datastore", name, token)`.
    pub fn to_dir_name(&self) -> String {
        format!("{}.datastore", self)
    }

    /// Recover `(name, token)` from a datastore directory name.
    pub fn parse_dir_name(dir_name: &str) -> Option<(String, u64)> {
        let stem = dir_name.strip_suffix(".datastore")?;
        let at = stem.rfind('-')?;
        let token = u64::from_str_radix(&stem[at + 1..], 16).ok()?;
        Some((stem[..at].to_string(), token))
    }
}

/// Directory name for one index,
/// `Primary.datastoreindex` for the primary, else
/// `format!("{}-{:04X}.datastoreindex", name, id.token() & 0xFFFF)`.
pub fn index_dir_name(kind: IndexKind, name: &str, id: &DatedId) -> String {
    match kind {
        IndexKind::Primary => "Primary.datastoreindex".to_string(),
        _ => format!("{}-{:04X}.datastoreindex", name, id.to_token() & 0xFFFF),
    }
}

/// Compose the directory of one index under its datastore directory.
/// Primary and direct indexes live under `DirectIndexes/`, reference
/// indexes under `SecondaryIndexes/`.
pub fn to_index_dir(
    datastore_dir: &ffi::OsStr,
    kind: IndexKind,
    name: &str,
    id: &DatedId,
) -> ffi::OsString {
    let mut loc = path::PathBuf::from(datastore_dir.to_os_string());
    loc.push(match kind {
        IndexKind::Primary | IndexKind::Direct => "DirectIndexes",
        IndexKind::Reference => "SecondaryIndexes",
    });
    loc.push(index_dir_name(kind, name, id));
    loc.into_os_string()
}

// weak map of page handles, inactive pages drop out on their own while
// the rolling caches keep recently used ones alive.
#[derive(Default)]
pub(crate) struct TrackedPages {
    pages: HashMap<DatedId, WeakPage>,
}

impl TrackedPages {
    fn upgrade_all(&mut self) -> HashMap<DatedId, Page> {
        let mut live = HashMap::new();
        self.pages.retain(|id, weak| match weak.upgrade() {
            Some(page) => {
                live.insert(id.clone(), page);
                true
            }
            None => false,
        });
        live
    }

    fn track(&mut self, pages: &HashMap<DatedId, Page>) {
        for (id, page) in pages.iter() {
            self.pages.insert(id.clone(), page.downgrade());
        }
    }
}

/// In-process registry for one record collection. The on-disk directory
/// is a property of the snapshot and travels with the working copies.
pub struct Datastore {
    pub(crate) key: DatastoreKey,
    pub(crate) declared: Descriptor,
    pub(crate) extractors: HashMap<String, ValueExtractor>,
    pub(crate) bus: ObserverBus,
    pub(crate) tracked: Mutex<TrackedPages>,
}

impl Datastore {
    pub(crate) fn new(
        key: DatastoreKey,
        declared: Descriptor,
        extractors: HashMap<String, ValueExtractor>,
    ) -> Datastore {
        Datastore {
            key,
            declared,
            extractors,
            bus: ObserverBus::default(),
            tracked: Mutex::new(TrackedPages::default()),
        }
    }

    pub fn to_key(&self) -> DatastoreKey {
        self.key.clone()
    }

    pub fn subscribe(&self, policy: BufferingPolicy) -> Observer {
        self.bus.subscribe(policy)
    }
}

/// Copy-on-write working copy of one datastore, private to one
/// transaction.
pub(crate) struct WorkingStore {
    pub(crate) ds: Arc<Datastore>,
    pub(crate) dir: ffi::OsString,
    pub(crate) id: DatedId,
    pub(crate) base_root_id: Option<DatedId>,
    pub(crate) root: DatastoreRoot,
    pub(crate) root_dirty: bool,
    pub(crate) indexes: HashMap<DatedId, Index>,
    pub(crate) events: Vec<Event>,
    caches: Arc<Mutex<Caches>>,
}

impl WorkingStore {
    /// Working copy for a datastore that does not exist on disk yet.
    pub(crate) fn create(
        ds: Arc<Datastore>,
        dir: ffi::OsString,
        caches: Arc<Mutex<Caches>>,
    ) -> WorkingStore {
        let root = DatastoreRoot::new_fresh(ds.declared.clone());
        let mut ws = WorkingStore {
            ds,
            dir,
            id: DatedId::generate(),
            base_root_id: None,
            root,
            root_dirty: true,
            indexes: HashMap::new(),
            events: vec![],
            caches,
        };
        for (kind, info) in ws.root.all_indexes() {
            let order = ws.root.descriptor.to_key_order();
            let dir = to_index_dir(&ws.dir, kind, &info.name, &info.id);
            let index =
                Index::new_empty(kind, &info.name, info.id.clone(), order, info.manifest, dir);
            ws.indexes.insert(info.id, index);
        }
        ws
    }

    /// Working copy over the committed root `root_id` of datastore
    /// `datastore_id`.
    pub(crate) fn open(
        ds: Arc<Datastore>,
        dir: ffi::OsString,
        datastore_id: DatedId,
        root_id: DatedId,
        caches: Arc<Mutex<Caches>>,
    ) -> Result<WorkingStore> {
        let root = {
            let cached = caches.lock().unwrap().find_root(&root_id);
            match cached {
                Some(root) => root,
                None => {
                    let loc = root::to_root_location(&dir, &root_id);
                    let root: DatastoreRoot = util::load_json(&loc)?;
                    caches.lock().unwrap().put_root(root.clone());
                    root
                }
            }
        };

        Ok(WorkingStore {
            ds,
            dir,
            id: datastore_id,
            base_root_id: Some(root_id),
            root,
            root_dirty: false,
            indexes: HashMap::new(),
            events: vec![],
            caches,
        })
    }

    pub(crate) fn is_created(&self) -> bool {
        self.base_root_id.is_none()
    }

    fn sel_parts<'a>(sel: &'a IndexSel) -> (IndexKind, &'a str) {
        match sel {
            IndexSel::Primary => (IndexKind::Primary, "Primary"),
            IndexSel::Direct(name) => (IndexKind::Direct, name.as_str()),
            IndexSel::Secondary(name) => (IndexKind::Reference, name.as_str()),
        }
    }

    fn index_mut(&mut self, sel: &IndexSel) -> Result<&mut Index> {
        let (kind, name) = WorkingStore::sel_parts(sel);
        let info = match self.root.find_index(kind, name) {
            Some(info) => info.clone(),
            None => return err_at!(IndexNotFound, msg: "{:?} in {}", sel, self.ds.key),
        };

        if !self.indexes.contains_key(&info.id) {
            let dir = to_index_dir(&self.dir, kind, name, &info.id);
            let manifest = self.load_manifest(&dir, &info.manifest)?;
            let order = self.root.descriptor.to_key_order();
            let pages = self.ds.tracked.lock().unwrap().upgrade_all();
            let index =
                Index::loaded(kind, name, info.id.clone(), order, manifest, dir, pages);
            self.indexes.insert(info.id.clone(), index);
        }
        Ok(self.indexes.get_mut(&info.id).unwrap())
    }

    fn load_manifest(&self, dir: &ffi::OsStr, id: &DatedId) -> Result<IndexManifest> {
        if let Some(manifest) = self.caches.lock().unwrap().find_manifest(id) {
            return Ok(manifest);
        }
        let loc = manifest::to_manifest_location(dir, id);
        let data = err_at!(IOError, std::fs::read(path::Path::new(&loc)))?;
        let manifest = IndexManifest::decode(id.clone(), &data)?;
        self.caches.lock().unwrap().put_manifest(manifest.clone());
        Ok(manifest)
    }

    /// Reconcile the declared descriptor against the stored one, creating
    /// and populating newly declared indexes and dropping undeclared
    /// ones. A no-op when the descriptors agree.
    pub(crate) fn reconcile_descriptor(&mut self, page_size: usize) -> Result<()> {
        let declared = self.ds.declared.clone();
        let (root, changes) = match self.root.apply_descriptor(&declared) {
            Some(merged) => merged,
            None => return Ok(()),
        };
        log::info!(
            "datastore {} re-declared, {} index changes",
            self.ds.key,
            changes.len()
        );

        self.root = root;
        self.root_dirty = true;
        for change in changes.into_iter() {
            match change {
                IndexChange::Added { kind, info } => {
                    let order = self.root.descriptor.to_key_order();
                    let dir = to_index_dir(&self.dir, kind, &info.name, &info.id);
                    let index = Index::new_empty(
                        kind,
                        &info.name,
                        info.id.clone(),
                        order,
                        info.manifest.clone(),
                        dir,
                    );
                    self.indexes.insert(info.id.clone(), index);
                    self.populate_index(kind, &info, page_size)?;
                    self.events.push(Event::IndexAdded {
                        name: info.name.clone(),
                    });
                }
                IndexChange::Removed { info, .. } => {
                    self.indexes.remove(&info.id);
                    self.events.push(Event::IndexRemoved {
                        name: info.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    // replay every primary entry into a freshly added index.
    fn populate_index(
        &mut self,
        kind: IndexKind,
        info: &IndexInfo,
        page_size: usize,
    ) -> Result<()> {
        let extractor = match self.ds.extractors.get(&info.name) {
            Some(extractor) => Arc::clone(extractor),
            None => return Ok(()), // nothing to extract with, stays empty
        };

        let records: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)> = {
            use std::ops::Bound;

            let primary = self.index_mut(&IndexSel::Primary)?;
            let mut records = vec![];
            for item in primary.scan(Bound::Unbounded, Bound::Unbounded, false)? {
                let (_key, entry) = item?;
                records.push((
                    entry.as_header(0)?.to_vec(),
                    entry.as_header(1)?.to_vec(),
                    entry.as_content().to_vec(),
                ));
            }
            records
        };

        let n_records = records.len();
        let index = self.indexes.get_mut(&info.id).unwrap();
        for (version, identifier, content) in records.into_iter() {
            let value = match extractor(&content, &identifier)? {
                Some(value) => value,
                None => continue,
            };
            let entry = match kind {
                IndexKind::Direct => {
                    Entry::new_direct(&version, &value, &identifier, content)
                }
                IndexKind::Reference => Entry::new_reference(&value, &identifier),
                IndexKind::Primary => unreachable!(),
            };
            let key = EntryKey::secondary(&value, &identifier);
            match index.lookup(&key)? {
                Lookup::NotFound { at } => index.insert(&at, &entry, page_size)?,
                Lookup::Found { .. } => (),
            }
        }
        log::debug!("index {} populated from {} records", info.name, n_records);
        Ok(())
    }

    pub(crate) fn lookup(&mut self, sel: &IndexSel, key: &EntryKey) -> Result<Lookup> {
        self.index_mut(sel)?.lookup(key)
    }

    pub(crate) fn index_epoch(&mut self, sel: &IndexSel) -> Result<u64> {
        Ok(self.index_mut(sel)?.to_epoch())
    }

    pub(crate) fn insert(
        &mut self,
        sel: &IndexSel,
        at: &[CursorPos],
        entry: &Entry,
        page_size: usize,
    ) -> Result<()> {
        self.index_mut(sel)?.insert(at, entry, page_size)
    }

    pub(crate) fn remove(
        &mut self,
        sel: &IndexSel,
        path: &[CursorPos],
        page_size: usize,
    ) -> Result<Entry> {
        self.index_mut(sel)?.remove(path, page_size)
    }

    pub(crate) fn reset(&mut self, sel: &IndexSel) -> Result<()> {
        self.index_mut(sel)?.reset();
        Ok(())
    }

    pub(crate) fn scan(
        &mut self,
        sel: &IndexSel,
        lo: std::ops::Bound<Vec<u8>>,
        hi: std::ops::Bound<Vec<u8>>,
        reverse: bool,
    ) -> Result<Scan> {
        self.index_mut(sel)?.scan(lo, hi, reverse)
    }

    /// Resolve the record body for a reference-index entry via the
    /// primary index.
    pub(crate) fn resolve_primary(&mut self, identifier: &[u8]) -> Result<Option<Vec<u8>>> {
        let key = EntryKey::primary(identifier);
        match self.lookup(&IndexSel::Primary, &key)? {
            Lookup::Found { entry, .. } => Ok(Some(entry.into_content())),
            Lookup::NotFound { .. } => Ok(None),
        }
    }

    /// Drop a whole secondary index from this datastore.
    pub(crate) fn delete_index(&mut self, sel: &IndexSel) -> Result<()> {
        let (kind, name) = WorkingStore::sel_parts(sel);
        if kind == IndexKind::Primary {
            return err_at!(InvalidInput, msg: "cannot delete the primary index");
        }
        let info = match self.root.find_index(kind, name) {
            Some(info) => info.clone(),
            None => return err_at!(IndexNotFound, msg: "{:?} in {}", sel, self.ds.key),
        };

        self.materialize_root();
        self.root.delete_index(&info.id)?;
        self.indexes.remove(&info.id);
        self.events.push(Event::IndexRemoved { name: info.name });
        Ok(())
    }

    pub(crate) fn push_event(&mut self, event: Event) {
        self.events.push(event);
    }

    pub(crate) fn materialize_root(&mut self) {
        if !self.root_dirty {
            self.root = self.root.carried_forward();
            self.root_dirty = true;
        }
    }

    /// True when this working copy holds any change that must commit.
    pub(crate) fn is_touched(&self) -> bool {
        self.root_dirty || self.indexes.values().any(Index::is_dirty)
    }

    /// Persist this working copy: pages, then manifests, then the root
    /// file. Returns the persisted root id.
    pub(crate) fn persist(&mut self) -> Result<DatedId> {
        let mut replaced = vec![];
        for index in self.indexes.values_mut() {
            if let Some(manifest_id) = index.persist_if_needed()? {
                replaced.push((index.to_id(), manifest_id));
            }
        }
        for (index_id, manifest_id) in replaced.into_iter() {
            self.materialize_root();
            self.root.replace_manifest(&index_id, manifest_id)?;
        }

        if self.root_dirty {
            self.root.modification_date = chrono::Utc::now();
            let loc = root::to_root_location(&self.dir, &self.root.id);
            util::save_json(&loc, &self.root)?;
        }
        Ok(self.root.id.clone())
    }

    /// After commit: hand page handles to the datastore's tracked map and
    /// the rolling caches, publish events.
    pub(crate) fn settle(&mut self) {
        let mut tracked = self.ds.tracked.lock().unwrap();
        let mut caches = self.caches.lock().unwrap();
        for index in self.indexes.values() {
            tracked.track(index.as_pages());
            for page in index.as_pages().values() {
                caches.put_page(page.clone());
            }
            caches.put_manifest(index.as_manifest().clone());
        }
        caches.put_root(self.root.clone());
        drop(caches);
        drop(tracked);

        if !self.events.is_empty() {
            self.ds.bus.publish(&self.events);
            self.events.clear();
        }
    }
}
