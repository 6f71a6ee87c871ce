//! Module `persist` implement the persistence, the top level root object
//! of one store directory.
//!
//! A [Persistence] owns the store info, the current [Snapshot], the
//! registry of datastores, the rolling caches and the pruner thread. One
//! writable persistence exists per directory at a time, guarded by an
//! advisory file lock; read-only opens are unrestricted.

use fs2::FileExt;

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    ffi, fs, path,
    sync::{
        atomic::{AtomicU64, Ordering::SeqCst},
        mpsc, Arc, Mutex,
    },
    thread,
};

use crate::{
    dated::DatedId,
    snap::{to_snapshot_dir, Snapshot, SnapshotIteration, SnapshotKind},
    store::{BufferingPolicy, Datastore, DatastoreKey, Descriptor, Observer, ValueExtractor},
    txn::{self, Mode, Transaction},
    util, Error, Result,
};

pub mod cache;
pub mod info;
pub mod retain;

pub use info::{StoreInfo, FORMAT_VERSION};
pub use retain::{PruneStats, RetentionPolicy};

use cache::Caches;

/// Extension of a persistence root directory.
pub const STORE_EXTENSION: &str = "persistencestore";

/// Default target page size, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Configuration for a [Persistence].
#[derive(Clone, Debug)]
pub struct Config {
    /// Store root directory. The `.persistencestore` extension is
    /// appended when missing.
    pub dir: ffi::OsString,
    /// Target size for page files. Entries larger than one page span
    /// multiple pages.
    ///
    /// Default: [PAGE_SIZE]
    pub target_page_size: usize,
    /// Which iterations the pruner may trim.
    ///
    /// Default: [RetentionPolicy::Indefinite]
    pub retention: RetentionPolicy,
    /// Open without the writer lock; every write raises `CannotWrite`.
    ///
    /// Default: false
    pub read_only: bool,
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        use std::env;

        let mut dir = env::temp_dir();
        dir.push(format!("cowdb-arbitrary-{:08x}", u.arbitrary::<u32>()?));

        let config = Config {
            dir: dir.into_os_string(),
            target_page_size: *u.choose(&[256, 1024, 4096, 16384])?,
            retention: u.arbitrary()?,
            read_only: false,
        };
        Ok(config)
    }
}

impl Config {
    pub fn new(dir: &ffi::OsStr) -> Config {
        Config {
            dir: dir.to_os_string(),
            target_page_size: PAGE_SIZE,
            retention: RetentionPolicy::Indefinite,
            read_only: false,
        }
    }

    pub fn set_target_page_size(&mut self, target_page_size: usize) -> &mut Self {
        self.target_page_size = target_page_size;
        self
    }

    pub fn set_retention(&mut self, retention: RetentionPolicy) -> &mut Self {
        self.retention = retention;
        self
    }

    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = read_only;
        self
    }
}

/// Counters over one persistence, for diagnostics and tests.
#[derive(Clone, Debug, Default)]
pub struct Stats {
    pub n_iterations: usize,
    pub n_datastores: usize,
    pub n_cached_roots: usize,
    pub n_cached_manifests: usize,
    pub n_cached_pages: usize,
}

thread_local! {
    // store-info updates this thread has in flight, reentrancy guard.
    static INFO_UPDATING: RefCell<HashSet<u64>> = RefCell::new(HashSet::new());
}

/// Top level handle over one store directory. Clones share the same
/// underlying store.
#[derive(Clone)]
pub struct Persistence {
    pub(crate) inner: Arc<PersistInner>,
}

pub(crate) struct PersistInner {
    pub(crate) dir: ffi::OsString,
    pub(crate) token: u64,
    pub(crate) config: Config,
    pub(crate) info: Mutex<StoreInfo>,
    pub(crate) snapshot: Arc<Mutex<Option<Snapshot>>>,
    pub(crate) registry: Mutex<BTreeMap<String, Arc<Datastore>>>,
    pub(crate) caches: Arc<Mutex<Caches>>,
    pub(crate) write_gate: Arc<Mutex<u32>>,
    pub(crate) txn_serial: AtomicU64,
    pub(crate) readers: Arc<Mutex<HashMap<DatedId, usize>>>,
    pruner: Mutex<Option<Pruner>>,
    _lock_file: Option<fs::File>,
}

enum PruneReq {
    Sweep,
}

// The background pruner of one writable persistence: a dedicated thread
// draining a mailbox of sweep requests. Commits post a request after
// publishing; the thread takes the writer gate before sweeping so it
// never observes a commit whose files are on disk but not referenced
// yet. Dropping the sender is the shutdown signal.
struct Pruner {
    tx: Option<mpsc::Sender<PruneReq>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Pruner {
    fn start(
        policy: RetentionPolicy,
        gate: Arc<Mutex<u32>>,
        snapshot: Arc<Mutex<Option<Snapshot>>>,
        readers: Arc<Mutex<HashMap<DatedId, usize>>>,
    ) -> Pruner {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            for PruneReq::Sweep in rx {
                let _gate = gate.lock().unwrap();
                let pinned: HashSet<DatedId> =
                    readers.lock().unwrap().keys().cloned().collect();
                let mut snapshot = snapshot.lock().unwrap();
                if let Some(snapshot) = snapshot.as_mut() {
                    let res = snapshot.update(|s| retain::sweep(s, &policy, &pinned));
                    if let Err(err) = res {
                        log::warn!("prune sweep failed: {}", err);
                    }
                }
            }
        });
        Pruner {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    fn post(&self) {
        if let Some(tx) = &self.tx {
            tx.send(PruneReq::Sweep).ok();
        }
    }

    fn shut_down(&mut self) -> Result<()> {
        self.tx.take(); // disconnects the mailbox, the thread drains and exits
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(_) => Ok(()),
                Err(err) => err_at!(ThreadFail, msg: "pruner {:?}", err),
            },
            None => Ok(()),
        }
    }
}

impl Drop for Pruner {
    fn drop(&mut self) {
        self.shut_down().ok();
    }
}

impl Persistence {
    /// Open, and for writable stores create, the persistence under
    /// `config.dir`.
    pub fn open(config: Config) -> Result<Persistence> {
        let dir = to_store_dir(&config.dir);

        let lock_file = match config.read_only {
            true => None,
            false => {
                err_at!(IOError, fs::create_dir_all(path::Path::new(&dir)))?;
                let loc = {
                    let mut loc = path::PathBuf::from(&dir);
                    loc.push("Lock");
                    loc
                };
                let fd = err_at!(
                    IOError,
                    fs::OpenOptions::new().write(true).create(true).open(&loc)
                )?;
                if fd.try_lock_exclusive().is_err() {
                    return err_at!(DuplicateWriters, msg: "{:?}", dir);
                }
                Some(fd)
            }
        };

        // missing store info means a store that was never written to.
        let info: StoreInfo = util::load_json(&info_location(&dir)).unwrap_or_default();

        let snapshot = match &info.current_snapshot {
            Some(id) => {
                let snap_dir = to_snapshot_dir(&snapshots_dir(&dir), id);
                Some(Snapshot::load(&snap_dir, SnapshotKind::Normal)?)
            }
            None => None,
        };

        let snapshot = Arc::new(Mutex::new(snapshot));
        let write_gate = Arc::new(Mutex::new(0));
        let readers: Arc<Mutex<HashMap<DatedId, usize>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pruner = match config.read_only {
            true => None,
            false => Some(Pruner::start(
                config.retention.clone(),
                Arc::clone(&write_gate),
                Arc::clone(&snapshot),
                Arc::clone(&readers),
            )),
        };

        let inner = PersistInner {
            dir,
            token: rand::random::<u64>(),
            config: config.clone(),
            info: Mutex::new(info),
            snapshot,
            registry: Mutex::new(BTreeMap::new()),
            caches: Arc::new(Mutex::new(Caches::default())),
            write_gate,
            txn_serial: AtomicU64::new(0),
            readers,
            pruner: Mutex::new(pruner),
            _lock_file: lock_file,
        };
        let persistence = Persistence {
            inner: Arc::new(inner),
        };

        if !config.read_only {
            // a dirty marker means the previous cleanup did not finish.
            let dirty = {
                let snapshot = persistence.inner.snapshot.lock().unwrap();
                snapshot.as_ref().map(|s| s.is_dirty()).unwrap_or(false)
            };
            if dirty {
                log::warn!("dirty snapshot found, re-running cleanup");
                persistence.prune_now()?;
            }
        }

        log::info!("opened persistence at {:?}", persistence.inner.dir);
        Ok(persistence)
    }

    /// Open from a `file://` URL. Anything else raises `NotFileUrl`.
    pub fn open_url(url: &url::Url, mut config: Config) -> Result<Persistence> {
        if url.scheme() != "file" {
            return err_at!(NotFileUrl, msg: "{}", url);
        }
        let dir = match url.to_file_path() {
            Ok(dir) => dir,
            Err(_) => return err_at!(NotFileUrl, msg: "{}", url),
        };
        config.dir = dir.into_os_string();
        Persistence::open(config)
    }

    /// Open the store named `name` under the platform's application
    /// support directory.
    pub fn open_default(name: &str) -> Result<Persistence> {
        let mut dir = match dirs::data_local_dir() {
            Some(dir) => dir,
            None => return err_at!(MissingAppSupportDir, msg: "no app-support dir"),
        };
        dir.push(name);
        Persistence::open(Config::new(dir.as_os_str()))
    }

    pub fn as_dir(&self) -> &ffi::OsStr {
        &self.inner.dir
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.config.read_only
    }

    /// Register one datastore under `name`. Raises `AlreadyRegistered`
    /// when `name` is taken on this persistence.
    pub fn register(&self, name: &str, descriptor: Descriptor) -> Result<DatastoreKey> {
        self.register_with_extractors(name, descriptor, HashMap::new())
    }

    /// Like [Persistence::register], with per-index value extractors so
    /// indexes added between runs can be repopulated from the primary.
    pub fn register_with_extractors(
        &self,
        name: &str,
        descriptor: Descriptor,
        extractors: HashMap<String, ValueExtractor>,
    ) -> Result<DatastoreKey> {
        let mut registry = self.inner.registry.lock().unwrap();
        if registry.contains_key(name) {
            return err_at!(AlreadyRegistered, msg: "datastore {}", name);
        }

        // adopt the on-disk key token when the datastore already exists.
        let token = match self.stored_key_token(name)? {
            Some(token) => token,
            None => rand::random::<u64>(),
        };
        let key = DatastoreKey::new(name, token, self.inner.token);

        let ds = Datastore::new(key.clone(), descriptor, extractors);
        registry.insert(name.to_string(), Arc::new(ds));
        log::info!("registered datastore {}", key);
        Ok(key)
    }

    /// Register several datastores at once. A name repeated within the
    /// batch raises `MultipleRegistrations`.
    pub fn register_many(
        &self,
        declarations: Vec<(&str, Descriptor)>,
    ) -> Result<Vec<DatastoreKey>> {
        let mut seen = HashSet::new();
        for (name, _) in declarations.iter() {
            if !seen.insert(name.to_string()) {
                return err_at!(MultipleRegistrations, msg: "datastore {}", name);
            }
        }
        let mut keys = vec![];
        for (name, descriptor) in declarations.into_iter() {
            keys.push(self.register(name, descriptor)?);
        }
        Ok(keys)
    }

    /// Event stream over the datastore registered as `name`.
    pub fn observer(&self, name: &str, policy: BufferingPolicy) -> Result<Observer> {
        Ok(self.registered(name)?.subscribe(policy))
    }

    /// Run a read-write transaction. `action` names the iteration this
    /// transaction commits.
    pub fn transact<T, F>(&self, action: Option<&str>, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        txn::run(self, Mode::ReadWrite, action, f)
    }

    /// Run a read-only transaction against the iteration current at the
    /// moment it starts.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        txn::run(self, Mode::ReadOnly, None, f)
    }

    /// Force descriptor reconciliation and any pending re-indexing for
    /// `name`, instead of paying for it on first use.
    pub fn warm_up(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.transact(Some("warm-up"), |txn| txn.touch(&name))
    }

    /// Copy the current snapshot into `Backups/`, pinned outside the
    /// pruner's reach. Returns the backup snapshot id.
    pub fn back_up(&self) -> Result<DatedId> {
        if self.is_read_only() {
            return err_at!(CannotWrite, msg: "read-only persistence");
        }
        let snapshot = self.inner.snapshot.lock().unwrap();
        let snapshot = match snapshot.as_ref() {
            Some(snapshot) => snapshot,
            None => return err_at!(DatastoreNotFound, msg: "nothing to back up"),
        };
        let new_id = DatedId::generate();
        snapshot.copy_to(&backups_dir(&self.inner.dir), new_id.clone())?;
        log::info!("backed up snapshot {} as {}", snapshot.to_id(), new_id);
        Ok(new_id)
    }

    /// Run the retention sweep synchronously. Do not call from inside a
    /// transaction, the sweep excludes writers via the writer gate.
    pub fn prune_now(&self) -> Result<PruneStats> {
        let _gate = self.inner.write_gate.lock().unwrap();
        let pinned: HashSet<DatedId> =
            self.inner.readers.lock().unwrap().keys().cloned().collect();
        let mut snapshot = self.inner.snapshot.lock().unwrap();
        match snapshot.as_mut() {
            Some(snapshot) => {
                let policy = self.inner.config.retention.clone();
                snapshot.update(|s| retain::sweep(s, &policy, &pinned))
            }
            None => Ok(PruneStats::default()),
        }
    }

    pub fn to_stats(&self) -> Result<Stats> {
        let mut stats = Stats::default();
        stats.n_datastores = self.inner.registry.lock().unwrap().len();
        {
            let caches = self.inner.caches.lock().unwrap();
            stats.n_cached_roots = caches.roots.len();
            stats.n_cached_manifests = caches.manifests.len();
            stats.n_cached_pages = caches.pages.len();
        }

        let mut snapshot = self.inner.snapshot.lock().unwrap();
        if let Some(snapshot) = snapshot.as_mut() {
            let mut iteration = snapshot.current_iteration()?;
            while let Some(it) = iteration {
                stats.n_iterations += 1;
                iteration = match &it.preceding_iteration {
                    Some(prev_id) => snapshot.load_iteration(prev_id).ok(),
                    None => None,
                };
            }
        }
        Ok(stats)
    }

    /// Serialized store-info update. Re-entering from inside the closure
    /// raises `NestedStoreWrite`.
    pub(crate) fn update_info<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut StoreInfo) -> Result<T>,
    {
        let token = self.inner.token;
        let entered = INFO_UPDATING.with(|set| set.borrow_mut().insert(token));
        if !entered {
            return err_at!(NestedStoreWrite, msg: "store {:?}", self.inner.dir);
        }
        let res = {
            let mut info = self.inner.info.lock().unwrap();
            match f(&mut info) {
                Ok(val) => {
                    info.modification_date = chrono::Utc::now();
                    util::save_json(&info_location(&self.inner.dir), &*info)
                        .map(|_| val)
                }
                Err(err) => Err(err),
            }
        };
        INFO_UPDATING.with(|set| set.borrow_mut().remove(&token));
        res
    }

    // first write against an empty store creates the snapshot, its
    // initial iteration, and the store info.
    pub(crate) fn ensure_initialized(&self) -> Result<()> {
        let mut snapshot = self.inner.snapshot.lock().unwrap();
        if snapshot.is_some() {
            return Ok(());
        }

        let id = DatedId::generate();
        let mut fresh =
            Snapshot::create(&snapshots_dir(&self.inner.dir), id.clone(), SnapshotKind::Normal)?;
        fresh.commit_iteration(SnapshotIteration::new_initial(Some("initial")))?;
        *snapshot = Some(fresh);
        drop(snapshot);

        self.update_info(|info| {
            info.current_snapshot = Some(id.clone());
            Ok(())
        })?;
        log::info!("initialized store with snapshot {}", id);
        Ok(())
    }

    /// On-disk directory of the datastore identified by `key`, under the
    /// current snapshot.
    pub(crate) fn datastore_dir(&self, key: &DatastoreKey) -> Result<ffi::OsString> {
        let snapshot = self.inner.snapshot.lock().unwrap();
        match snapshot.as_ref() {
            Some(snapshot) => {
                let mut loc = path::PathBuf::from(snapshot.datastores_dir());
                loc.push(key.to_dir_name());
                Ok(loc.into_os_string())
            }
            None => err_at!(DatastoreNotFound, msg: "store not initialized"),
        }
    }

    pub(crate) fn registered(&self, name: &str) -> Result<Arc<Datastore>> {
        match self.inner.registry.lock().unwrap().get(name) {
            Some(ds) => Ok(Arc::clone(ds)),
            None => err_at!(DatastoreKeyNotFound, msg: "datastore {}", name),
        }
    }

    pub(crate) fn current_iteration(&self) -> Result<Option<SnapshotIteration>> {
        let mut snapshot = self.inner.snapshot.lock().unwrap();
        match snapshot.as_mut() {
            Some(snapshot) => snapshot.current_iteration(),
            None => Ok(None),
        }
    }

    pub(crate) fn pin_reader(&self, id: &DatedId) {
        let mut readers = self.inner.readers.lock().unwrap();
        *readers.entry(id.clone()).or_insert(0) += 1;
    }

    pub(crate) fn unpin_reader(&self, id: &DatedId) {
        let mut readers = self.inner.readers.lock().unwrap();
        if let Some(count) = readers.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                readers.remove(id);
            }
        }
    }

    /// Ask the pruner thread for a background sweep.
    pub(crate) fn post_prune(&self) {
        if let Some(pruner) = self.inner.pruner.lock().unwrap().as_ref() {
            pruner.post();
        }
    }

    /// Shut down this handle's background machinery. Also implied by
    /// dropping the last clone.
    pub fn close(self) -> Result<()> {
        if let Some(mut pruner) = self.inner.pruner.lock().unwrap().take() {
            pruner.shut_down()?;
        }
        for ds in self.inner.registry.lock().unwrap().values() {
            ds.bus.close();
        }
        Ok(())
    }

    // token recorded for `name` in the current iteration, if any.
    fn stored_key_token(&self, name: &str) -> Result<Option<u64>> {
        let iteration = self.current_iteration()?;
        let token = iteration
            .and_then(|it| it.data_stores.get(name).map(|r| r.key.clone()))
            .and_then(|key| DatastoreKey::parse_dir_name(&format!("{}.datastore", key)))
            .map(|(_, token)| token);
        Ok(token)
    }
}

fn to_store_dir(dir: &ffi::OsStr) -> ffi::OsString {
    let loc = path::Path::new(dir);
    match loc.extension() {
        Some(ext) if ext == STORE_EXTENSION => dir.to_os_string(),
        _ => {
            let mut loc = loc.as_os_str().to_os_string();
            loc.push(".");
            loc.push(STORE_EXTENSION);
            loc
        }
    }
}

fn info_location(store_dir: &ffi::OsStr) -> ffi::OsString {
    let mut loc = path::PathBuf::from(store_dir);
    loc.push("Info.json");
    loc.into_os_string()
}

fn snapshots_dir(store_dir: &ffi::OsStr) -> ffi::OsString {
    let mut loc = path::PathBuf::from(store_dir);
    loc.push("Snapshots");
    loc.into_os_string()
}

fn backups_dir(store_dir: &ffi::OsStr) -> ffi::OsString {
    let mut loc = path::PathBuf::from(store_dir);
    loc.push("Backups");
    loc.into_os_string()
}
