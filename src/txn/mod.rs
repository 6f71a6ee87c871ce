//! Module `txn` implement the transaction scheduler.
//!
//! Top-level read-write transactions on one persistence are linearized
//! behind its writer gate; read-only transactions run concurrently and
//! are pinned to the iteration current at the moment they start. The
//! currently active transaction travels in a thread-local context stack:
//! a transaction started inside another one on the same persistence
//! attaches to it as a child, while a read-write transaction started
//! inside a different persistence's active transaction is refused.
//!
//! All record operations go through [Transaction], which dispatches them
//! to per-datastore working copies. On success the working copies are
//! committed as one new iteration: pages, then manifests, then roots,
//! then the iteration file, then the snapshot manifest (the commit
//! point), then the store info. On failure everything in memory is
//! discarded and no file that matters was touched.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashSet},
    ops::Bound,
    rc::{Rc, Weak},
    sync::{atomic::Ordering::SeqCst, Arc},
};

use crate::{
    index::{
        entry_key, EntryKey, IndexKind, IndexSel, InsertionCursor, InstanceCursor,
        Lookup,
    },
    page::Entry,
    persist::Persistence,
    snap::DatastoreRef,
    store::{DatastoreKey, Event, WorkingStore},
    Error, Result,
};

/// Transaction mode.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Mode {
    ReadOnly,
    ReadWrite,
}

/// One bound of a range expression.
#[derive(Clone, Debug)]
pub enum ScanBound {
    /// Open end.
    Extent,
    Including(Vec<u8>),
    Excluding(Vec<u8>),
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ScanOrder {
    Ascending,
    Descending,
}

/// One entry yielded to a range-scan consumer.
#[derive(Clone, Debug)]
pub struct ScanItem {
    pub identifier: Vec<u8>,
    /// Indexed value, absent for primary-index scans.
    pub index_value: Option<Vec<u8>>,
    /// Record version, absent for reference-index scans.
    pub version: Option<Vec<u8>>,
    /// Record body. For reference indexes this is resolved through the
    /// primary index and absent when the record is gone.
    pub content: Option<Vec<u8>>,
}

pub(crate) struct TxnState {
    persistence: Persistence,
    mode: Mode,
    serial: u64,
    action: Option<String>,
    base: Option<crate::snap::SnapshotIteration>,
    working: BTreeMap<String, WorkingStore>,
    consumed: HashSet<u64>,
    next_cursor: u64,
    active: bool,
}

#[derive(Clone)]
struct Frame {
    store_token: u64,
    mode: Mode,
    state: Weak<RefCell<TxnState>>,
}

thread_local! {
    // stack of transactions active on this thread, innermost last.
    static CTX: RefCell<Vec<Frame>> = RefCell::new(vec![]);
}

struct FrameGuard;

impl Drop for FrameGuard {
    fn drop(&mut self) {
        CTX.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

/// Run `f` inside a transaction of the given mode on `persistence`.
pub(crate) fn run<T, F>(
    persistence: &Persistence,
    mode: Mode,
    action: Option<&str>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut Transaction) -> Result<T>,
{
    let parent = CTX.with(|stack| stack.borrow().last().cloned());
    if let Some(frame) = parent {
        if frame.store_token == persistence.inner.token {
            // attach to the parent as a child transaction. Children on
            // one thread are serial by construction.
            let state = match frame.state.upgrade() {
                Some(state) => state,
                None => return err_at!(Fatal, msg: "stale transaction frame"),
            };
            if mode == Mode::ReadWrite && frame.mode == Mode::ReadOnly {
                return err_at!(CannotWrite, msg: "read-only parent transaction");
            }
            let mut txn = Transaction { inner: state, mode };
            return f(&mut txn);
        }
        if mode == Mode::ReadWrite {
            return err_at!(
                TransactingWithinExternalPersistence,
                msg: "write inside foreign transaction"
            );
        }
    }

    match mode {
        Mode::ReadWrite => run_write(persistence, action, f),
        Mode::ReadOnly => run_read(persistence, f),
    }
}

fn run_write<T, F>(persistence: &Persistence, action: Option<&str>, f: F) -> Result<T>
where
    F: FnOnce(&mut Transaction) -> Result<T>,
{
    if persistence.is_read_only() {
        return err_at!(CannotWrite, msg: "read-only persistence");
    }

    // one top-level writer at a time; taking the gate awaits the
    // previous non-readonly transaction.
    let gate = Arc::clone(&persistence.inner.write_gate);
    let _guard = gate.lock().unwrap();

    persistence.ensure_initialized()?;
    let base = match persistence.current_iteration()? {
        Some(base) => base,
        None => return err_at!(Fatal, msg: "initialized store has no iteration"),
    };

    let serial = persistence.inner.txn_serial.fetch_add(1, SeqCst) + 1;
    let state = Rc::new(RefCell::new(TxnState {
        persistence: persistence.clone(),
        mode: Mode::ReadWrite,
        serial,
        action: action.map(|action| action.to_string()),
        base: Some(base),
        working: BTreeMap::new(),
        consumed: HashSet::new(),
        next_cursor: 0,
        active: true,
    }));

    let res = with_frame(persistence.inner.token, Mode::ReadWrite, &state, f);
    match res {
        Ok(val) => {
            commit(&state)?;
            Ok(val)
        }
        Err(err) => {
            // discard the working copy, nothing was persisted.
            let mut st = state.borrow_mut();
            st.active = false;
            st.working.clear();
            log::debug!("transaction {} rolled back: {}", serial, err);
            Err(err)
        }
    }
}

fn run_read<T, F>(persistence: &Persistence, f: F) -> Result<T>
where
    F: FnOnce(&mut Transaction) -> Result<T>,
{
    let base = persistence.current_iteration()?;
    let pinned = base.as_ref().map(|base| base.id.clone());
    if let Some(id) = &pinned {
        persistence.pin_reader(id);
    }

    let serial = persistence.inner.txn_serial.fetch_add(1, SeqCst) + 1;
    let state = Rc::new(RefCell::new(TxnState {
        persistence: persistence.clone(),
        mode: Mode::ReadOnly,
        serial,
        action: None,
        base,
        working: BTreeMap::new(),
        consumed: HashSet::new(),
        next_cursor: 0,
        active: true,
    }));

    let res = with_frame(persistence.inner.token, Mode::ReadOnly, &state, f);
    state.borrow_mut().active = false;
    if let Some(id) = &pinned {
        persistence.unpin_reader(id);
    }
    res
}

fn with_frame<T, F>(
    store_token: u64,
    mode: Mode,
    state: &Rc<RefCell<TxnState>>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut Transaction) -> Result<T>,
{
    CTX.with(|stack| {
        stack.borrow_mut().push(Frame {
            store_token,
            mode,
            state: Rc::downgrade(state),
        })
    });
    let _guard = FrameGuard;
    let mut txn = Transaction {
        inner: Rc::clone(state),
        mode,
    };
    f(&mut txn)
}

// pages -> manifests -> roots -> iteration -> snapshot manifest ->
// store info. Every step is an atomic replace; the snapshot manifest
// rewrite is the single commit point.
fn commit(state: &Rc<RefCell<TxnState>>) -> Result<()> {
    let mut st = state.borrow_mut();
    st.active = false;

    let touched: Vec<String> = st
        .working
        .iter()
        .filter(|(_, ws)| ws.is_touched())
        .map(|(name, _)| name.clone())
        .collect();
    if touched.is_empty() {
        return Ok(());
    }

    let action = st.action.clone();
    let base = match st.base.as_ref() {
        Some(base) => base.clone(),
        None => return err_at!(Fatal, msg: "write transaction without base"),
    };
    let mut next = base.successor(action.as_deref());

    for name in touched.iter() {
        let ws = st.working.get_mut(name).unwrap();
        let root_id = ws.persist()?;
        next.data_stores.insert(
            name.clone(),
            DatastoreRef {
                key: ws.ds.to_key().to_string(),
                id: ws.id.clone(),
                root: root_id.clone(),
            },
        );
        if ws.is_created() {
            next.added_datastores.push(ws.id.clone());
            next.added_datastore_roots.push(root_id);
        } else if Some(&root_id) != ws.base_root_id.as_ref() {
            next.added_datastore_roots.push(root_id);
            next.removed_datastore_roots.push(ws.base_root_id.clone().unwrap());
        }
    }

    let persistence = st.persistence.clone();
    {
        let mut snapshot = persistence.inner.snapshot.lock().unwrap();
        let snapshot = match snapshot.as_mut() {
            Some(snapshot) => Ok(snapshot),
            None => err_at!(Fatal, msg: "committing without a snapshot"),
        }?;
        snapshot.update(|s| s.commit_iteration(next.clone()))?;
    }
    persistence.update_info(|_| Ok(()))?;

    for name in touched.iter() {
        st.working.get_mut(name).unwrap().settle();
    }
    log::info!(
        "committed iteration {} action {:?}",
        next.id,
        action.as_deref().unwrap_or("-")
    );

    persistence.post_prune();
    Ok(())
}

impl TxnState {
    fn check_active(&self) -> Result<()> {
        match self.active {
            true => Ok(()),
            false => err_at!(TransactionInactive, msg: "transaction {}", self.serial),
        }
    }

    fn check_key(&self, key: &DatastoreKey) -> Result<()> {
        match key.store_token == self.persistence.inner.token {
            true => Ok(()),
            false => err_at!(WrongPersistence, msg: "key {}", key),
        }
    }

    fn working_store(&mut self, name: &str) -> Result<&mut WorkingStore> {
        if !self.working.contains_key(name) {
            let ds = self.persistence.registered(name)?;
            let dir = self.persistence.datastore_dir(&ds.to_key())?;
            let caches = Arc::clone(&self.persistence.inner.caches);

            let stored = self
                .base
                .as_ref()
                .and_then(|base| base.data_stores.get(name))
                .cloned();
            let mut ws = match stored {
                Some(stored) => {
                    WorkingStore::open(ds, dir, stored.id, stored.root, caches)?
                }
                None => match self.mode {
                    Mode::ReadOnly => {
                        return err_at!(DatastoreNotFound, msg: "datastore {}", name)
                    }
                    Mode::ReadWrite => WorkingStore::create(ds, dir, caches),
                },
            };
            if let Mode::ReadWrite = self.mode {
                let page_size = self.persistence.inner.config.target_page_size;
                ws.reconcile_descriptor(page_size)?;
            }
            self.working.insert(name.to_string(), ws);
        }
        Ok(self.working.get_mut(name).unwrap())
    }

    fn page_size(&self) -> usize {
        self.persistence.inner.config.target_page_size
    }

    fn next_cursor_token(&mut self) -> u64 {
        self.next_cursor += 1;
        self.next_cursor
    }
}

fn to_bound(bound: ScanBound) -> Bound<Vec<u8>> {
    match bound {
        ScanBound::Extent => Bound::Unbounded,
        ScanBound::Including(scalar) => Bound::Included(scalar),
        ScanBound::Excluding(scalar) => Bound::Excluded(scalar),
    }
}

fn sel_kind(sel: &IndexSel) -> IndexKind {
    match sel {
        IndexSel::Primary => IndexKind::Primary,
        IndexSel::Direct(_) => IndexKind::Direct,
        IndexSel::Secondary(_) => IndexKind::Reference,
    }
}

/// Handle to the currently active transaction. All record operations of
/// the datastore interface live here.
pub struct Transaction {
    inner: Rc<RefCell<TxnState>>,
    mode: Mode,
}

impl Transaction {
    pub fn to_mode(&self) -> Mode {
        self.mode
    }

    pub fn to_action(&self) -> Option<String> {
        self.inner.borrow().action.clone()
    }

    pub fn to_serial(&self) -> u64 {
        self.inner.borrow().serial
    }

    /// Load the datastore's working copy, reconciling a changed
    /// descriptor (and re-indexing) as a side effect.
    pub fn touch(&mut self, name: &str) -> Result<()> {
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.working_store(name)?;
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        match self.mode {
            Mode::ReadWrite => Ok(()),
            Mode::ReadOnly => err_at!(CannotWrite, msg: "read-only transaction"),
        }
    }

    // ---- cursors

    fn lookup_cursor(
        &mut self,
        key: &DatastoreKey,
        sel: IndexSel,
        ekey: EntryKey,
    ) -> Result<InstanceCursor> {
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let (lookup, epoch) = {
            let ws = st.working_store(&key.to_name())?;
            let epoch = ws.index_epoch(&sel)?;
            (ws.lookup(&sel, &ekey)?, epoch)
        };
        match lookup {
            Lookup::Found { path, .. } => {
                let cursor_token = st.next_cursor_token();
                Ok(InstanceCursor {
                    store_token: st.persistence.inner.token,
                    txn_serial: st.serial,
                    cursor_token,
                    epoch,
                    datastore: key.to_name(),
                    index: sel,
                    path,
                    key: ekey,
                })
            }
            Lookup::NotFound { .. } => {
                err_at!(InstanceNotFound, msg: "{:?}", ekey.identifier)
            }
        }
    }

    fn insertion_cursor(
        &mut self,
        key: &DatastoreKey,
        sel: IndexSel,
        ekey: EntryKey,
    ) -> Result<InsertionCursor> {
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let (lookup, epoch) = {
            let ws = st.working_store(&key.to_name())?;
            let epoch = ws.index_epoch(&sel)?;
            (ws.lookup(&sel, &ekey)?, epoch)
        };
        match lookup {
            Lookup::Found { .. } => {
                err_at!(InstanceAlreadyExists, msg: "{:?}", ekey.identifier)
            }
            Lookup::NotFound { at } => {
                let cursor_token = st.next_cursor_token();
                Ok(InsertionCursor {
                    store_token: st.persistence.inner.token,
                    txn_serial: st.serial,
                    cursor_token,
                    epoch,
                    datastore: key.to_name(),
                    index: sel,
                    at,
                    key: ekey,
                })
            }
        }
    }

    fn consume_insertion(
        st: &mut TxnState,
        key: &DatastoreKey,
        cursor: &InsertionCursor,
    ) -> Result<()> {
        if cursor.store_token != st.persistence.inner.token
            || cursor.datastore != key.to_name()
        {
            return err_at!(UnknownCursor, msg: "cursor from another persistence");
        }
        if cursor.txn_serial != st.serial || st.consumed.contains(&cursor.cursor_token) {
            return err_at!(StaleCursor, msg: "cursor {}", cursor.cursor_token);
        }
        let epoch = st.working_store(&cursor.datastore)?.index_epoch(&cursor.index)?;
        if epoch != cursor.epoch {
            return err_at!(StaleCursor, msg: "index mutated since cursor");
        }
        st.consumed.insert(cursor.cursor_token);
        Ok(())
    }

    fn consume_instance(
        st: &mut TxnState,
        key: &DatastoreKey,
        cursor: &InstanceCursor,
    ) -> Result<()> {
        if cursor.store_token != st.persistence.inner.token
            || cursor.datastore != key.to_name()
        {
            return err_at!(UnknownCursor, msg: "cursor from another persistence");
        }
        if cursor.txn_serial != st.serial || st.consumed.contains(&cursor.cursor_token) {
            return err_at!(StaleCursor, msg: "cursor {}", cursor.cursor_token);
        }
        let epoch = st.working_store(&cursor.datastore)?.index_epoch(&cursor.index)?;
        if epoch != cursor.epoch {
            return err_at!(StaleCursor, msg: "index mutated since cursor");
        }
        st.consumed.insert(cursor.cursor_token);
        Ok(())
    }

    // ---- primary index

    pub fn primary_lookup_cursor(
        &mut self,
        key: &DatastoreKey,
        identifier: &[u8],
    ) -> Result<InstanceCursor> {
        self.lookup_cursor(key, IndexSel::Primary, EntryKey::primary(identifier))
    }

    pub fn primary_insertion_cursor(
        &mut self,
        key: &DatastoreKey,
        identifier: &[u8],
    ) -> Result<InsertionCursor> {
        self.insertion_cursor(key, IndexSel::Primary, EntryKey::primary(identifier))
    }

    /// Record body stored under `identifier`, `InstanceNotFound` when
    /// absent.
    pub fn load_primary_entry(
        &mut self,
        key: &DatastoreKey,
        identifier: &[u8],
    ) -> Result<Vec<u8>> {
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        let lookup = st
            .working_store(&key.to_name())?
            .lookup(&IndexSel::Primary, &EntryKey::primary(identifier))?;
        match lookup {
            Lookup::Found { entry, .. } => Ok(entry.into_content()),
            Lookup::NotFound { .. } => {
                err_at!(InstanceNotFound, msg: "{:?}", identifier)
            }
        }
    }

    /// Insert a fresh record at the cursor gap.
    pub fn insert_primary_entry(
        &mut self,
        key: &DatastoreKey,
        at: InsertionCursor,
        version: &[u8],
        identifier: &[u8],
        content: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_insertion(&mut st, key, &at)?;

        let entry = Entry::new_primary(version, identifier, content.to_vec());
        if entry_key(IndexKind::Primary, &entry)? != at.key {
            return err_at!(InvalidInput, msg: "entry does not match cursor key");
        }
        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        ws.insert(&at.index, &at.at, &entry, page_size)?;
        ws.push_event(Event::Created {
            identifier: identifier.to_vec(),
            entry: Some(content.to_vec()),
        });
        Ok(())
    }

    /// Replace the record the cursor points at.
    pub fn replace_primary_entry(
        &mut self,
        key: &DatastoreKey,
        at: InstanceCursor,
        version: &[u8],
        identifier: &[u8],
        content: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_instance(&mut st, key, &at)?;

        let entry = Entry::new_primary(version, identifier, content.to_vec());
        if entry_key(IndexKind::Primary, &entry)? != at.key {
            return err_at!(InvalidInput, msg: "entry does not match cursor key");
        }
        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        ws.remove(&at.index, &at.path, page_size)?;
        let gap = match ws.lookup(&at.index, &at.key)? {
            Lookup::NotFound { at } => at,
            Lookup::Found { .. } => {
                return err_at!(Fatal, msg: "entry survived its own removal")
            }
        };
        ws.insert(&at.index, &gap, &entry, page_size)?;
        ws.push_event(Event::Updated {
            identifier: identifier.to_vec(),
            entry: Some(content.to_vec()),
        });
        Ok(())
    }

    /// Upsert without a cursor; emits `Created` or `Updated`.
    pub fn persist_primary_entry(
        &mut self,
        key: &DatastoreKey,
        version: &[u8],
        identifier: &[u8],
        content: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let entry = Entry::new_primary(version, identifier, content.to_vec());
        let ekey = EntryKey::primary(identifier);
        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        let existed = match ws.lookup(&IndexSel::Primary, &ekey)? {
            Lookup::Found { path, .. } => {
                ws.remove(&IndexSel::Primary, &path, page_size)?;
                true
            }
            Lookup::NotFound { .. } => false,
        };
        let gap = match ws.lookup(&IndexSel::Primary, &ekey)? {
            Lookup::NotFound { at } => at,
            Lookup::Found { .. } => {
                return err_at!(Fatal, msg: "entry survived its own removal")
            }
        };
        ws.insert(&IndexSel::Primary, &gap, &entry, page_size)?;
        ws.push_event(match existed {
            true => Event::Updated {
                identifier: identifier.to_vec(),
                entry: Some(content.to_vec()),
            },
            false => Event::Created {
                identifier: identifier.to_vec(),
                entry: Some(content.to_vec()),
            },
        });
        Ok(())
    }

    /// Delete the record the cursor points at.
    pub fn delete_primary_entry(
        &mut self,
        key: &DatastoreKey,
        at: InstanceCursor,
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_instance(&mut st, key, &at)?;

        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        ws.remove(&at.index, &at.path, page_size)?;
        ws.push_event(Event::Deleted {
            identifier: at.key.identifier.clone(),
        });
        Ok(())
    }

    pub fn reset_primary_index(&mut self, key: &DatastoreKey) -> Result<()> {
        self.reset_index(key, IndexSel::Primary)
    }

    pub fn primary_index_scan<F>(
        &mut self,
        key: &DatastoreKey,
        lo: ScanBound,
        hi: ScanBound,
        order: ScanOrder,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(ScanItem) -> Result<bool>,
    {
        self.scan_index(key, IndexSel::Primary, lo, hi, order, f)
    }

    // ---- direct secondary indexes

    pub fn direct_lookup_cursor(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<InstanceCursor> {
        let sel = IndexSel::Direct(index_name.to_string());
        self.lookup_cursor(key, sel, EntryKey::secondary(value, identifier))
    }

    pub fn direct_insertion_cursor(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<InsertionCursor> {
        let sel = IndexSel::Direct(index_name.to_string());
        self.insertion_cursor(key, sel, EntryKey::secondary(value, identifier))
    }

    pub fn insert_direct_entry(
        &mut self,
        key: &DatastoreKey,
        at: InsertionCursor,
        version: &[u8],
        value: &[u8],
        identifier: &[u8],
        content: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_insertion(&mut st, key, &at)?;

        let entry = Entry::new_direct(version, value, identifier, content.to_vec());
        if entry_key(IndexKind::Direct, &entry)? != at.key {
            return err_at!(InvalidInput, msg: "entry does not match cursor key");
        }
        let page_size = st.page_size();
        st.working_store(&key.to_name())?.insert(&at.index, &at.at, &entry, page_size)
    }

    /// Upsert into one direct index.
    pub fn persist_direct_entry(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        version: &[u8],
        value: &[u8],
        identifier: &[u8],
        content: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let sel = IndexSel::Direct(index_name.to_string());
        let entry = Entry::new_direct(version, value, identifier, content.to_vec());
        let ekey = EntryKey::secondary(value, identifier);
        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        if let Lookup::Found { path, .. } = ws.lookup(&sel, &ekey)? {
            ws.remove(&sel, &path, page_size)?;
        }
        match ws.lookup(&sel, &ekey)? {
            Lookup::NotFound { at } => ws.insert(&sel, &at, &entry, page_size),
            Lookup::Found { .. } => err_at!(Fatal, msg: "entry survived its own removal"),
        }
    }

    pub fn delete_direct_entry(
        &mut self,
        key: &DatastoreKey,
        at: InstanceCursor,
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_instance(&mut st, key, &at)?;

        let page_size = st.page_size();
        st.working_store(&key.to_name())?.remove(&at.index, &at.path, page_size)?;
        Ok(())
    }

    pub fn reset_direct_index(&mut self, key: &DatastoreKey, index_name: &str) -> Result<()> {
        self.reset_index(key, IndexSel::Direct(index_name.to_string()))
    }

    /// Drop a direct index from the datastore altogether.
    pub fn delete_direct_index(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
    ) -> Result<()> {
        self.drop_index(key, IndexSel::Direct(index_name.to_string()))
    }

    pub fn direct_index_scan<F>(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        lo: ScanBound,
        hi: ScanBound,
        order: ScanOrder,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(ScanItem) -> Result<bool>,
    {
        self.scan_index(key, IndexSel::Direct(index_name.to_string()), lo, hi, order, f)
    }

    // ---- reference secondary indexes

    pub fn secondary_lookup_cursor(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<InstanceCursor> {
        let sel = IndexSel::Secondary(index_name.to_string());
        self.lookup_cursor(key, sel, EntryKey::secondary(value, identifier))
    }

    pub fn secondary_insertion_cursor(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<InsertionCursor> {
        let sel = IndexSel::Secondary(index_name.to_string());
        self.insertion_cursor(key, sel, EntryKey::secondary(value, identifier))
    }

    pub fn insert_secondary_entry(
        &mut self,
        key: &DatastoreKey,
        at: InsertionCursor,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_insertion(&mut st, key, &at)?;

        let entry = Entry::new_reference(value, identifier);
        if entry_key(IndexKind::Reference, &entry)? != at.key {
            return err_at!(InvalidInput, msg: "entry does not match cursor key");
        }
        let page_size = st.page_size();
        st.working_store(&key.to_name())?.insert(&at.index, &at.at, &entry, page_size)
    }

    /// Upsert into one reference index.
    pub fn persist_secondary_entry(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        value: &[u8],
        identifier: &[u8],
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let sel = IndexSel::Secondary(index_name.to_string());
        let entry = Entry::new_reference(value, identifier);
        let ekey = EntryKey::secondary(value, identifier);
        let page_size = st.page_size();
        let ws = st.working_store(&key.to_name())?;
        if let Lookup::Found { path, .. } = ws.lookup(&sel, &ekey)? {
            ws.remove(&sel, &path, page_size)?;
        }
        match ws.lookup(&sel, &ekey)? {
            Lookup::NotFound { at } => ws.insert(&sel, &at, &entry, page_size),
            Lookup::Found { .. } => err_at!(Fatal, msg: "entry survived its own removal"),
        }
    }

    pub fn delete_secondary_entry(
        &mut self,
        key: &DatastoreKey,
        at: InstanceCursor,
    ) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        Transaction::consume_instance(&mut st, key, &at)?;

        let page_size = st.page_size();
        st.working_store(&key.to_name())?.remove(&at.index, &at.path, page_size)?;
        Ok(())
    }

    pub fn reset_secondary_index(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
    ) -> Result<()> {
        self.reset_index(key, IndexSel::Secondary(index_name.to_string()))
    }

    /// Drop a reference index from the datastore altogether.
    pub fn delete_secondary_index(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
    ) -> Result<()> {
        self.drop_index(key, IndexSel::Secondary(index_name.to_string()))
    }

    pub fn secondary_index_scan<F>(
        &mut self,
        key: &DatastoreKey,
        index_name: &str,
        lo: ScanBound,
        hi: ScanBound,
        order: ScanOrder,
        f: F,
    ) -> Result<()>
    where
        F: FnMut(ScanItem) -> Result<bool>,
    {
        self.scan_index(
            key,
            IndexSel::Secondary(index_name.to_string()),
            lo,
            hi,
            order,
            f,
        )
    }

    // ---- shared plumbing

    fn reset_index(&mut self, key: &DatastoreKey, sel: IndexSel) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        st.working_store(&key.to_name())?.reset(&sel)
    }

    fn drop_index(&mut self, key: &DatastoreKey, sel: IndexSel) -> Result<()> {
        self.check_write()?;
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;
        st.working_store(&key.to_name())?.delete_index(&sel)
    }

    fn scan_index<F>(
        &mut self,
        key: &DatastoreKey,
        sel: IndexSel,
        lo: ScanBound,
        hi: ScanBound,
        order: ScanOrder,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(ScanItem) -> Result<bool>,
    {
        let mut st = self.inner.borrow_mut();
        st.check_active()?;
        st.check_key(key)?;

        let kind = sel_kind(&sel);
        let reverse = order == ScanOrder::Descending;
        let scan = st
            .working_store(&key.to_name())?
            .scan(&sel, to_bound(lo), to_bound(hi), reverse)?;

        for item in scan {
            let (ekey, entry) = item?;
            let scan_item = match kind {
                IndexKind::Primary => ScanItem {
                    identifier: ekey.identifier,
                    index_value: None,
                    version: Some(entry.as_header(0)?.to_vec()),
                    content: Some(entry.into_content()),
                },
                IndexKind::Direct => ScanItem {
                    identifier: ekey.identifier,
                    index_value: ekey.value,
                    version: Some(entry.as_header(0)?.to_vec()),
                    content: Some(entry.into_content()),
                },
                IndexKind::Reference => {
                    let content = st
                        .working_store(&key.to_name())?
                        .resolve_primary(&ekey.identifier)?;
                    ScanItem {
                        identifier: ekey.identifier,
                        index_value: ekey.value,
                        version: None,
                        content,
                    }
                }
            };
            if !f(scan_item)? {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
