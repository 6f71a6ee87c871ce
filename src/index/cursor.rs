//! Cursors, opaque positions within one index.
//!
//! A cursor is only valid within the transaction that produced it. Both
//! cursor types carry the owning persistence token and the transaction
//! serial; supplying them to another persistence raises `UnknownCursor`,
//! supplying them to a later transaction raises `StaleCursor`.

use crate::{
    dated::DatedId,
    index::{EntryKey, IndexSel},
};

/// Position of one block within one index, as (page offset within the
/// ordered page list, page id, block offset within the page).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct CursorPos {
    pub page_off: usize,
    pub page_id: DatedId,
    pub block_off: usize,
}

/// Cursor locating an existing entry. `path` holds one position per block
/// the entry occupies, in order.
#[derive(Clone, Debug)]
pub struct InstanceCursor {
    pub(crate) store_token: u64,
    pub(crate) txn_serial: u64,
    pub(crate) cursor_token: u64,
    pub(crate) epoch: u64,
    pub(crate) datastore: String,
    pub(crate) index: IndexSel,
    pub(crate) path: Vec<CursorPos>,
    pub(crate) key: EntryKey,
}

/// Cursor locating the gap where a new entry belongs. An empty `at` means
/// insert at the beginning (also the empty-index case); a position whose
/// block offset equals the page's block count means append.
#[derive(Clone, Debug)]
pub struct InsertionCursor {
    pub(crate) store_token: u64,
    pub(crate) txn_serial: u64,
    pub(crate) cursor_token: u64,
    pub(crate) epoch: u64,
    pub(crate) datastore: String,
    pub(crate) index: IndexSel,
    pub(crate) at: Vec<CursorPos>,
    pub(crate) key: EntryKey,
}

impl InstanceCursor {
    /// Comparison key of the entry this cursor points at.
    pub fn to_key(&self) -> EntryKey {
        self.key.clone()
    }
}

impl InsertionCursor {
    pub fn to_key(&self) -> EntryKey {
        self.key.clone()
    }
}
