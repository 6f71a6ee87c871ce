//! Module `index` implement one ordered index over entries, realized as
//! an [IndexManifest] plus its [Page]s.
//!
//! Within any manifest the decoded entries are strictly ordered by the
//! index's comparison key, identifier for the primary index and
//! `(indexed value, identifier)` for secondary indexes, with no
//! duplicates. Lookup binary-searches page boundary keys, then scans
//! blocks within the located page. All mutations are copy-on-write: a
//! changed page is rewritten under a fresh identity and the manifest is
//! remapped, the old page file stays behind for earlier readers.

use std::{cmp, collections::HashMap, ffi, ops::Bound, vec};

use crate::{
    dated::DatedId,
    page::{self, pack, unpack, Block, Entry, Page, PAGE_MARKER},
    Error, Result,
};

pub mod cursor;
pub mod manifest;

pub use cursor::{CursorPos, InsertionCursor, InstanceCursor};
pub use manifest::{IndexManifest, ManifestFileName, PageInfo};

/// Flavor of an index.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum IndexKind {
    /// Ordered by identifier, record body stored inline.
    Primary,
    /// Ordered by `(indexed value, identifier)`, record body stored inline.
    Direct,
    /// Ordered by `(indexed value, identifier)`, body resolved via the
    /// primary index.
    Reference,
}

/// Selects one index within a datastore.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum IndexSel {
    Primary,
    Direct(String),
    Secondary(String),
}

/// Declared ordering for identifier bytes.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum KeyOrder {
    /// Plain byte order.
    Lexicographic,
    /// Identifiers are UUIDs, compared as big-endian 128-bit integers.
    Uuid,
    /// Identifiers are dated-id rawvalues; byte order is already
    /// chronological.
    Dated,
}

impl KeyOrder {
    pub fn compare(&self, a: &[u8], b: &[u8]) -> cmp::Ordering {
        match self {
            KeyOrder::Lexicographic | KeyOrder::Dated => a.cmp(b),
            KeyOrder::Uuid => match (uuid_num(a), uuid_num(b)) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => a.cmp(b),
            },
        }
    }
}

fn uuid_num(bytes: &[u8]) -> Option<u128> {
    use std::convert::TryInto;

    match bytes.len() {
        16 => {
            let raw: [u8; 16] = bytes.try_into().ok()?;
            Some(u128::from_be_bytes(raw))
        }
        _ => {
            let s = std::str::from_utf8(bytes).ok()?;
            uuid::Uuid::parse_str(s).ok().map(|u| u.as_u128())
        }
    }
}

/// Comparison key of one entry, indexed value (secondary indexes only)
/// plus identifier.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct EntryKey {
    pub value: Option<Vec<u8>>,
    pub identifier: Vec<u8>,
}

impl EntryKey {
    pub fn primary(identifier: &[u8]) -> EntryKey {
        EntryKey {
            value: None,
            identifier: identifier.to_vec(),
        }
    }

    pub fn secondary(value: &[u8], identifier: &[u8]) -> EntryKey {
        EntryKey {
            value: Some(value.to_vec()),
            identifier: identifier.to_vec(),
        }
    }

    /// Indexed values compare lexicographically, ties break on the
    /// identifier under its declared order.
    pub fn compare(&self, other: &EntryKey, order: KeyOrder) -> cmp::Ordering {
        let values = match (&self.value, &other.value) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, None) => cmp::Ordering::Equal,
            (None, Some(_)) => cmp::Ordering::Less,
            (Some(_), None) => cmp::Ordering::Greater,
        };
        match values {
            cmp::Ordering::Equal => order.compare(&self.identifier, &other.identifier),
            c => c,
        }
    }
}

/// Extract the comparison key from an entry of the given index kind.
pub fn entry_key(kind: IndexKind, entry: &Entry) -> Result<EntryKey> {
    let key = match kind {
        IndexKind::Primary => EntryKey::primary(entry.as_header(1)?),
        IndexKind::Direct => {
            EntryKey::secondary(entry.as_header(1)?, entry.as_header(2)?)
        }
        IndexKind::Reference => {
            EntryKey::secondary(entry.as_header(0)?, entry.as_header(1)?)
        }
    };
    Ok(key)
}

/// Outcome of a cursor lookup.
pub(crate) enum Lookup {
    Found { path: Vec<CursorPos>, entry: Entry },
    NotFound { at: Vec<CursorPos> },
}

/// One ordered index, a working copy of its manifest and page handles.
pub struct Index {
    kind: IndexKind,
    name: String,
    id: DatedId,
    order: KeyOrder,
    dir: ffi::OsString,
    manifest: IndexManifest,
    pages: HashMap<DatedId, Page>,
    boundaries: HashMap<usize, Option<EntryKey>>,
    dirty: bool,
    epoch: u64,
}

impl Index {
    /// Working copy over a manifest loaded from disk.
    pub fn loaded(
        kind: IndexKind,
        name: &str,
        id: DatedId,
        order: KeyOrder,
        manifest: IndexManifest,
        dir: ffi::OsString,
        pages: HashMap<DatedId, Page>,
    ) -> Index {
        Index {
            kind,
            name: name.to_string(),
            id,
            order,
            dir,
            manifest,
            pages,
            boundaries: HashMap::new(),
            dirty: false,
            epoch: 0,
        }
    }

    /// Fresh index with an empty manifest, not on disk yet.
    pub fn new_empty(
        kind: IndexKind,
        name: &str,
        id: DatedId,
        order: KeyOrder,
        manifest_id: DatedId,
        dir: ffi::OsString,
    ) -> Index {
        Index {
            kind,
            name: name.to_string(),
            id,
            order,
            dir,
            manifest: IndexManifest::new_empty(manifest_id),
            pages: HashMap::new(),
            boundaries: HashMap::new(),
            dirty: true,
            epoch: 0,
        }
    }

    pub fn to_kind(&self) -> IndexKind {
        self.kind
    }

    pub fn to_name(&self) -> String {
        self.name.to_string()
    }

    pub fn to_id(&self) -> DatedId {
        self.id.clone()
    }

    pub fn to_order(&self) -> KeyOrder {
        self.order
    }

    pub fn as_manifest(&self) -> &IndexManifest {
        &self.manifest
    }

    pub fn to_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Page handles this working copy loaded or created, for the owning
    /// datastore's tracked map.
    pub fn as_pages(&self) -> &HashMap<DatedId, Page> {
        &self.pages
    }

    fn page(&mut self, id: &DatedId) -> Page {
        match self.pages.get(id) {
            Some(page) => page.clone(),
            None => {
                let page = Page::open(id.clone(), page::to_page_location(&self.dir, id));
                self.pages.insert(id.clone(), page.clone());
                page
            }
        }
    }

    fn live_pages(&mut self) -> Vec<Page> {
        let ids: Vec<DatedId> = self.manifest.ordered_page_ids().collect();
        ids.iter().map(|id| self.page(id)).collect()
    }

    // first entry key on page `i`, None when no entry starts there.
    fn boundary(&mut self, i: usize, pages: &[Page]) -> Result<Option<EntryKey>> {
        if let Some(key) = self.boundaries.get(&i) {
            return Ok(key.clone());
        }
        let mut stream = EntryStream::new(pages.to_vec(), i);
        let key = match stream.next_entry()? {
            Some((path, entry)) if path[0].page_off == i => {
                Some(entry_key(self.kind, &entry)?)
            }
            _ => None,
        };
        self.boundaries.insert(i, key.clone());
        Ok(key)
    }

    // effective boundary for page `i`: walk left to the nearest page on
    // which an entry starts.
    fn eff_boundary(&mut self, i: usize, pages: &[Page]) -> Result<Option<EntryKey>> {
        for j in (0..=i).rev() {
            if let Some(key) = self.boundary(j, pages)? {
                return Ok(Some(key));
            }
        }
        Ok(None)
    }

    // page from which a scan for `key` must start: the largest page whose
    // effective boundary is <= key, else page 0.
    fn locate_start(&mut self, key: &EntryKey, pages: &[Page]) -> Result<usize> {
        if pages.is_empty() {
            return Ok(0);
        }
        let (mut lo, mut hi) = (0, pages.len() - 1);
        while lo < hi {
            let mid = (lo + hi + 1) / 2;
            match self.eff_boundary(mid, pages)? {
                Some(b) if b.compare(key, self.order) != cmp::Ordering::Greater => {
                    lo = mid
                }
                _ => hi = mid - 1,
            }
        }
        Ok(lo)
    }

    /// Locate `key`, returning either the entry's block path or the gap
    /// where an entry with that key belongs.
    pub(crate) fn lookup(&mut self, key: &EntryKey) -> Result<Lookup> {
        let pages = self.live_pages();
        if pages.is_empty() {
            return Ok(Lookup::NotFound { at: vec![] });
        }

        let start = self.locate_start(key, &pages)?;
        let mut stream = EntryStream::new(pages.clone(), start);
        while let Some((path, entry)) = stream.next_entry()? {
            let ekey = entry_key(self.kind, &entry)?;
            match ekey.compare(key, self.order) {
                cmp::Ordering::Less => continue,
                cmp::Ordering::Equal => return Ok(Lookup::Found { path, entry }),
                cmp::Ordering::Greater => {
                    return Ok(Lookup::NotFound {
                        at: path[..1].to_vec(),
                    })
                }
            }
        }

        // every entry is smaller, append after the last block.
        let last = pages.len() - 1;
        let n_blocks = pages[last].to_blocks()?.len();
        let at = vec![CursorPos {
            page_off: last,
            page_id: pages[last].to_id(),
            block_off: n_blocks,
        }];
        Ok(Lookup::NotFound { at })
    }

    /// Lazy ordered scan. `lo`/`hi` bound the scalar the index sorts on,
    /// identifier for primary, indexed value for secondary kinds.
    pub(crate) fn scan(
        &mut self,
        lo: Bound<Vec<u8>>,
        hi: Bound<Vec<u8>>,
        reverse: bool,
    ) -> Result<Scan> {
        let pages = self.live_pages();

        let start = match &lo {
            Bound::Unbounded => 0,
            Bound::Included(scalar) | Bound::Excluded(scalar) => {
                let key = match self.kind {
                    IndexKind::Primary => EntryKey::primary(scalar),
                    _ => EntryKey::secondary(scalar, &[]),
                };
                self.locate_start(&key, &pages)?
            }
        };

        let forward = Scan {
            stream: EntryStream::new(pages, start),
            kind: self.kind,
            order: self.order,
            lo,
            hi,
            buffered: None,
            done: false,
        };

        match reverse {
            false => Ok(forward),
            true => forward.into_reverse(),
        }
    }

    /// Splice `entry` in at the cursor gap `at`; empty `at` means the
    /// beginning of the index. Pages that overflow the target size split
    /// at a block boundary near the middle.
    pub(crate) fn insert(
        &mut self,
        at: &[CursorPos],
        entry: &Entry,
        page_size: usize,
    ) -> Result<()> {
        self.materialize();
        let data = entry.encode();
        let max_space = page_size - PAGE_MARKER.len();

        let ordered: Vec<DatedId> = self.manifest.ordered_page_ids().collect();
        if ordered.is_empty() {
            let blocks = pack(&data, max_space, max_space)?;
            for (live_pos, chunk) in split_into_pages(blocks, page_size).into_iter().enumerate()
            {
                let id = DatedId::generate();
                self.manifest.insert_page(live_pos, id.clone());
                self.pages.insert(id.clone(), Page::new_fresh(id, chunk));
            }
        } else {
            let (page_off, block_off) = match at {
                [] => (0, 0),
                [first, ..] => (first.page_off, first.block_off),
            };
            let target_id = match ordered.get(page_off) {
                Some(id) => id.clone(),
                None => err_at!(Fatal, msg: "insertion past page {}", page_off)?,
            };
            let target = self.page(&target_id);
            let mut blocks = target.to_blocks()?;
            if block_off > blocks.len() {
                err_at!(Fatal, msg: "insertion past block {}", block_off)?
            }

            let used = PAGE_MARKER.len()
                + blocks.iter().map(Block::encoded_len).sum::<usize>();
            let packed = pack(&data, page_size.saturating_sub(used), max_space)?;
            for (n, block) in packed.into_iter().enumerate() {
                blocks.insert(block_off + n, block);
            }

            let mut new_ids = vec![];
            for chunk in split_into_pages(blocks, page_size).into_iter() {
                let id = DatedId::generate();
                self.pages.insert(id.clone(), Page::new_fresh(id.clone(), chunk));
                new_ids.push(id);
            }
            self.manifest.replace_page(&target_id, &new_ids)?;
        }

        self.boundaries.clear();
        self.epoch += 1;
        Ok(())
    }

    /// Remove the entry whose blocks live at `path`. Pages left empty are
    /// dropped from the manifest without replacement.
    pub(crate) fn remove(&mut self, path: &[CursorPos], page_size: usize) -> Result<Entry> {
        if path.is_empty() {
            return err_at!(Fatal, msg: "empty cursor path");
        }
        self.materialize();

        // group the entry's block offsets per page, in order.
        let mut groups: Vec<(DatedId, Vec<usize>)> = vec![];
        for pos in path.iter() {
            match groups.last_mut() {
                Some((id, offs)) if *id == pos.page_id => offs.push(pos.block_off),
                _ => groups.push((pos.page_id.clone(), vec![pos.block_off])),
            }
        }

        let mut removed_blocks = vec![];
        for (page_id, offs) in groups.into_iter() {
            let page = self.page(&page_id);
            let blocks = page.to_blocks()?;
            let mut kept = vec![];
            for (off, block) in blocks.into_iter().enumerate() {
                match offs.contains(&off) {
                    true => removed_blocks.push(block),
                    false => kept.push(block),
                }
            }
            if kept.is_empty() {
                self.manifest.remove_page(&page_id)?;
            } else {
                let mut new_ids = vec![];
                for chunk in split_into_pages(kept, page_size).into_iter() {
                    let id = DatedId::generate();
                    self.pages.insert(id.clone(), Page::new_fresh(id.clone(), chunk));
                    new_ids.push(id);
                }
                self.manifest.replace_page(&page_id, &new_ids)?;
            }
        }

        self.boundaries.clear();
        self.epoch += 1;

        let data = unpack(&removed_blocks)?;
        match Entry::decode(&data) {
            Ok(entry) => Ok(entry),
            Err(_) => err_at!(InvalidEntryFormat, msg: "removed entry"),
        }
    }

    /// Discard every page, leaving an empty manifest. Callers reinsert
    /// afresh.
    pub(crate) fn reset(&mut self) {
        self.materialize();
        self.manifest.reset();
        self.boundaries.clear();
        self.epoch += 1;
    }

    /// Persist pending pages and, if changed, the manifest itself. Return
    /// the manifest id when a manifest file was written.
    pub fn persist_if_needed(&mut self) -> Result<Option<DatedId>> {
        if !self.dirty {
            return Ok(None);
        }
        for id in self.manifest.added_page_ids().collect::<Vec<DatedId>>() {
            let location = page::to_page_location(&self.dir, &id);
            self.page(&id).persist_if_needed(&location)?;
        }
        let manifest_id = self.manifest.to_id();
        let location = manifest::to_manifest_location(&self.dir, &manifest_id);
        crate::util::atomic_write(&location, &self.manifest.encode())?;
        self.dirty = false;
        Ok(Some(manifest_id))
    }

    // first mutation in this working copy starts a fresh manifest
    // identity, carrying forward the committed page list.
    fn materialize(&mut self) {
        if !self.dirty {
            self.manifest = self.manifest.carried_forward(DatedId::generate());
            self.dirty = true;
        }
    }
}

// cut an overflowing block list into page sized chunks, always at block
// boundaries, near the middle.
fn split_into_pages(blocks: Vec<Block>, page_size: usize) -> Vec<Vec<Block>> {
    let total: usize =
        PAGE_MARKER.len() + blocks.iter().map(Block::encoded_len).sum::<usize>();
    if total <= page_size || blocks.len() <= 1 {
        return vec![blocks];
    }

    let mut acc = PAGE_MARKER.len();
    let mut cut = 0;
    for (i, block) in blocks.iter().enumerate() {
        if i + 1 == blocks.len() {
            break;
        }
        acc += block.encoded_len();
        cut = i + 1;
        if acc >= total / 2 {
            break;
        }
    }

    let mut left = blocks;
    let right = left.split_off(cut);
    let mut out = split_into_pages(left, page_size);
    out.extend(split_into_pages(right, page_size));
    out
}

/// Streams entries across the ordered page list, reassembling entries
/// that straddle pages and reporting the block path of each.
pub(crate) struct EntryStream {
    pages: Vec<Page>,
    page_off: usize,
    blocks: Option<page::Blocks>,
    block_off: usize,
    skip_continuation: bool,
}

impl EntryStream {
    pub(crate) fn new(pages: Vec<Page>, start_page: usize) -> EntryStream {
        EntryStream {
            pages,
            page_off: start_page,
            blocks: None,
            block_off: 0,
            skip_continuation: start_page > 0,
        }
    }

    fn next_block(&mut self) -> Result<Option<(CursorPos, Block)>> {
        loop {
            if self.page_off >= self.pages.len() {
                return Ok(None);
            }
            if self.blocks.is_none() {
                self.blocks = Some(self.pages[self.page_off].blocks());
                self.block_off = 0;
            }
            match self.blocks.as_mut().unwrap().next() {
                Some(block) => {
                    let pos = CursorPos {
                        page_off: self.page_off,
                        page_id: self.pages[self.page_off].to_id(),
                        block_off: self.block_off,
                    };
                    self.block_off += 1;
                    return Ok(Some((pos, block?)));
                }
                None => {
                    self.page_off += 1;
                    self.blocks = None;
                }
            }
        }
    }

    pub(crate) fn next_entry(&mut self) -> Result<Option<(Vec<CursorPos>, Entry)>> {
        let (pos, block) = loop {
            match self.next_block()? {
                None => return Ok(None),
                Some((pos, block)) => match block {
                    Block::Slice(_) | Block::Tail(_) if self.skip_continuation => {
                        continue
                    }
                    block => {
                        self.skip_continuation = false;
                        break (pos, block);
                    }
                },
            }
        };

        let mut path = vec![pos];
        let mut collected = vec![];
        match block {
            Block::Complete(_) => collected.push(block),
            Block::Head(_) => {
                collected.push(block);
                loop {
                    match self.next_block()? {
                        None => {
                            return err_at!(InvalidPageFormat, msg: "unterminated entry")
                        }
                        Some((pos, block)) => match block {
                            Block::Slice(_) => {
                                path.push(pos);
                                collected.push(block);
                            }
                            Block::Tail(_) => {
                                path.push(pos);
                                collected.push(block);
                                break;
                            }
                            _ => {
                                return err_at!(
                                    InvalidPageFormat, msg: "entry interleaved"
                                )
                            }
                        },
                    }
                }
            }
            _ => return err_at!(InvalidPageFormat, msg: "orphan continuation"),
        };

        let data = unpack(&collected)?;
        let entry = match Entry::decode(&data) {
            Ok(entry) => entry,
            Err(_) => return err_at!(InvalidEntryFormat, msg: "entry decode"),
        };
        Ok(Some((path, entry)))
    }
}

/// Lazy ordered producer over a bounded range of one index. Pulling the
/// next item is what lets a consumer apply backpressure.
pub struct Scan {
    stream: EntryStream,
    kind: IndexKind,
    order: KeyOrder,
    lo: Bound<Vec<u8>>,
    hi: Bound<Vec<u8>>,
    buffered: Option<vec::IntoIter<(EntryKey, Entry)>>,
    done: bool,
}

impl Scan {
    // the scalar this index orders on.
    fn scalar(kind: IndexKind, key: &EntryKey) -> Vec<u8> {
        match kind {
            IndexKind::Primary => key.identifier.clone(),
            _ => key.value.clone().unwrap_or_default(),
        }
    }

    fn scalar_order(&self) -> KeyOrder {
        match self.kind {
            IndexKind::Primary => self.order,
            _ => KeyOrder::Lexicographic,
        }
    }

    fn above_lo(&self, scalar: &[u8]) -> bool {
        let order = self.scalar_order();
        match &self.lo {
            Bound::Unbounded => true,
            Bound::Included(b) => order.compare(scalar, b) != cmp::Ordering::Less,
            Bound::Excluded(b) => order.compare(scalar, b) == cmp::Ordering::Greater,
        }
    }

    fn below_hi(&self, scalar: &[u8]) -> bool {
        let order = self.scalar_order();
        match &self.hi {
            Bound::Unbounded => true,
            Bound::Included(b) => order.compare(scalar, b) != cmp::Ordering::Greater,
            Bound::Excluded(b) => order.compare(scalar, b) == cmp::Ordering::Less,
        }
    }

    fn into_reverse(mut self) -> Result<Scan> {
        let mut items = vec![];
        loop {
            match self.step()? {
                Some(item) => items.push(item),
                None => break,
            }
        }
        items.reverse();
        self.buffered = Some(items.into_iter());
        self.done = false;
        Ok(self)
    }

    fn step(&mut self) -> Result<Option<(EntryKey, Entry)>> {
        if self.done {
            return Ok(None);
        }
        if let Some(buffered) = &mut self.buffered {
            return Ok(buffered.next());
        }
        while let Some((_path, entry)) = self.stream.next_entry()? {
            let key = entry_key(self.kind, &entry)?;
            let scalar = Scan::scalar(self.kind, &key);
            if !self.above_lo(&scalar) {
                continue;
            }
            if !self.below_hi(&scalar) {
                self.done = true;
                return Ok(None);
            }
            return Ok(Some((key, entry)));
        }
        self.done = true;
        Ok(None)
    }
}

impl Iterator for Scan {
    type Item = Result<(EntryKey, Entry)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
