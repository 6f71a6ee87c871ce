//! Module `page` implement the page file, unit of on-disk storage for
//! index entries.
//!
//! A page file is the magic `PAGE\n` followed by framed [Block]s. Pages
//! are immutable once persisted, a given page id resolves to exactly one
//! byte sequence forever. Updates are realized by writing a new page and
//! remapping the containing manifest.
//!
//! Pages are read lazily. [Page::blocks] hands out any number of
//! restartable block streams over the same underlying file; consumed
//! blocks are memoized in a buffer shared by all streams, and the file
//! handle is dropped as soon as the last block is produced.

use lazy_static::lazy_static;

use std::{
    convert::TryFrom,
    ffi, fmt, fs, io, path, result,
    str::FromStr,
    sync::{Arc, Mutex, Weak},
};

use crate::{dated::DatedId, util, Error, Result};

pub mod block;
pub mod entry;

pub use block::{pack, unpack, usable_space, Block};
pub use entry::Entry;

lazy_static! {
    pub static ref PAGE_MARKER: Vec<u8> = "PAGE\n".as_bytes().to_vec();
}

/// A page file is named by its dated identifier,
/// `format!("{}.datastorepage", id)`.
#[derive(Clone)]
pub struct PageFileName(pub ffi::OsString);

impl From<DatedId> for PageFileName {
    fn from(id: DatedId) -> PageFileName {
        let file_name = format!("{}.datastorepage", id);
        PageFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl TryFrom<PageFileName> for DatedId {
    type Error = Error;

    fn try_from(fname: PageFileName) -> Result<DatedId> {
        let fname = match fname.0.to_str() {
            Some(fname) => fname,
            None => return err_at!(InvalidFile, msg: "{:?}", fname.0),
        };
        match fname.strip_suffix(".datastorepage") {
            Some(stem) => DatedId::from_str(stem),
            None => err_at!(InvalidFile, msg: "{:?}", fname),
        }
    }
}

impl fmt::Display for PageFileName {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// Lazy, shareable handle over one page. Clones share the same memoized
/// block buffer.
#[derive(Clone)]
pub struct Page {
    id: DatedId,
    inner: Arc<Mutex<InnerPage>>,
}

enum InnerPage {
    // created by this transaction, not on disk yet.
    Fresh { blocks: Vec<Block> },
    // backed by a page file, read lazily block by block.
    OnDisk {
        location: ffi::OsString,
        buf: BlockBuf,
    },
}

struct BlockBuf {
    blocks: Vec<Block>,
    file: Option<io::BufReader<fs::File>>,
    started: bool,
    done: bool,
}

impl Page {
    /// Create an in-memory page holding `blocks`, pending persistence.
    pub fn new_fresh(id: DatedId, blocks: Vec<Block>) -> Page {
        Page {
            id,
            inner: Arc::new(Mutex::new(InnerPage::Fresh { blocks })),
        }
    }

    /// Handle over a page file at `location`. Nothing is read until the
    /// first block is demanded.
    pub fn open(id: DatedId, location: ffi::OsString) -> Page {
        let buf = BlockBuf {
            blocks: vec![],
            file: None,
            started: false,
            done: false,
        };
        Page {
            id,
            inner: Arc::new(Mutex::new(InnerPage::OnDisk { location, buf })),
        }
    }

    pub fn to_id(&self) -> DatedId {
        self.id.clone()
    }

    pub fn is_persisted(&self) -> bool {
        match *self.inner.lock().unwrap() {
            InnerPage::Fresh { .. } => false,
            InnerPage::OnDisk { .. } => true,
        }
    }

    /// Return a lazy stream over this page's blocks. Multiple streams over
    /// the same page share one underlying file read.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            page: self.clone(),
            off: 0,
        }
    }

    /// Collect every block of this page.
    pub fn to_blocks(&self) -> Result<Vec<Block>> {
        self.blocks().collect()
    }

    /// On-disk footprint of this page, magic included.
    pub fn encoded_len(&self) -> Result<usize> {
        let mut n = PAGE_MARKER.len();
        for block in self.blocks() {
            n += block?.encoded_len();
        }
        Ok(n)
    }

    /// If this page was created in memory, encode and atomically write it
    /// at `location`, and mark it persisted. Return whether a write
    /// happened.
    pub fn persist_if_needed(&self, location: &ffi::OsStr) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let blocks = match &mut *inner {
            InnerPage::OnDisk { .. } => return Ok(false),
            InnerPage::Fresh { blocks } => std::mem::take(blocks),
        };

        let mut data = PAGE_MARKER.clone();
        for block in blocks.iter() {
            block.encode(&mut data);
        }
        util::atomic_write(location, &data)?;

        *inner = InnerPage::OnDisk {
            location: location.to_os_string(),
            buf: BlockBuf {
                blocks,
                file: None,
                started: true,
                done: true,
            },
        };
        Ok(true)
    }

    pub fn downgrade(&self) -> WeakPage {
        WeakPage {
            id: self.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    // fetch block at `off`, reading and memoizing from disk as required.
    fn fetch(&self, off: usize) -> Result<Option<Block>> {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            InnerPage::Fresh { blocks } => Ok(blocks.get(off).cloned()),
            InnerPage::OnDisk { location, buf } => {
                while buf.blocks.len() <= off && !buf.done {
                    if !buf.started {
                        let fd = err_at!(
                            IOError,
                            fs::File::open(&*location),
                            "page {:?}",
                            location
                        )?;
                        let mut file = io::BufReader::new(fd);
                        let mut magic = vec![0_u8; PAGE_MARKER.len()];
                        match io::Read::read_exact(&mut file, &mut magic) {
                            Ok(_) if magic == *PAGE_MARKER => (),
                            Ok(_) => {
                                err_at!(InvalidPageFormat, msg: "magic {:?}", location)?
                            }
                            Err(err) => err_at!(IOError, Err(err))?,
                        }
                        buf.file = Some(file);
                        buf.started = true;
                    }
                    let file = buf.file.as_mut().unwrap();
                    match Block::decode_from(file)? {
                        Some(block) => buf.blocks.push(block),
                        None => {
                            buf.done = true;
                            buf.file = None; // close the handle at eof
                        }
                    }
                }
                Ok(buf.blocks.get(off).cloned())
            }
        }
    }
}

/// Weak handle on a [Page], held by tracked maps so that inactive pages
/// can be dropped while recently used ones survive via the caches.
#[derive(Clone)]
pub struct WeakPage {
    id: DatedId,
    inner: Weak<Mutex<InnerPage>>,
}

impl WeakPage {
    pub fn to_id(&self) -> DatedId {
        self.id.clone()
    }

    pub fn upgrade(&self) -> Option<Page> {
        self.inner.upgrade().map(|inner| Page {
            id: self.id.clone(),
            inner,
        })
    }
}

/// Lazy iterator over one page's blocks, a cheap cursor into the shared
/// memoization buffer.
pub struct Blocks {
    page: Page,
    off: usize,
}

impl Iterator for Blocks {
    type Item = Result<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.page.fetch(self.off) {
            Ok(Some(block)) => {
                self.off += 1;
                Some(Ok(block))
            }
            Ok(None) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

/// Compose the location of a page file under its index directory, nested
/// into dated sub-directories.
pub fn to_page_location(index_dir: &ffi::OsStr, id: &DatedId) -> ffi::OsString {
    let [y, md, hm] = id.to_dated_dirs();
    let file_name: ffi::OsString = PageFileName::from(id.clone()).into();
    let mut loc = path::PathBuf::from(index_dir.to_os_string());
    loc.push("Pages");
    loc.push(y);
    loc.push(md);
    loc.push(hm);
    loc.push(file_name);
    loc.into_os_string()
}

impl From<PageFileName> for ffi::OsString {
    fn from(name: PageFileName) -> ffi::OsString {
        name.0
    }
}
