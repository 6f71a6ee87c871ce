//! Index manifest, the ordered page list of one index at one iteration.
//!
//! Serialized as text, the magic `INDEX\n` followed by one line per page,
//!
//! ```text
//! INDEX\n
//!  {page-id}\n        inherited from the previous iteration
//! +{page-id}\n        introduced by the iteration writing this manifest
//! -{page-id}\n        demoted by it, kept on disk for earlier readers
//! ```

use lazy_static::lazy_static;

use std::{
    convert::TryFrom,
    ffi, fmt, path, result,
    str::{from_utf8, FromStr},
};

use crate::{dated::DatedId, Error, Result};

lazy_static! {
    pub static ref INDEX_MARKER: Vec<u8> = "INDEX\n".as_bytes().to_vec();
}

/// A manifest file is named by its dated identifier,
/// `format!("{}.indexmanifest", id)`.
#[derive(Clone)]
pub struct ManifestFileName(pub ffi::OsString);

impl From<DatedId> for ManifestFileName {
    fn from(id: DatedId) -> ManifestFileName {
        let file_name = format!("{}.indexmanifest", id);
        ManifestFileName(AsRef::<ffi::OsStr>::as_ref(&file_name).to_os_string())
    }
}

impl From<ManifestFileName> for ffi::OsString {
    fn from(name: ManifestFileName) -> ffi::OsString {
        name.0
    }
}

impl TryFrom<ManifestFileName> for DatedId {
    type Error = Error;

    fn try_from(fname: ManifestFileName) -> Result<DatedId> {
        let fname = match fname.0.to_str() {
            Some(fname) => fname,
            None => return err_at!(InvalidFile, msg: "{:?}", fname.0),
        };
        match fname.strip_suffix(".indexmanifest") {
            Some(stem) => DatedId::from_str(stem),
            None => err_at!(InvalidFile, msg: "{:?}", fname),
        }
    }
}

impl fmt::Display for ManifestFileName {
    fn fmt(&self, f: &mut fmt::Formatter) -> result::Result<(), fmt::Error> {
        match self.0.to_str() {
            Some(s) => write!(f, "{}", s),
            None => write!(f, "{:?}", self.0),
        }
    }
}

/// One page reference within a manifest.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum PageInfo {
    Existing(DatedId),
    Added(DatedId),
    Removed(DatedId),
}

impl PageInfo {
    pub fn to_page_id(&self) -> DatedId {
        match self {
            PageInfo::Existing(id) => id.clone(),
            PageInfo::Added(id) => id.clone(),
            PageInfo::Removed(id) => id.clone(),
        }
    }

    pub fn is_removed(&self) -> bool {
        matches!(self, PageInfo::Removed(_))
    }

    fn to_marker(&self) -> u8 {
        match self {
            PageInfo::Existing(_) => b' ',
            PageInfo::Added(_) => b'+',
            PageInfo::Removed(_) => b'-',
        }
    }
}

/// Immutable snapshot of one index's page list.
#[derive(Clone, Debug)]
pub struct IndexManifest {
    id: DatedId,
    infos: Vec<PageInfo>,
}

impl IndexManifest {
    pub fn new_empty(id: DatedId) -> IndexManifest {
        IndexManifest { id, infos: vec![] }
    }

    pub fn new(id: DatedId, infos: Vec<PageInfo>) -> IndexManifest {
        IndexManifest { id, infos }
    }

    pub fn to_id(&self) -> DatedId {
        self.id.clone()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = INDEX_MARKER.clone();
        for info in self.infos.iter() {
            data.push(info.to_marker());
            data.extend_from_slice(info.to_page_id().to_string().as_bytes());
            data.push(b'\n');
        }
        data
    }

    pub fn decode(id: DatedId, data: &[u8]) -> Result<IndexManifest> {
        let body = match data.get(..INDEX_MARKER.len()) {
            Some(magic) if magic == INDEX_MARKER.as_slice() => {
                &data[INDEX_MARKER.len()..]
            }
            _ => return err_at!(InvalidIndexManifestFormat, msg: "magic"),
        };

        let mut infos = vec![];
        for line in body.split(|byt| *byt == b'\n') {
            if line.is_empty() {
                continue; // the final newline
            }
            let page_id = {
                let raw = err_at!(
                    InvalidIndexManifestFormat,
                    from_utf8(&line[1..]),
                    "page-id"
                )?;
                match DatedId::from_str(raw) {
                    Ok(page_id) => page_id,
                    Err(_) => {
                        return err_at!(InvalidIndexManifestFormat, msg: "page-id {}", raw)
                    }
                }
            };
            let info = match line[0] {
                b' ' => PageInfo::Existing(page_id),
                b'+' => PageInfo::Added(page_id),
                b'-' => PageInfo::Removed(page_id),
                m => {
                    return err_at!(
                        InvalidIndexManifestFormat, msg: "marker {:?}", m as char
                    )
                }
            };
            infos.push(info);
        }

        Ok(IndexManifest { id, infos })
    }

    /// Live page ids, in index order.
    pub fn ordered_page_ids(&self) -> impl Iterator<Item = DatedId> + '_ {
        self.infos
            .iter()
            .filter(|info| !info.is_removed())
            .map(PageInfo::to_page_id)
    }

    pub fn added_page_ids(&self) -> impl Iterator<Item = DatedId> + '_ {
        self.infos.iter().filter_map(|info| match info {
            PageInfo::Added(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn removed_page_ids(&self) -> impl Iterator<Item = DatedId> + '_ {
        self.infos.iter().filter_map(|info| match info {
            PageInfo::Removed(id) => Some(id.clone()),
            _ => None,
        })
    }

    pub fn len_pages(&self) -> usize {
        self.infos.iter().filter(|info| !info.is_removed()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len_pages() == 0
    }

    /// Baseline for the next iteration: adds become existing, removed
    /// entries are dropped, and the manifest gets a fresh identity.
    pub fn carried_forward(&self, new_id: DatedId) -> IndexManifest {
        let infos = self
            .infos
            .iter()
            .filter(|info| !info.is_removed())
            .map(|info| PageInfo::Existing(info.to_page_id()))
            .collect();
        IndexManifest { id: new_id, infos }
    }

    /// Insert a freshly added page at position `live_pos` among the live
    /// pages.
    pub fn insert_page(&mut self, live_pos: usize, page_id: DatedId) {
        let at = self.live_offset(live_pos);
        self.infos.insert(at, PageInfo::Added(page_id));
    }

    /// Swap the live page `old` for `new_pages`, in place. A page that was
    /// itself added within this iteration never reached disk as part of a
    /// committed manifest, so it collapses out of the list instead of
    /// lingering as removed.
    pub fn replace_page(&mut self, old: &DatedId, new_pages: &[DatedId]) -> Result<()> {
        let at = self.position_of(old)?;
        let info = self.infos.remove(at);
        let mut new_infos: Vec<PageInfo> = new_pages
            .iter()
            .map(|id| PageInfo::Added(id.clone()))
            .collect();
        if let PageInfo::Existing(id) = info {
            new_infos.push(PageInfo::Removed(id));
        }
        for (n, new_info) in new_infos.into_iter().enumerate() {
            self.infos.insert(at + n, new_info);
        }
        Ok(())
    }

    /// Demote the live page `old` without a replacement.
    pub fn remove_page(&mut self, old: &DatedId) -> Result<()> {
        let at = self.position_of(old)?;
        match &self.infos[at] {
            PageInfo::Added(_) => {
                self.infos.remove(at);
            }
            PageInfo::Existing(id) => self.infos[at] = PageInfo::Removed(id.clone()),
            PageInfo::Removed(_) => unreachable!(),
        }
        Ok(())
    }

    /// Demote every live page, leaving an empty index.
    pub fn reset(&mut self) {
        let mut infos = vec![];
        for info in self.infos.drain(..) {
            match info {
                PageInfo::Existing(id) => infos.push(PageInfo::Removed(id)),
                PageInfo::Added(_) => (),
                PageInfo::Removed(id) => infos.push(PageInfo::Removed(id)),
            }
        }
        self.infos = infos;
    }

    // offset into `infos` of the live page at `live_pos`; one past the
    // end when live_pos == live count.
    fn live_offset(&self, live_pos: usize) -> usize {
        let mut live = 0;
        for (off, info) in self.infos.iter().enumerate() {
            if live == live_pos && !info.is_removed() {
                return off;
            }
            if !info.is_removed() {
                live += 1;
            }
        }
        self.infos.len()
    }

    fn position_of(&self, page_id: &DatedId) -> Result<usize> {
        for (off, info) in self.infos.iter().enumerate() {
            if !info.is_removed() && &info.to_page_id() == page_id {
                return Ok(off);
            }
        }
        err_at!(Fatal, msg: "page {} not live in manifest {}", page_id, self.id)
    }
}

/// Compose the location of a manifest file under its index directory.
pub fn to_manifest_location(index_dir: &ffi::OsStr, id: &DatedId) -> ffi::OsString {
    let file_name: ffi::OsString = ManifestFileName::from(id.clone()).into();
    let mut loc = path::PathBuf::from(index_dir.to_os_string());
    loc.push("Manifest");
    loc.push(file_name);
    loc.into_os_string()
}

#[cfg(test)]
#[path = "manifest_test.rs"]
mod manifest_test;
