//! Entry codec.
//!
//! One logical record is encoded as a list of length-prefixed headers,
//! a blank separator line, and the content payload,
//!
//! ```text
//! {len-decimal} {header-bytes}\n
//! ...
//! \n
//! {content-bytes}
//! ```
//!
//! Which headers are present depends on the containing index,
//!
//! * primary index: `version`, `identifier`, content inline.
//! * direct secondary index: `version`, `index value`, `identifier`,
//!   content inline.
//! * reference secondary index: `index value`, `identifier`, content
//!   empty, the record body lives in the primary index.

use std::convert::TryFrom;

use crate::{page::block::MAX_SIZE_DIGITS, Error, Result};

/// One logical record, as stored inside one or more contiguous blocks.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Entry {
    headers: Vec<Vec<u8>>,
    content: Vec<u8>,
}

impl Entry {
    pub fn new(headers: Vec<Vec<u8>>, content: Vec<u8>) -> Entry {
        Entry { headers, content }
    }

    /// Entry layout for a primary index.
    pub fn new_primary(version: &[u8], identifier: &[u8], content: Vec<u8>) -> Entry {
        Entry {
            headers: vec![version.to_vec(), identifier.to_vec()],
            content,
        }
    }

    /// Entry layout for a direct secondary index, record body inline.
    pub fn new_direct(
        version: &[u8],
        value: &[u8],
        identifier: &[u8],
        content: Vec<u8>,
    ) -> Entry {
        Entry {
            headers: vec![version.to_vec(), value.to_vec(), identifier.to_vec()],
            content,
        }
    }

    /// Entry layout for a reference secondary index, no content, the
    /// record body is resolved via the primary index.
    pub fn new_reference(value: &[u8], identifier: &[u8]) -> Entry {
        Entry {
            headers: vec![value.to_vec(), identifier.to_vec()],
            content: vec![],
        }
    }

    pub fn len_headers(&self) -> usize {
        self.headers.len()
    }

    pub fn as_header(&self, i: usize) -> Result<&[u8]> {
        match self.headers.get(i) {
            Some(header) => Ok(header.as_slice()),
            None => err_at!(InvalidEntryFormat, msg: "missing header {}", i),
        }
    }

    pub fn as_content(&self) -> &[u8] {
        &self.content
    }

    pub fn into_content(self) -> Vec<u8> {
        self.content
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![];
        for header in self.headers.iter() {
            buf.extend_from_slice(header.len().to_string().as_bytes());
            buf.push(b' ');
            buf.extend_from_slice(header);
            buf.push(b'\n');
        }
        buf.push(b'\n');
        buf.extend_from_slice(&self.content);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Entry> {
        let mut headers = vec![];
        let mut off = 0;

        loop {
            match data.get(off) {
                Some(b'\n') => {
                    off += 1;
                    break;
                }
                Some(_) => (),
                None => return err_at!(InvalidEntryFormat, msg: "missing separator"),
            }

            let mut len: usize = 0;
            let mut n_digits = 0;
            loop {
                match data.get(off) {
                    Some(b' ') if n_digits > 0 => {
                        off += 1;
                        break;
                    }
                    Some(d) if d.is_ascii_digit() && n_digits < MAX_SIZE_DIGITS => {
                        len = len * 10 + usize::from(d - b'0');
                        n_digits += 1;
                        off += 1;
                    }
                    _ => return err_at!(InvalidEntryFormat, msg: "header length"),
                }
            }

            match data.get(off..off + len) {
                Some(header) => {
                    headers.push(header.to_vec());
                    off += len;
                }
                None => return err_at!(InvalidEntryFormat, msg: "header truncated"),
            }
            match data.get(off) {
                Some(b'\n') => off += 1,
                _ => return err_at!(InvalidEntryFormat, msg: "header not terminated"),
            }
        }

        let content = data[off..].to_vec();
        Ok(Entry { headers, content })
    }

    /// On disk footprint once encoded, header framing included.
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|h| h.len() + decimal_digits(h.len()) + 2)
            .sum();
        headers + 1 + self.content.len()
    }
}

impl TryFrom<&[u8]> for Entry {
    type Error = Error;

    fn try_from(data: &[u8]) -> Result<Entry> {
        Entry::decode(data)
    }
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
#[path = "entry_test.rs"]
mod entry_test;
