//! Block codec for page files.
//!
//! A page stores a sequence of framed block fragments. One logical entry
//! maps to either a single `complete` block, or to a `head` block followed
//! by zero or more `slice` blocks and a final `tail` block, when the entry
//! straddles page boundaries. Each block is framed as,
//!
//! ```text
//! {marker}{size-decimal}\n{payload}\n
//! ```
//!
//! with marker one of `=` (complete), `>` (head), `~` (slice), `<` (tail).

use std::io::{self, BufRead, Read};

use crate::{Error, Result};

/// Maximum number of decimal digits allowed in a block size field.
pub const MAX_SIZE_DIGITS: usize = 11;

// marker(1) + size(>= 1 digit) + newline + trailing newline
const MIN_FRAME: usize = 4;

/// One framed fragment of an entry within a page.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum Block {
    /// The entire entry fits in this block.
    Complete(Vec<u8>),
    /// Entry starts here and continues in the next block.
    Head(Vec<u8>),
    /// Entry continues and continues further.
    Slice(Vec<u8>),
    /// Final portion of a multi-block entry.
    Tail(Vec<u8>),
}

impl Block {
    pub fn to_marker(&self) -> u8 {
        match self {
            Block::Complete(_) => b'=',
            Block::Head(_) => b'>',
            Block::Slice(_) => b'~',
            Block::Tail(_) => b'<',
        }
    }

    pub fn as_payload(&self) -> &[u8] {
        match self {
            Block::Complete(payload) => payload,
            Block::Head(payload) => payload,
            Block::Slice(payload) => payload,
            Block::Tail(payload) => payload,
        }
    }

    fn from_marker(marker: u8, payload: Vec<u8>) -> Result<Block> {
        let block = match marker {
            b'=' => Block::Complete(payload),
            b'>' => Block::Head(payload),
            b'~' => Block::Slice(payload),
            b'<' => Block::Tail(payload),
            _ => err_at!(InvalidPageFormat, msg: "block marker {:?}", marker as char)?,
        };
        Ok(block)
    }

    /// Number of bytes this block occupies on disk, framing included.
    pub fn encoded_len(&self) -> usize {
        let n = self.as_payload().len();
        n + decimal_digits(n) + 3
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        let payload = self.as_payload();
        buf.push(self.to_marker());
        buf.extend_from_slice(payload.len().to_string().as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(payload);
        buf.push(b'\n');
    }

    /// Decode one block from the head of `buf`, return the block and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Block, usize)> {
        if buf.is_empty() {
            return err_at!(InvalidPageFormat, msg: "empty block");
        }
        let marker = buf[0];

        let mut off = 1;
        let mut size: usize = 0;
        let mut n_digits = 0;
        loop {
            match buf.get(off) {
                Some(b'\n') if n_digits > 0 => {
                    off += 1;
                    break;
                }
                Some(d) if d.is_ascii_digit() && n_digits < MAX_SIZE_DIGITS => {
                    size = size * 10 + usize::from(d - b'0');
                    n_digits += 1;
                    off += 1;
                }
                _ => return err_at!(InvalidPageFormat, msg: "block size field"),
            }
        }

        if buf.len() < off + size + 1 {
            return err_at!(InvalidPageFormat, msg: "block truncated {}", size);
        }
        let payload = buf[off..off + size].to_vec();
        if buf[off + size] != b'\n' {
            return err_at!(InvalidPageFormat, msg: "block not terminated");
        }

        Ok((Block::from_marker(marker, payload)?, off + size + 1))
    }

    /// Decode one block from reader `r`. Return None on a clean EOF, that
    /// is, EOF exactly at a block boundary.
    pub fn decode_from<R>(r: &mut R) -> Result<Option<Block>>
    where
        R: BufRead,
    {
        let marker = {
            let mut byt = [0_u8; 1];
            match r.read(&mut byt) {
                Ok(0) => return Ok(None),
                Ok(_) => byt[0],
                Err(err) => return err_at!(IOError, Err(err)),
            }
        };

        let mut size: usize = 0;
        let mut n_digits = 0;
        loop {
            let mut byt = [0_u8; 1];
            match err_at!(IOError, r.read(&mut byt))? {
                0 => return err_at!(InvalidPageFormat, msg: "eof in size field"),
                _ => match byt[0] {
                    b'\n' if n_digits > 0 => break,
                    d if d.is_ascii_digit() && n_digits < MAX_SIZE_DIGITS => {
                        size = size * 10 + usize::from(d - b'0');
                        n_digits += 1;
                    }
                    _ => return err_at!(InvalidPageFormat, msg: "block size field"),
                },
            }
        }

        let mut payload = vec![0; size];
        match r.read_exact(&mut payload) {
            Ok(_) => (),
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return err_at!(InvalidPageFormat, msg: "block truncated {}", size)
            }
            Err(err) => return err_at!(IOError, Err(err)),
        }

        let mut nl = [0_u8; 1];
        match r.read(&mut nl) {
            Ok(1) if nl[0] == b'\n' => (),
            Ok(_) => return err_at!(InvalidPageFormat, msg: "block not terminated"),
            Err(err) => return err_at!(IOError, Err(err)),
        }

        Ok(Some(Block::from_marker(marker, payload)?))
    }
}

/// Payload bytes that fit in `space` bytes of page, after accounting for
/// block framing and the size-digits, iterated until the digit count is
/// consistent with the payload it frames. Zero when `space` cannot hold a
/// frame at all.
pub fn usable_space(space: usize) -> usize {
    if space <= MIN_FRAME {
        return 0;
    }
    let mut usable = space - MIN_FRAME;
    loop {
        let next = space.saturating_sub(3 + decimal_digits(usable));
        // at a digit-count boundary the estimate oscillates by one, the
        // smaller value is the one whose frame fits.
        if next >= usable {
            break usable;
        }
        usable = next;
    }
}

/// Split `entry` bytes into blocks, `remaining` is the free space left in
/// the target page and `max` is the usable space of an empty page. The
/// first block lands in the target page, every subsequent block lands in a
/// fresh page of its own.
pub fn pack(entry: &[u8], remaining: usize, max: usize) -> Result<Vec<Block>> {
    if max <= MIN_FRAME {
        return err_at!(InvalidInput, msg: "max page space {}", max);
    }
    let u_max = usable_space(max);

    // a page with <= 4 bytes left cannot hold even an empty frame, the
    // entry starts on the next page instead.
    let head_cap = match remaining {
        r if r <= MIN_FRAME => u_max,
        r => usable_space(r),
    };

    if entry.len() <= head_cap {
        return Ok(vec![Block::Complete(entry.to_vec())]);
    }

    let mut blocks = vec![Block::Head(entry[..head_cap].to_vec())];
    let mut off = head_cap;
    while entry.len() - off > u_max {
        blocks.push(Block::Slice(entry[off..off + u_max].to_vec()));
        off += u_max;
    }
    blocks.push(Block::Tail(entry[off..].to_vec()));

    Ok(blocks)
}

/// Reassemble the entry bytes from its blocks, the inverse of [pack].
/// Valid shapes are a single `complete` block, or `head [slice ...] tail`.
pub fn unpack(blocks: &[Block]) -> Result<Vec<u8>> {
    match blocks {
        [Block::Complete(payload)] => Ok(payload.clone()),
        [Block::Head(head), mid @ .., Block::Tail(tail)] => {
            let mut entry = head.clone();
            for block in mid {
                match block {
                    Block::Slice(payload) => entry.extend_from_slice(payload),
                    _ => return err_at!(InvalidPageFormat, msg: "expected slice"),
                }
            }
            entry.extend_from_slice(tail);
            Ok(entry)
        }
        _ => err_at!(InvalidPageFormat, msg: "bad block sequence {}", blocks.len()),
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
#[path = "block_test.rs"]
mod block_test;
