//! APK Signing Block container
//!
//! ```text
//! u64 size | (u64 len, u32 id, value)* | u64 size | "APK Sig Block 42"
//! ```
//!
//! The block sits between the last entry and the central directory.

use crate::apk::constants::{APK_SIGNING_BLOCK_MAGIC, VERITY_PADDING_BLOCK_ID};
use crate::apk::defaults::SIGNING_BLOCK_ALIGNMENT;
use crate::exceptions::{PatchError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

const FOOTER_SIZE: usize = 8 + 16;
const MIN_PAIR_SIZE: usize = 8 + 4;

fn corrupt(msg: impl Into<String>) -> PatchError {
    PatchError::CorruptArchive(format!("APK signing block: {}", msg.into()))
}

/// Encode id/value pairs, padding the whole block to a multiple of 4096
pub fn encode(pairs: &[(u32, Vec<u8>)]) -> Result<Vec<u8>> {
    let pairs_size: usize = pairs.iter().map(|(_, v)| MIN_PAIR_SIZE + v.len()).sum();
    let mut total = 8 + pairs_size + FOOTER_SIZE;
    let mut padding = 0;
    if total % SIGNING_BLOCK_ALIGNMENT != 0 {
        padding = SIGNING_BLOCK_ALIGNMENT - total % SIGNING_BLOCK_ALIGNMENT;
        if padding < MIN_PAIR_SIZE {
            padding += SIGNING_BLOCK_ALIGNMENT;
        }
        total += padding;
    }

    let size_field = (total - 8) as u64;
    let mut out = Vec::with_capacity(total);
    out.write_u64::<LittleEndian>(size_field)?;
    for (id, value) in pairs {
        out.write_u64::<LittleEndian>(4 + value.len() as u64)?;
        out.write_u32::<LittleEndian>(*id)?;
        out.extend_from_slice(value);
    }
    if padding > 0 {
        out.write_u64::<LittleEndian>((padding - 8) as u64)?;
        out.write_u32::<LittleEndian>(VERITY_PADDING_BLOCK_ID)?;
        out.resize(out.len() + padding - MIN_PAIR_SIZE, 0);
    }
    out.write_u64::<LittleEndian>(size_field)?;
    out.extend_from_slice(APK_SIGNING_BLOCK_MAGIC);
    Ok(out)
}

/// Signing block found in an existing archive
#[derive(Debug, Clone)]
pub struct LocatedBlock {
    /// Offset of the block's first byte
    pub offset: usize,
    pub pairs: Vec<(u32, Vec<u8>)>,
}

impl LocatedBlock {
    pub fn get(&self, id: u32) -> Option<&[u8]> {
        self.pairs
            .iter()
            .find(|(pair_id, _)| *pair_id == id)
            .map(|(_, v)| v.as_slice())
    }
}

/// Find the block ending at `cd_offset`, if any
pub fn locate(apk: &[u8], cd_offset: usize) -> Result<Option<LocatedBlock>> {
    if cd_offset < 8 + FOOTER_SIZE || cd_offset > apk.len() {
        return Ok(None);
    }
    let footer = &apk[cd_offset - FOOTER_SIZE..cd_offset];
    if &footer[8..] != APK_SIGNING_BLOCK_MAGIC {
        return Ok(None);
    }
    let size = LittleEndian::read_u64(&footer[..8]) as usize;
    let total = size
        .checked_add(8)
        .filter(|t| *t <= cd_offset && size >= FOOTER_SIZE)
        .ok_or_else(|| corrupt(format!("size {size} out of range")))?;
    let offset = cd_offset - total;
    if LittleEndian::read_u64(&apk[offset..offset + 8]) as usize != size {
        return Err(corrupt("header and footer sizes differ"));
    }

    let mut pairs = Vec::new();
    let mut rest = &apk[offset + 8..cd_offset - FOOTER_SIZE];
    while !rest.is_empty() {
        if rest.len() < MIN_PAIR_SIZE {
            return Err(corrupt("truncated id-value pair"));
        }
        let len = LittleEndian::read_u64(&rest[..8]) as usize;
        if len < 4 || len > rest.len() - 8 {
            return Err(corrupt(format!("pair length {len} out of range")));
        }
        let id = LittleEndian::read_u32(&rest[8..12]);
        pairs.push((id, rest[12..8 + len].to_vec()));
        rest = &rest[8 + len..];
    }
    Ok(Some(LocatedBlock { offset, pairs }))
}

// Length-prefixed encoding used throughout v2/v3 blocks

/// Append `data` with a u32 length prefix
pub fn put_lp(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
}

/// Concatenation of length-prefixed items
pub fn lp_sequence<I, T>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for item in items {
        put_lp(&mut out, item.as_ref());
    }
    out
}

/// Cursor over length-prefixed data
#[derive(Debug, Clone, Copy)]
pub struct LpReader<'a> {
    buf: &'a [u8],
}

impl<'a> LpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        LpReader { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if self.buf.len() < 4 {
            return Err(corrupt("truncated u32"));
        }
        let value = LittleEndian::read_u32(&self.buf[..4]);
        self.buf = &self.buf[4..];
        Ok(value)
    }

    pub fn read_lp(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if self.buf.len() < len {
            return Err(corrupt(format!("length prefix {len} past end")));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Every remaining length-prefixed item
    pub fn read_all(mut self) -> Result<Vec<&'a [u8]>> {
        let mut items = Vec::new();
        while !self.is_empty() {
            items.push(self.read_lp()?);
        }
        Ok(items)
    }
}
