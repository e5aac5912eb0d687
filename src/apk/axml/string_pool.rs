//! Binary XML string pool
//!
//! An unmodified pool is written back from its original bytes. Once a string
//! is added or changed the pool is re-encoded in the dialect (UTF-8 or
//! UTF-16) it was read in.

use super::chunks::{ChunkHeader, pad4};
use crate::apk::constants::{RES_STRING_POOL_TYPE, STRING_POOL_SORTED_FLAG, STRING_POOL_UTF8_FLAG};
use crate::exceptions::{PatchError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

const POOL_HEADER_SIZE: u16 = 28;

fn malformed(msg: impl Into<String>) -> PatchError {
    PatchError::MalformedManifest(msg.into())
}

#[derive(Debug, Clone)]
pub struct StringPool {
    strings: Vec<String>,
    flags: u32,
    style_offsets: Vec<u32>,
    style_data: Vec<u8>,
    header_size: u16,
    original: Option<Vec<u8>>,
}

impl StringPool {
    /// Parse the pool chunk starting at `buf[0]`
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = ChunkHeader::read(buf, 0)?;
        if header.chunk_type != RES_STRING_POOL_TYPE {
            return Err(malformed(format!(
                "expected string pool, found chunk {:#06x}",
                header.chunk_type
            )));
        }
        if (header.header_size as usize) < POOL_HEADER_SIZE as usize {
            return Err(malformed("string pool header too small"));
        }
        let chunk = &buf[..header.size as usize];
        let string_count = LittleEndian::read_u32(&chunk[8..12]) as usize;
        let style_count = LittleEndian::read_u32(&chunk[12..16]) as usize;
        let flags = LittleEndian::read_u32(&chunk[16..20]);
        let strings_start = LittleEndian::read_u32(&chunk[20..24]) as usize;
        let styles_start = LittleEndian::read_u32(&chunk[24..28]) as usize;

        let offsets_at = header.header_size as usize;
        let offsets_end = offsets_at + 4 * (string_count + style_count);
        if offsets_end > chunk.len() || (string_count > 0 && strings_start > chunk.len()) {
            return Err(malformed("string pool offsets out of bounds"));
        }

        let utf8 = flags & STRING_POOL_UTF8_FLAG != 0;
        let data_end = if style_count > 0 && styles_start > 0 {
            styles_start
        } else {
            chunk.len()
        };
        if data_end > chunk.len() || (string_count > 0 && strings_start > data_end) {
            return Err(malformed("string data out of bounds"));
        }

        let mut strings = Vec::with_capacity(string_count);
        for i in 0..string_count {
            let rel = LittleEndian::read_u32(&chunk[offsets_at + 4 * i..]) as usize;
            let at = strings_start + rel;
            if at >= data_end {
                return Err(malformed(format!("string {i} offset out of bounds")));
            }
            let s = if utf8 {
                decode_utf8(&chunk[at..data_end])
            } else {
                decode_utf16(&chunk[at..data_end])
            }
            .ok_or_else(|| malformed(format!("string {i} is not terminated")))?;
            strings.push(s);
        }

        let style_offsets = (0..style_count)
            .map(|i| LittleEndian::read_u32(&chunk[offsets_at + 4 * (string_count + i)..]))
            .collect();
        let style_data = if style_count > 0 {
            chunk
                .get(styles_start..)
                .ok_or_else(|| malformed("style data out of bounds"))?
                .to_vec()
        } else {
            Vec::new()
        };

        Ok(StringPool {
            strings,
            flags,
            style_offsets,
            style_data,
            header_size: header.header_size,
            original: Some(chunk.to_vec()),
        })
    }

    /// Empty UTF-16 pool
    pub fn new() -> Self {
        StringPool {
            strings: Vec::new(),
            flags: 0,
            style_offsets: Vec::new(),
            style_data: Vec::new(),
            header_size: POOL_HEADER_SIZE,
            original: None,
        }
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn is_utf8(&self) -> bool {
        self.flags & STRING_POOL_UTF8_FLAG != 0
    }

    pub fn style_count(&self) -> usize {
        self.style_offsets.len()
    }

    pub fn is_modified(&self) -> bool {
        self.original.is_none()
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    /// First index holding exactly `value`, at or after `from`
    pub fn find_from(&self, value: &str, from: usize) -> Option<u32> {
        self.strings
            .iter()
            .skip(from)
            .position(|s| s == value)
            .map(|i| (i + from) as u32)
    }

    /// Append a string, returning its index
    pub fn push(&mut self, value: &str) -> u32 {
        self.touch();
        self.strings.push(value.to_string());
        (self.strings.len() - 1) as u32
    }

    /// Insert a string at `index`; later indices shift by one
    pub fn insert(&mut self, index: usize, value: &str) -> Result<()> {
        if index < self.style_count() {
            return Err(malformed("cannot insert into the styled string range"));
        }
        self.touch();
        self.strings.insert(index, value.to_string());
        Ok(())
    }

    /// Overwrite a string in place
    pub fn replace(&mut self, index: u32, value: &str) -> Result<()> {
        let slot = self
            .strings
            .get_mut(index as usize)
            .ok_or_else(|| malformed(format!("dangling string index {index}")))?;
        if slot != value {
            *slot = value.to_string();
            self.touch();
        }
        Ok(())
    }

    fn touch(&mut self) {
        if self.original.take().is_some() {
            // Insertions break lexical order
            self.flags &= !STRING_POOL_SORTED_FLAG;
        }
    }

    /// Encode the pool chunk
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if let Some(original) = &self.original {
            return Ok(original.clone());
        }

        let utf8 = self.is_utf8();
        let mut offsets = Vec::with_capacity(self.strings.len());
        let mut data = Vec::new();
        for s in &self.strings {
            offsets.push(data.len() as u32);
            if utf8 {
                encode_utf8(s, &mut data)?;
            } else {
                encode_utf16(s, &mut data)?;
            }
        }
        pad4(&mut data);

        let header_size = self.header_size as usize;
        let offsets_len = 4 * (self.strings.len() + self.style_offsets.len());
        let strings_start = if self.strings.is_empty() {
            0
        } else {
            header_size + offsets_len
        };
        let styles_start = if self.style_offsets.is_empty() {
            0
        } else {
            header_size + offsets_len + data.len()
        };
        let size = header_size + offsets_len + data.len() + self.style_data.len();

        let mut out = Vec::with_capacity(size);
        ChunkHeader {
            chunk_type: RES_STRING_POOL_TYPE,
            header_size: self.header_size,
            size: size as u32,
        }
        .write(&mut out)?;
        out.write_u32::<LittleEndian>(self.strings.len() as u32)?;
        out.write_u32::<LittleEndian>(self.style_offsets.len() as u32)?;
        out.write_u32::<LittleEndian>(self.flags)?;
        out.write_u32::<LittleEndian>(strings_start as u32)?;
        out.write_u32::<LittleEndian>(styles_start as u32)?;
        out.resize(header_size, 0);
        for offset in offsets.iter().chain(&self.style_offsets) {
            out.write_u32::<LittleEndian>(*offset)?;
        }
        out.extend_from_slice(&data);
        out.extend_from_slice(&self.style_data);
        Ok(out)
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_utf16(buf: &[u8]) -> Option<String> {
    let read = |at: usize| buf.get(at..at + 2).map(LittleEndian::read_u16);
    let first = read(0)?;
    let (len, mut pos) = if first & 0x8000 != 0 {
        let second = read(2)?;
        ((((first & 0x7fff) as usize) << 16) | second as usize, 4)
    } else {
        (first as usize, 2)
    };
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(read(pos)?);
        pos += 2;
    }
    if read(pos)? != 0 {
        return None;
    }
    Some(String::from_utf16_lossy(&units))
}

fn decode_utf8(buf: &[u8]) -> Option<String> {
    let read_len = |at: usize| -> Option<(usize, usize)> {
        let b0 = *buf.get(at)? as usize;
        if b0 & 0x80 != 0 {
            let b1 = *buf.get(at + 1)? as usize;
            Some((((b0 & 0x7f) << 8) | b1, 2))
        } else {
            Some((b0, 1))
        }
    };
    let (_, n1) = read_len(0)?;
    let (byte_len, n2) = read_len(n1)?;
    let start = n1 + n2;
    let bytes = buf.get(start..start + byte_len)?;
    if *buf.get(start + byte_len)? != 0 {
        return None;
    }
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn encode_utf16(s: &str, out: &mut Vec<u8>) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len();
    if len > 0x7fff_ffff {
        return Err(malformed("string too long"));
    }
    if len > 0x7fff {
        out.write_u16::<LittleEndian>(0x8000 | (len >> 16) as u16)?;
        out.write_u16::<LittleEndian>((len & 0xffff) as u16)?;
    } else {
        out.write_u16::<LittleEndian>(len as u16)?;
    }
    for unit in units {
        out.write_u16::<LittleEndian>(unit)?;
    }
    out.write_u16::<LittleEndian>(0)?;
    Ok(())
}

fn encode_utf8(s: &str, out: &mut Vec<u8>) -> Result<()> {
    let write_len = |len: usize, out: &mut Vec<u8>| -> Result<()> {
        if len > 0x7fff {
            return Err(malformed("string too long for UTF-8 pool"));
        }
        if len > 0x7f {
            out.push(0x80 | (len >> 8) as u8);
            out.push((len & 0xff) as u8);
        } else {
            out.push(len as u8);
        }
        Ok(())
    };
    write_len(s.encode_utf16().count(), out)?;
    write_len(s.len(), out)?;
    out.extend_from_slice(s.as_bytes());
    out.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(utf8: bool, strings: &[&str]) -> StringPool {
        let mut pool = StringPool::new();
        if utf8 {
            pool.flags |= STRING_POOL_UTF8_FLAG;
        }
        for s in strings {
            pool.push(s);
        }
        pool
    }

    #[test]
    fn test_reencode_and_parse_utf16() {
        let pool = pool_with(false, &["name", "manifest", "日本語", ""]);
        let bytes = pool.to_bytes().unwrap();
        assert_eq!(bytes.len() % 4, 0);
        let parsed = StringPool::parse(&bytes).unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.get(2), Some("日本語"));
        assert_eq!(parsed.get(3), Some(""));
        // Parsed pool re-emits its exact bytes
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn test_reencode_and_parse_utf8_long_string() {
        let long = "x".repeat(300);
        let pool = pool_with(true, &["a", &long]);
        let parsed = StringPool::parse(&pool.to_bytes().unwrap()).unwrap();
        assert!(parsed.is_utf8());
        assert_eq!(parsed.get(1), Some(long.as_str()));
    }

    #[test]
    fn test_insert_shifts_indices_and_clears_sorted() {
        let mut pool = pool_with(false, &["a", "c"]);
        pool.flags |= STRING_POOL_SORTED_FLAG;
        let parsed_bytes = pool.to_bytes().unwrap();
        let mut pool = StringPool::parse(&parsed_bytes).unwrap();
        pool.insert(1, "b").unwrap();
        assert_eq!(pool.get(1), Some("b"));
        assert_eq!(pool.get(2), Some("c"));
        assert!(pool.is_modified());
        assert_eq!(pool.flags & STRING_POOL_SORTED_FLAG, 0);
    }

    #[test]
    fn test_find_from() {
        let pool = pool_with(false, &["x", "y", "x"]);
        assert_eq!(pool.find_from("x", 0), Some(0));
        assert_eq!(pool.find_from("x", 1), Some(2));
        assert_eq!(pool.find_from("z", 0), None);
    }
}
