//! Chunk framing shared by every binary XML record

use crate::exceptions::{PatchError, Result};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

pub const CHUNK_HEADER_SIZE: usize = 8;

/// `ResChunk_header`: type, header size, total size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub header_size: u16,
    pub size: u32,
}

impl ChunkHeader {
    /// Read and bounds-check the header at `offset`
    pub fn read(buf: &[u8], offset: usize) -> Result<Self> {
        let raw = buf.get(offset..offset + CHUNK_HEADER_SIZE).ok_or_else(|| {
            PatchError::MalformedManifest(format!("truncated chunk header at {offset:#x}"))
        })?;
        let header = ChunkHeader {
            chunk_type: LittleEndian::read_u16(&raw[0..2]),
            header_size: LittleEndian::read_u16(&raw[2..4]),
            size: LittleEndian::read_u32(&raw[4..8]),
        };
        if (header.header_size as usize) < CHUNK_HEADER_SIZE
            || header.size < header.header_size as u32
            || offset + header.size as usize > buf.len()
        {
            return Err(PatchError::MalformedManifest(format!(
                "chunk {:#06x} at {offset:#x} has inconsistent sizes (header {}, total {})",
                header.chunk_type, header.header_size, header.size
            )));
        }
        Ok(header)
    }

    pub fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<LittleEndian>(self.chunk_type)?;
        out.write_u16::<LittleEndian>(self.header_size)?;
        out.write_u32::<LittleEndian>(self.size)?;
        Ok(())
    }
}

/// Pad with zeros to a 4-byte boundary
pub fn pad4(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

/// Rewrite the size field of a chunk whose header starts at `start`
pub fn patch_size(buf: &mut [u8], start: usize) {
    let size = (buf.len() - start) as u32;
    LittleEndian::write_u32(&mut buf[start + 4..start + 8], size);
}
