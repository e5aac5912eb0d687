//! Fixed-layout zip records: local file header, central directory header and
//! end of central directory

use super::super::constants::{
    ALIGNMENT_EXTRA_ID, CENTRAL_DIRECTORY_HEADER_SIZE, CENTRAL_DIRECTORY_SIG,
    END_OF_CENTRAL_DIRECTORY_SIG, END_OF_CENTRAL_DIRECTORY_SIZE, LOCAL_FILE_HEADER_SIG,
    LOCAL_FILE_HEADER_SIZE, MAX_ZIP_COMMENT_SIZE,
};
use crate::exceptions::{PatchError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

fn corrupt(what: &str, offset: usize) -> PatchError {
    PatchError::CorruptArchive(format!("truncated {what} at offset {offset:#x}"))
}

fn read_bytes(cursor: &mut Cursor<&[u8]>, len: usize, what: &str, offset: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| corrupt(what, offset))?;
    Ok(buf)
}

fn decode_name(raw: Vec<u8>, offset: usize) -> Result<String> {
    String::from_utf8(raw).map_err(|_| {
        PatchError::CorruptArchive(format!("entry name at {offset:#x} is not valid UTF-8"))
    })
}

/// Local file header preceding each entry's data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFileHeader {
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: String,
    pub extra: Vec<u8>,
}

impl LocalFileHeader {
    /// Parse the header at `offset`, returning it and its encoded length
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tail = buf.get(offset..).ok_or_else(|| corrupt("local header", offset))?;
        let mut c = Cursor::new(tail);
        let err = |_| corrupt("local header", offset);

        if c.read_u32::<LittleEndian>().map_err(err)? != LOCAL_FILE_HEADER_SIG {
            return Err(PatchError::CorruptArchive(format!(
                "bad local header signature at {offset:#x}"
            )));
        }
        let version_needed = c.read_u16::<LittleEndian>().map_err(err)?;
        let flags = c.read_u16::<LittleEndian>().map_err(err)?;
        let method = c.read_u16::<LittleEndian>().map_err(err)?;
        let mod_time = c.read_u16::<LittleEndian>().map_err(err)?;
        let mod_date = c.read_u16::<LittleEndian>().map_err(err)?;
        let crc32 = c.read_u32::<LittleEndian>().map_err(err)?;
        let compressed_size = c.read_u32::<LittleEndian>().map_err(err)?;
        let uncompressed_size = c.read_u32::<LittleEndian>().map_err(err)?;
        let name_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let extra_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let name = decode_name(read_bytes(&mut c, name_len, "local header", offset)?, offset)?;
        let extra = read_bytes(&mut c, extra_len, "local header", offset)?;

        Ok((
            LocalFileHeader {
                version_needed,
                flags,
                method,
                mod_time,
                mod_date,
                crc32,
                compressed_size,
                uncompressed_size,
                name,
                extra,
            },
            LOCAL_FILE_HEADER_SIZE + name_len + extra_len,
        ))
    }

    pub fn encoded_len(&self) -> usize {
        LOCAL_FILE_HEADER_SIZE + self.name.len() + self.extra.len()
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<LittleEndian>(LOCAL_FILE_HEADER_SIG)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.method)?;
        out.write_u16::<LittleEndian>(self.mod_time)?;
        out.write_u16::<LittleEndian>(self.mod_date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(self.compressed_size)?;
        out.write_u32::<LittleEndian>(self.uncompressed_size)?;
        out.write_u16::<LittleEndian>(u16_len(self.name.len(), "entry name")?)?;
        out.write_u16::<LittleEndian>(u16_len(self.extra.len(), "extra field")?)?;
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.extra);
        Ok(())
    }
}

/// Central directory file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CentralDirectoryHeader {
    pub version_made_by: u16,
    pub version_needed: u16,
    pub flags: u16,
    pub method: u16,
    pub mod_time: u16,
    pub mod_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_start: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_header_offset: u32,
    pub name: String,
    pub extra: Vec<u8>,
    pub comment: Vec<u8>,
}

impl CentralDirectoryHeader {
    pub fn parse(buf: &[u8], offset: usize) -> Result<(Self, usize)> {
        let tail = buf
            .get(offset..)
            .ok_or_else(|| corrupt("central directory", offset))?;
        let mut c = Cursor::new(tail);
        let err = |_| corrupt("central directory", offset);

        if c.read_u32::<LittleEndian>().map_err(err)? != CENTRAL_DIRECTORY_SIG {
            return Err(PatchError::CorruptArchive(format!(
                "bad central directory signature at {offset:#x}"
            )));
        }
        let version_made_by = c.read_u16::<LittleEndian>().map_err(err)?;
        let version_needed = c.read_u16::<LittleEndian>().map_err(err)?;
        let flags = c.read_u16::<LittleEndian>().map_err(err)?;
        let method = c.read_u16::<LittleEndian>().map_err(err)?;
        let mod_time = c.read_u16::<LittleEndian>().map_err(err)?;
        let mod_date = c.read_u16::<LittleEndian>().map_err(err)?;
        let crc32 = c.read_u32::<LittleEndian>().map_err(err)?;
        let compressed_size = c.read_u32::<LittleEndian>().map_err(err)?;
        let uncompressed_size = c.read_u32::<LittleEndian>().map_err(err)?;
        let name_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let extra_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let comment_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let disk_start = c.read_u16::<LittleEndian>().map_err(err)?;
        let internal_attrs = c.read_u16::<LittleEndian>().map_err(err)?;
        let external_attrs = c.read_u32::<LittleEndian>().map_err(err)?;
        let local_header_offset = c.read_u32::<LittleEndian>().map_err(err)?;
        let name = decode_name(
            read_bytes(&mut c, name_len, "central directory", offset)?,
            offset,
        )?;
        let extra = read_bytes(&mut c, extra_len, "central directory", offset)?;
        let comment = read_bytes(&mut c, comment_len, "central directory", offset)?;

        Ok((
            CentralDirectoryHeader {
                version_made_by,
                version_needed,
                flags,
                method,
                mod_time,
                mod_date,
                crc32,
                compressed_size,
                uncompressed_size,
                disk_start,
                internal_attrs,
                external_attrs,
                local_header_offset,
                name,
                extra,
                comment,
            },
            CENTRAL_DIRECTORY_HEADER_SIZE + name_len + extra_len + comment_len,
        ))
    }

    pub fn write_to(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u32::<LittleEndian>(CENTRAL_DIRECTORY_SIG)?;
        out.write_u16::<LittleEndian>(self.version_made_by)?;
        out.write_u16::<LittleEndian>(self.version_needed)?;
        out.write_u16::<LittleEndian>(self.flags)?;
        out.write_u16::<LittleEndian>(self.method)?;
        out.write_u16::<LittleEndian>(self.mod_time)?;
        out.write_u16::<LittleEndian>(self.mod_date)?;
        out.write_u32::<LittleEndian>(self.crc32)?;
        out.write_u32::<LittleEndian>(self.compressed_size)?;
        out.write_u32::<LittleEndian>(self.uncompressed_size)?;
        out.write_u16::<LittleEndian>(u16_len(self.name.len(), "entry name")?)?;
        out.write_u16::<LittleEndian>(u16_len(self.extra.len(), "extra field")?)?;
        out.write_u16::<LittleEndian>(u16_len(self.comment.len(), "entry comment")?)?;
        out.write_u16::<LittleEndian>(self.disk_start)?;
        out.write_u16::<LittleEndian>(self.internal_attrs)?;
        out.write_u32::<LittleEndian>(self.external_attrs)?;
        out.write_u32::<LittleEndian>(self.local_header_offset)?;
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.comment);
        Ok(())
    }
}

/// End of central directory record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub cd_disk: u16,
    pub entries_on_disk: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment: Vec<u8>,
}

impl EndOfCentralDirectory {
    /// Scan backwards for the record; returns its offset and contents
    pub fn locate(buf: &[u8]) -> Result<(usize, Self)> {
        if buf.len() < END_OF_CENTRAL_DIRECTORY_SIZE {
            return Err(PatchError::CorruptArchive(
                "file too small to be a zip archive".to_string(),
            ));
        }
        let last = buf.len() - END_OF_CENTRAL_DIRECTORY_SIZE;
        let first = last.saturating_sub(MAX_ZIP_COMMENT_SIZE);

        for offset in (first..=last).rev() {
            if buf[offset..offset + 4] != END_OF_CENTRAL_DIRECTORY_SIG.to_le_bytes() {
                continue;
            }
            let comment_len =
                u16::from_le_bytes([buf[offset + 20], buf[offset + 21]]) as usize;
            if offset + END_OF_CENTRAL_DIRECTORY_SIZE + comment_len == buf.len() {
                return Ok((offset, Self::parse(&buf[offset..])?));
            }
        }

        Err(PatchError::CorruptArchive(
            "end of central directory not found".to_string(),
        ))
    }

    fn parse(buf: &[u8]) -> Result<Self> {
        let mut c = Cursor::new(buf);
        let err = |_| corrupt("end of central directory", 0);
        c.read_u32::<LittleEndian>().map_err(err)?;
        let disk_number = c.read_u16::<LittleEndian>().map_err(err)?;
        let cd_disk = c.read_u16::<LittleEndian>().map_err(err)?;
        let entries_on_disk = c.read_u16::<LittleEndian>().map_err(err)?;
        let total_entries = c.read_u16::<LittleEndian>().map_err(err)?;
        let cd_size = c.read_u32::<LittleEndian>().map_err(err)?;
        let cd_offset = c.read_u32::<LittleEndian>().map_err(err)?;
        let comment_len = c.read_u16::<LittleEndian>().map_err(err)? as usize;
        let comment = read_bytes(&mut c, comment_len, "archive comment", 0)?;
        Ok(EndOfCentralDirectory {
            disk_number,
            cd_disk,
            entries_on_disk,
            total_entries,
            cd_size,
            cd_offset,
            comment,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(END_OF_CENTRAL_DIRECTORY_SIZE + self.comment.len());
        out.write_u32::<LittleEndian>(END_OF_CENTRAL_DIRECTORY_SIG)?;
        out.write_u16::<LittleEndian>(self.disk_number)?;
        out.write_u16::<LittleEndian>(self.cd_disk)?;
        out.write_u16::<LittleEndian>(self.entries_on_disk)?;
        out.write_u16::<LittleEndian>(self.total_entries)?;
        out.write_u32::<LittleEndian>(self.cd_size)?;
        out.write_u32::<LittleEndian>(self.cd_offset)?;
        out.write_u16::<LittleEndian>(u16_len(self.comment.len(), "archive comment")?)?;
        out.extend_from_slice(&self.comment);
        Ok(out)
    }
}

/// Offset of the central-directory-offset field inside an EOCD record
pub const EOCD_CD_OFFSET_FIELD: usize = 16;

fn u16_len(len: usize, what: &str) -> Result<u16> {
    u16::try_from(len).map_err(|_| PatchError::CorruptArchive(format!("{what} too long ({len})")))
}

/// Drop alignment records from an extra field. Unparseable extras (zipalign
/// style zero padding) are dropped entirely.
pub fn strip_alignment_extra(extra: &[u8]) -> Vec<u8> {
    let mut kept = Vec::with_capacity(extra.len());
    let mut pos = 0;
    while pos + 4 <= extra.len() {
        let id = u16::from_le_bytes([extra[pos], extra[pos + 1]]);
        let size = u16::from_le_bytes([extra[pos + 2], extra[pos + 3]]) as usize;
        let end = pos + 4 + size;
        if end > extra.len() {
            return Vec::new();
        }
        if id != ALIGNMENT_EXTRA_ID && id != 0 {
            kept.extend_from_slice(&extra[pos..end]);
        }
        pos = end;
    }
    if pos != extra.len() {
        return Vec::new();
    }
    kept
}

/// Build an alignment record so data starting after `header_end + record`
/// lands on a multiple of `alignment`
pub fn alignment_extra(header_end: usize, alignment: usize) -> Vec<u8> {
    if alignment <= 1 || header_end % alignment == 0 {
        return Vec::new();
    }
    let min = super::super::constants::ALIGNMENT_EXTRA_MIN_SIZE;
    let padding = (alignment - (header_end + min) % alignment) % alignment;
    let mut record = Vec::with_capacity(min + padding);
    record.extend_from_slice(&ALIGNMENT_EXTRA_ID.to_le_bytes());
    record.extend_from_slice(&((2 + padding) as u16).to_le_bytes());
    record.extend_from_slice(&(alignment as u16).to_le_bytes());
    record.resize(min + padding, 0);
    record
}
