//! Archive writer: staging, layout and the frozen byte image

use super::reader::{Archive, ArchiveEntry};
use super::records::{
    CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader, alignment_extra,
    strip_alignment_extra,
};
use crate::apk::constants::{
    FLAG_DATA_DESCRIPTOR, FLAG_UTF8, LOCAL_FILE_HEADER_SIZE, METHOD_DEFLATED, METHOD_STORED,
};
use crate::apk::defaults::{
    DOS_EPOCH_DATE, DOS_EPOCH_TIME, NATIVE_LIB_ASSET_DIR, ORIGIN_APK_ASSET, PAGE_ALIGNMENT,
    STORED_ALIGNMENT,
};
use crate::exceptions::{PatchError, Result};
use flate2::write::DeflateEncoder;
use log::{debug, trace};
use std::io::Write;

/// Compression applied to newly written entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Stored,
    Deflated,
}

impl ArchiveEntry {
    /// Compress `data` into a new entry with a reproducible timestamp
    pub fn from_content(name: &str, data: &[u8], compression: Compression) -> Result<Self> {
        let crc = crc32fast::hash(data);
        let (method, compressed) = match compression {
            Compression::Stored => (METHOD_STORED, data.to_vec()),
            Compression::Deflated => {
                let mut encoder = DeflateEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(data)?;
                (METHOD_DEFLATED, encoder.finish()?)
            }
        };
        let mut entry =
            ArchiveEntry::owned(name.to_string(), method, crc, data.len() as u64, compressed);
        entry.mod_date = DOS_EPOCH_DATE;
        entry.mod_time = DOS_EPOCH_TIME;
        entry.version_needed = if method == METHOD_STORED { 10 } else { 20 };
        if !name.is_ascii() {
            entry.flags |= FLAG_UTF8;
        }
        Ok(entry)
    }
}

/// Mutable list of entries destined for an output archive
#[derive(Debug, Clone, Default)]
pub struct StagedArchive {
    entries: Vec<ArchiveEntry>,
    comment: Vec<u8>,
}

impl StagedArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage every entry of `archive`, keeping its order
    pub fn from_archive(archive: &Archive) -> Self {
        StagedArchive {
            entries: archive.entries().to_vec(),
            comment: archive.comment().to_vec(),
        }
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.position(name).map(|i| &self.entries[i])
    }

    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        self.entry(name)
            .ok_or_else(|| PatchError::EntryNotFound(name.to_string()))?
            .read()
    }

    /// Replace an entry in place, or append it when absent
    pub fn put(&mut self, name: &str, data: &[u8], compression: Compression) -> Result<()> {
        let entry = ArchiveEntry::from_content(name, data, compression)?;
        self.put_entry(entry);
        Ok(())
    }

    /// Stage a prepared entry, replacing any entry of the same name
    pub fn put_entry(&mut self, entry: ArchiveEntry) {
        match self.position(&entry.name) {
            Some(i) => {
                trace!("♻️ Replacing entry {}", entry.name);
                self.entries[i] = entry;
            }
            None => {
                trace!("➕ Adding entry {}", entry.name);
                self.entries.push(entry);
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    /// Keep only the entries for which `keep` returns true; returns removed names
    pub fn retain(&mut self, mut keep: impl FnMut(&ArchiveEntry) -> bool) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            let k = keep(e);
            if !k {
                removed.push(e.name.clone());
            }
            k
        });
        removed
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    /// Lay out local headers, data, central directory and end record
    pub(crate) fn layout(self) -> Result<FrozenArchive> {
        let mut data = Vec::new();
        let mut central_directory = Vec::new();
        let mut names = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let offset = data.len();
            let compressed = entry.compressed_data();
            let compressed_size = u32_field(compressed.len() as u64, &entry.name)?;
            let uncompressed_size = u32_field(entry.uncompressed_size, &entry.name)?;
            let flags = entry.flags & !FLAG_DATA_DESCRIPTOR;

            let mut extra = strip_alignment_extra(&entry.local_extra);
            let alignment = alignment_for(entry);
            if alignment > 1 {
                let header_end = offset + LOCAL_FILE_HEADER_SIZE + entry.name.len() + extra.len();
                extra.extend(alignment_extra(header_end, alignment));
            }

            let local = LocalFileHeader {
                version_needed: entry.version_needed,
                flags,
                method: entry.method,
                mod_time: entry.mod_time,
                mod_date: entry.mod_date,
                crc32: entry.crc32,
                compressed_size,
                uncompressed_size,
                name: entry.name.clone(),
                extra,
            };
            local.write_to(&mut data)?;
            data.extend_from_slice(compressed);

            CentralDirectoryHeader {
                version_made_by: entry.version_made_by,
                version_needed: entry.version_needed,
                flags,
                method: entry.method,
                mod_time: entry.mod_time,
                mod_date: entry.mod_date,
                crc32: entry.crc32,
                compressed_size,
                uncompressed_size,
                disk_start: 0,
                internal_attrs: entry.internal_attrs,
                external_attrs: entry.external_attrs,
                local_header_offset: u32_field(offset as u64, &entry.name)?,
                name: entry.name.clone(),
                extra: entry.central_extra.clone(),
                comment: entry.comment.clone(),
            }
            .write_to(&mut central_directory)?;
            names.push(entry.name.clone());
        }

        let count = u16::try_from(self.entries.len()).map_err(|_| {
            PatchError::CorruptArchive(format!("too many entries ({})", self.entries.len()))
        })?;
        let eocd = EndOfCentralDirectory {
            disk_number: 0,
            cd_disk: 0,
            entries_on_disk: count,
            total_entries: count,
            cd_size: u32_field(central_directory.len() as u64, "central directory")?,
            cd_offset: u32_field(data.len() as u64, "central directory")?,
            comment: self.comment,
        };

        debug!(
            "🧊 Froze {} entries: {} data bytes, {} directory bytes",
            names.len(),
            data.len(),
            central_directory.len()
        );
        Ok(FrozenArchive {
            data,
            central_directory,
            eocd,
            names,
        })
    }
}

fn u32_field(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| {
        PatchError::CorruptArchive(format!("{what}: value {value} needs zip64"))
    })
}

/// Alignment required for an entry's data
fn alignment_for(entry: &ArchiveEntry) -> usize {
    if !entry.is_stored() {
        return 1;
    }
    let name = entry.name.as_str();
    let native = name.ends_with(".so")
        && (name.starts_with("lib/") || name.starts_with(NATIVE_LIB_ASSET_DIR));
    if native || name == ORIGIN_APK_ASSET {
        PAGE_ALIGNMENT
    } else {
        STORED_ALIGNMENT
    }
}

/// Archive whose entry content and layout can no longer change
///
/// Holds the three regions covered by whole-file signatures: entry data,
/// central directory, and end of central directory.
#[derive(Debug)]
pub struct FrozenArchive {
    data: Vec<u8>,
    central_directory: Vec<u8>,
    eocd: EndOfCentralDirectory,
    names: Vec<String>,
}

impl FrozenArchive {
    /// Local headers and entry data
    pub fn entries_section(&self) -> &[u8] {
        &self.data
    }

    pub fn central_directory(&self) -> &[u8] {
        &self.central_directory
    }

    /// End record with the central directory offset as currently declared
    pub fn end_of_central_directory(&self) -> Result<Vec<u8>> {
        self.eocd.to_bytes()
    }

    pub fn entry_names(&self) -> &[String] {
        &self.names
    }

    /// Final image with `signing_block` spliced in front of the central
    /// directory. Entry offsets stay put; only the EOCD offset moves.
    pub(crate) fn assemble(&self, signing_block: Option<&[u8]>) -> Result<Vec<u8>> {
        let block = signing_block.unwrap_or_default();
        let mut eocd = self.eocd.clone();
        eocd.cd_offset = u32_field((self.data.len() + block.len()) as u64, "signing block")?;
        let eocd_bytes = eocd.to_bytes()?;

        let mut out = Vec::with_capacity(
            self.data.len() + block.len() + self.central_directory.len() + eocd_bytes.len(),
        );
        out.extend_from_slice(&self.data);
        out.extend_from_slice(block);
        out.extend_from_slice(&self.central_directory);
        out.extend_from_slice(&eocd_bytes);
        Ok(out)
    }
}
