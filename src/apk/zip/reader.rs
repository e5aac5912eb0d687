//! Random-access archive reader

use super::records::{CentralDirectoryHeader, EndOfCentralDirectory, LocalFileHeader};
use crate::apk::constants::{
    DATA_DESCRIPTOR_SIG, FLAG_DATA_DESCRIPTOR, METHOD_DEFLATED,
    METHOD_STORED, ZIP64_EOCD_LOCATOR_SIG,
};
use crate::exceptions::{PatchError, Result};
use flate2::read::DeflateDecoder;
use log::{debug, trace};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where an entry's compressed bytes live
#[derive(Debug, Clone)]
enum EntryData {
    /// Slice of an archive that was read from disk
    Borrowed { source: Arc<[u8]>, range: Range<usize> },
    /// Freshly compressed bytes staged for output
    Owned(Arc<[u8]>),
}

/// A named entry inside an archive
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub method: u16,
    pub flags: u16,
    pub crc32: u32,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub mod_time: u16,
    pub mod_date: u16,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub internal_attrs: u16,
    pub external_attrs: u32,
    pub local_extra: Vec<u8>,
    pub central_extra: Vec<u8>,
    pub comment: Vec<u8>,
    /// Offset of the local header in the source archive; 0 for staged entries
    pub header_offset: u64,
    data: EntryData,
}

impl ArchiveEntry {
    pub(crate) fn owned(
        name: String,
        method: u16,
        crc32: u32,
        uncompressed_size: u64,
        compressed: Vec<u8>,
    ) -> Self {
        ArchiveEntry {
            name,
            method,
            flags: 0,
            crc32,
            compressed_size: compressed.len() as u64,
            uncompressed_size,
            mod_time: 0,
            mod_date: 0,
            version_made_by: 0,
            version_needed: 0,
            internal_attrs: 0,
            external_attrs: 0,
            local_extra: Vec::new(),
            central_extra: Vec::new(),
            comment: Vec::new(),
            header_offset: 0,
            data: EntryData::Owned(Arc::from(compressed)),
        }
    }

    /// Compressed bytes exactly as they are (or will be) stored
    pub fn compressed_data(&self) -> &[u8] {
        match &self.data {
            EntryData::Borrowed { source, range } => &source[range.clone()],
            EntryData::Owned(bytes) => bytes,
        }
    }

    pub fn is_stored(&self) -> bool {
        self.method == METHOD_STORED
    }

    pub fn is_directory(&self) -> bool {
        self.name.ends_with('/')
    }

    /// Decompress and CRC-check the entry content
    pub fn read(&self) -> Result<Vec<u8>> {
        let raw = self.compressed_data();
        let data = match self.method {
            METHOD_STORED => raw.to_vec(),
            METHOD_DEFLATED => {
                let capacity = (self.uncompressed_size as usize).min(64 * 1024 * 1024);
                let mut out = Vec::with_capacity(capacity);
                DeflateDecoder::new(raw)
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        PatchError::CorruptArchive(format!("{}: inflate failed: {e}", self.name))
                    })?;
                out
            }
            other => {
                return Err(PatchError::CorruptArchive(format!(
                    "{}: unsupported compression method {other}",
                    self.name
                )));
            }
        };

        if data.len() as u64 != self.uncompressed_size {
            return Err(PatchError::CorruptArchive(format!(
                "{}: size mismatch (expected {}, got {})",
                self.name,
                self.uncompressed_size,
                data.len()
            )));
        }
        if crc32fast::hash(&data) != self.crc32 {
            return Err(PatchError::CorruptArchive(format!(
                "{}: CRC-32 mismatch",
                self.name
            )));
        }
        Ok(data)
    }
}

/// An opened package archive
#[derive(Debug)]
pub struct Archive {
    path: PathBuf,
    bytes: Arc<[u8]>,
    entries: Vec<ArchiveEntry>,
    index: HashMap<String, usize>,
    cd_offset: u64,
    eocd_offset: u64,
    comment: Vec<u8>,
}

impl Archive {
    /// Open and index an archive from disk
    pub fn open(path: &Path) -> Result<Self> {
        debug!("📂 Opening archive: {}", path.display());
        let bytes = fs::read(path)?;
        Self::from_bytes(path, bytes)
    }

    /// Index an archive already held in memory
    pub fn from_bytes(path: &Path, bytes: Vec<u8>) -> Result<Self> {
        let bytes: Arc<[u8]> = Arc::from(bytes);
        let (eocd_offset, eocd) = EndOfCentralDirectory::locate(&bytes)?;

        if eocd.total_entries == 0xffff
            || eocd.cd_offset == 0xffff_ffff
            || has_zip64_locator(&bytes, eocd_offset)
        {
            return Err(PatchError::CorruptArchive(
                "zip64 archives are not supported".to_string(),
            ));
        }
        if eocd.disk_number != 0 || eocd.cd_disk != 0 {
            return Err(PatchError::CorruptArchive(
                "multi-disk archives are not supported".to_string(),
            ));
        }

        let cd_offset = eocd.cd_offset as usize;
        let cd_end = cd_offset + eocd.cd_size as usize;
        if cd_end > eocd_offset {
            return Err(PatchError::CorruptArchive(format!(
                "central directory [{cd_offset:#x}, {cd_end:#x}) overruns end record at {eocd_offset:#x}"
            )));
        }

        let mut entries = Vec::with_capacity(eocd.total_entries as usize);
        let mut index = HashMap::with_capacity(eocd.total_entries as usize);
        let mut pos = cd_offset;
        for _ in 0..eocd.total_entries {
            let (cdh, len) = CentralDirectoryHeader::parse(&bytes[..cd_end], pos)?;
            pos += len;
            let entry = read_entry_at(&bytes, cdh, cd_offset)?;
            trace!(
                "  {} method={} {} -> {} bytes",
                entry.name, entry.method, entry.compressed_size, entry.uncompressed_size
            );
            if index.insert(entry.name.clone(), entries.len()).is_some() {
                return Err(PatchError::CorruptArchive(format!(
                    "duplicate entry: {}",
                    entry.name
                )));
            }
            entries.push(entry);
        }

        check_overlaps(&entries, cd_offset as u64)?;
        debug!("✅ Indexed {} entries from {}", entries.len(), path.display());

        Ok(Archive {
            path: path.to_path_buf(),
            bytes,
            entries,
            index,
            cd_offset: cd_offset as u64,
            eocd_offset: eocd_offset as u64,
            comment: eocd.comment,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in central directory order
    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Read an entry's uncompressed content
    pub fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        self.entry(name)
            .ok_or_else(|| PatchError::EntryNotFound(format!("{name} in {}", self.path.display())))?
            .read()
    }

    /// Whole archive bytes as read from disk
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn central_directory_offset(&self) -> u64 {
        self.cd_offset
    }

    pub fn end_of_central_directory_offset(&self) -> u64 {
        self.eocd_offset
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }
}

fn has_zip64_locator(bytes: &[u8], eocd_offset: usize) -> bool {
    eocd_offset >= 20
        && bytes[eocd_offset - 20..eocd_offset - 16] == ZIP64_EOCD_LOCATOR_SIG.to_le_bytes()
}

fn read_entry_at(bytes: &Arc<[u8]>, cdh: CentralDirectoryHeader, cd_offset: usize) -> Result<ArchiveEntry> {
    let header_offset = cdh.local_header_offset as usize;
    if header_offset >= cd_offset {
        return Err(PatchError::CorruptArchive(format!(
            "{}: local header at {header_offset:#x} lies past the entry section",
            cdh.name
        )));
    }
    let (lfh, header_len) = LocalFileHeader::parse(&bytes[..cd_offset], header_offset)?;
    if lfh.name != cdh.name {
        return Err(PatchError::CorruptArchive(format!(
            "local header name {:?} does not match central directory {:?}",
            lfh.name, cdh.name
        )));
    }

    let data_start = header_offset + header_len;
    let data_end = data_start + cdh.compressed_size as usize;
    if data_end > cd_offset {
        return Err(PatchError::CorruptArchive(format!(
            "{}: data [{data_start:#x}, {data_end:#x}) overruns central directory",
            cdh.name
        )));
    }

    Ok(ArchiveEntry {
        name: cdh.name,
        method: cdh.method,
        flags: cdh.flags,
        crc32: cdh.crc32,
        compressed_size: cdh.compressed_size as u64,
        uncompressed_size: cdh.uncompressed_size as u64,
        mod_time: cdh.mod_time,
        mod_date: cdh.mod_date,
        version_made_by: cdh.version_made_by,
        version_needed: cdh.version_needed,
        internal_attrs: cdh.internal_attrs,
        external_attrs: cdh.external_attrs,
        local_extra: lfh.extra,
        central_extra: cdh.extra,
        comment: cdh.comment,
        header_offset: header_offset as u64,
        data: EntryData::Borrowed {
            source: Arc::clone(bytes),
            range: data_start..data_end,
        },
    })
}

/// Span of an entry on disk, including a trailing data descriptor
fn entry_span(entry: &ArchiveEntry) -> Option<Range<u64>> {
    let EntryData::Borrowed { source, range } = &entry.data else {
        return None;
    };
    let mut end = range.end;
    if entry.flags & FLAG_DATA_DESCRIPTOR != 0 {
        let has_sig = source
            .get(end..end + 4)
            .is_some_and(|s| s == DATA_DESCRIPTOR_SIG.to_le_bytes());
        end += if has_sig { 16 } else { 12 };
    }
    Some(entry.header_offset..end as u64)
}

fn check_overlaps(entries: &[ArchiveEntry], cd_offset: u64) -> Result<()> {
    let mut spans: Vec<(Range<u64>, &str)> = entries
        .iter()
        .filter_map(|e| entry_span(e).map(|span| (span, e.name.as_str())))
        .collect();
    spans.sort_by_key(|(span, _)| span.start);

    for pair in spans.windows(2) {
        let (a, a_name) = &pair[0];
        let (b, b_name) = &pair[1];
        if a.end > b.start {
            return Err(PatchError::CorruptArchive(format!(
                "entries {a_name} and {b_name} overlap"
            )));
        }
    }
    if let Some((last, name)) = spans.last() {
        if last.end > cd_offset {
            return Err(PatchError::CorruptArchive(format!(
                "entry {name} overlaps the central directory"
            )));
        }
    }
    Ok(())
}

/// Base archive plus its split archives
#[derive(Debug)]
pub struct ArchiveSet {
    base: Archive,
    splits: Vec<Archive>,
}

impl ArchiveSet {
    /// Open every path; the first is the base
    pub fn open(paths: &[PathBuf]) -> Result<Self> {
        let (first, rest) = paths
            .split_first()
            .ok_or_else(|| PatchError::Generic("no input archives given".to_string()))?;
        let base = Archive::open(first)?;
        let splits = rest
            .iter()
            .map(|p| Archive::open(p))
            .collect::<Result<Vec<_>>>()?;
        Ok(ArchiveSet { base, splits })
    }

    pub fn base(&self) -> &Archive {
        &self.base
    }

    pub fn splits(&self) -> &[Archive] {
        &self.splits
    }

    pub fn into_parts(self) -> (Archive, Vec<Archive>) {
        (self.base, self.splits)
    }
}
