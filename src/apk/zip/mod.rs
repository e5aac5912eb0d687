//! Zip container reading and writing

pub mod reader;
pub mod records;
pub mod writer;

pub use reader::{Archive, ArchiveEntry, ArchiveSet};
pub use writer::{Compression, FrozenArchive, StagedArchive};
