//! Binary XML (compiled AndroidManifest.xml) reader, editor and writer

pub mod chunks;
pub mod editor;
pub mod string_pool;
pub mod tree;

#[cfg(test)]
pub(crate) mod testutil;

pub use editor::{AttrValue, ManifestEditor};
pub use tree::ManifestTree;
