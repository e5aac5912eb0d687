//! Standard exit codes for the lspatch binary
//!
//! Each error kind maps to its own code so wrappers can react without
//! parsing messages.

use crate::exceptions::ErrorKind;

/// Successful execution
pub const EXIT_SUCCESS: i32 = 0;

/// Generic error (avoid using - be more specific)
pub const EXIT_ERROR: i32 = 1;

/// Panic or unrecoverable error
pub const EXIT_PANIC: i32 = 101;

/// Input archive is not a valid zip container
pub const EXIT_CORRUPT_ARCHIVE: i32 = 102;

/// Required archive entry is missing
pub const EXIT_ENTRY_NOT_FOUND: i32 = 103;

/// Binary manifest could not be parsed or written
pub const EXIT_MANIFEST_ERROR: i32 = 104;

/// Invalid command-line arguments
pub const EXIT_INVALID_ARGS: i32 = 105;

/// I/O error (file not found, permission denied, disk error)
pub const EXIT_IO_ERROR: i32 = 106;

/// Signing identity missing or unusable
pub const EXIT_SIGNATURE_ERROR: i32 = 107;

/// Reserved loader assets conflict with the request
pub const EXIT_LOADER_CONFLICT: i32 = 108;

/// Signature scheme selection is invalid
pub const EXIT_SCHEME_CONFLICT: i32 = 109;

/// Invocation was cancelled
pub const EXIT_CANCELLED: i32 = 130;

/// Exit code for an error kind
pub fn for_kind(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::CorruptArchive => EXIT_CORRUPT_ARCHIVE,
        ErrorKind::EntryNotFound => EXIT_ENTRY_NOT_FOUND,
        ErrorKind::MalformedManifest => EXIT_MANIFEST_ERROR,
        ErrorKind::LoaderAssetConflict => EXIT_LOADER_CONFLICT,
        ErrorKind::SigningIdentityUnavailable => EXIT_SIGNATURE_ERROR,
        ErrorKind::SchemeConflict => EXIT_SCHEME_CONFLICT,
        ErrorKind::IoFailure => EXIT_IO_ERROR,
        ErrorKind::Cancelled => EXIT_CANCELLED,
        ErrorKind::NotAXposedModule | ErrorKind::Other => EXIT_ERROR,
    }
}
