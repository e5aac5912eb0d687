//! Error types for the patch engine

use std::fmt;

/// Classification of a [`PatchError`], stable across message changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CorruptArchive,
    EntryNotFound,
    MalformedManifest,
    LoaderAssetConflict,
    NotAXposedModule,
    SigningIdentityUnavailable,
    SchemeConflict,
    IoFailure,
    Cancelled,
    Other,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::CorruptArchive => "CorruptArchive",
            ErrorKind::EntryNotFound => "EntryNotFound",
            ErrorKind::MalformedManifest => "MalformedManifest",
            ErrorKind::LoaderAssetConflict => "LoaderAssetConflict",
            ErrorKind::NotAXposedModule => "NotAXposedModule",
            ErrorKind::SigningIdentityUnavailable => "SigningIdentityUnavailable",
            ErrorKind::SchemeConflict => "SchemeConflict",
            ErrorKind::IoFailure => "IOFailure",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Other => "Error",
        };
        f.write_str(name)
    }
}

/// Main error type for patch engine operations
#[derive(Debug)]
pub enum PatchError {
    /// Input is not a readable zip container, or its entries overlap
    CorruptArchive(String),

    /// A named entry is missing from an archive
    EntryNotFound(String),

    /// Binary manifest failed to parse or serialize
    MalformedManifest(String),

    /// Reserved loader assets clash with the requested operation
    LoaderAssetConflict(String),

    /// A supplied module archive carries no module descriptor
    NotAXposedModule(String),

    /// No signing identity configured and no default could be created
    SigningIdentityUnavailable(String),

    /// Signature scheme selection is unusable
    SchemeConflict(String),

    /// Cooperative cancellation observed between stages
    Cancelled(String),

    /// IO error
    IoError(std::io::Error),

    /// JSON parsing error
    JsonError(serde_json::Error),

    /// Generic error with message
    Generic(String),
}

impl PatchError {
    /// Error kind used for exit codes and failure reports
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatchError::CorruptArchive(_) => ErrorKind::CorruptArchive,
            PatchError::EntryNotFound(_) => ErrorKind::EntryNotFound,
            PatchError::MalformedManifest(_) => ErrorKind::MalformedManifest,
            PatchError::LoaderAssetConflict(_) => ErrorKind::LoaderAssetConflict,
            PatchError::NotAXposedModule(_) => ErrorKind::NotAXposedModule,
            PatchError::SigningIdentityUnavailable(_) => ErrorKind::SigningIdentityUnavailable,
            PatchError::SchemeConflict(_) => ErrorKind::SchemeConflict,
            PatchError::Cancelled(_) => ErrorKind::Cancelled,
            PatchError::IoError(_) => ErrorKind::IoFailure,
            PatchError::JsonError(_) | PatchError::Generic(_) => ErrorKind::Other,
        }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::CorruptArchive(msg) => write!(f, "Corrupt archive: {msg}"),
            PatchError::EntryNotFound(name) => write!(f, "Entry not found: {name}"),
            PatchError::MalformedManifest(msg) => write!(f, "Malformed manifest: {msg}"),
            PatchError::LoaderAssetConflict(msg) => write!(f, "Loader asset conflict: {msg}"),
            PatchError::NotAXposedModule(msg) => write!(f, "Not an Xposed module: {msg}"),
            PatchError::SigningIdentityUnavailable(msg) => {
                write!(f, "Signing identity unavailable: {msg}")
            }
            PatchError::SchemeConflict(msg) => write!(f, "Signature scheme conflict: {msg}"),
            PatchError::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
            PatchError::IoError(err) => write!(f, "IO error: {err}"),
            PatchError::JsonError(err) => write!(f, "JSON error: {err}"),
            PatchError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::IoError(err) => Some(err),
            PatchError::JsonError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PatchError {
    fn from(err: std::io::Error) -> Self {
        PatchError::IoError(err)
    }
}

impl From<serde_json::Error> for PatchError {
    fn from(err: serde_json::Error) -> Self {
        PatchError::JsonError(err)
    }
}

/// A `PatchError` under context keeps its kind
impl From<anyhow::Error> for PatchError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PatchError>() {
            Ok(inner) => inner,
            Err(other) => PatchError::Generic(format!("{other:#}")),
        }
    }
}

impl From<der::Error> for PatchError {
    fn from(err: der::Error) -> Self {
        PatchError::SigningIdentityUnavailable(format!("DER encoding: {err}"))
    }
}

impl From<rsa::Error> for PatchError {
    fn from(err: rsa::Error) -> Self {
        PatchError::SigningIdentityUnavailable(format!("RSA: {err}"))
    }
}

/// Result type for patch engine operations
pub type Result<T> = std::result::Result<T, PatchError>;
