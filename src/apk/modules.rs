//! Module embedding for portable mode
//!
//! Each module archive is validated on its own; a module without a
//! descriptor is reported and skipped while the rest of the batch goes on.

use crate::apk::axml::ManifestEditor;
use crate::apk::defaults::{
    MANIFEST_ENTRY, MODULE_MIN_VERSION_KEY, MODULE_PROP_ENTRY, MODULE_PROP_MIN_API,
    MODULES_ASSET_DIR,
};
use crate::apk::zip::{Archive, Compression, StagedArchive};
use crate::exceptions::{PatchError, Result};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Which descriptor identified a module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleDescriptor {
    /// `xposedminversion` meta-data in the manifest
    Legacy,
    /// `META-INF/xposed/module.prop`
    Modern,
}

/// A validated module archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub package: Option<String>,
    pub descriptor: ModuleDescriptor,
}

/// Per-module result of an embedding batch
#[derive(Debug)]
pub enum ModuleOutcome {
    Embedded {
        source: PathBuf,
        entry: String,
        package: Option<String>,
    },
    Skipped {
        source: PathBuf,
        reason: String,
    },
    Rejected {
        source: PathBuf,
        error: PatchError,
    },
}

impl ModuleOutcome {
    pub fn source(&self) -> &Path {
        match self {
            ModuleOutcome::Embedded { source, .. }
            | ModuleOutcome::Skipped { source, .. }
            | ModuleOutcome::Rejected { source, .. } => source,
        }
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, ModuleOutcome::Embedded { .. })
    }
}

impl fmt::Display for ModuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleOutcome::Embedded {
                source,
                entry,
                package,
            } => write!(
                f,
                "embedded {} as {entry} ({})",
                source.display(),
                package.as_deref().unwrap_or("unknown package")
            ),
            ModuleOutcome::Skipped { source, reason } => {
                write!(f, "skipped {}: {reason}", source.display())
            }
            ModuleOutcome::Rejected { source, error } => {
                write!(f, "rejected {}: {error}", source.display())
            }
        }
    }
}

fn not_a_module(path: &Path, why: impl fmt::Display) -> PatchError {
    PatchError::NotAXposedModule(format!("{}: {why}", path.display()))
}

/// Check that `bytes` is a module archive
pub fn validate_module(path: &Path, bytes: Vec<u8>) -> Result<ModuleInfo> {
    let archive =
        Archive::from_bytes(path, bytes).map_err(|e| not_a_module(path, e))?;

    let manifest = match archive.entry(MANIFEST_ENTRY) {
        Some(entry) => entry
            .read()
            .and_then(|bytes| ManifestEditor::parse(&bytes))
            .map_err(|e| not_a_module(path, e))
            .map(Some)?,
        None => None,
    };
    let package = manifest.as_ref().and_then(ManifestEditor::package_name);

    if manifest
        .as_ref()
        .is_some_and(|m| m.meta_data(MODULE_MIN_VERSION_KEY).is_some())
    {
        return Ok(ModuleInfo {
            package,
            descriptor: ModuleDescriptor::Legacy,
        });
    }

    if let Some(entry) = archive.entry(MODULE_PROP_ENTRY) {
        let prop = entry.read().map_err(|e| not_a_module(path, e))?;
        let declares_api = String::from_utf8_lossy(&prop).lines().any(|line| {
            line.split_once('=')
                .is_some_and(|(key, _)| key.trim() == MODULE_PROP_MIN_API)
        });
        if declares_api {
            return Ok(ModuleInfo {
                package,
                descriptor: ModuleDescriptor::Modern,
            });
        }
    }

    Err(not_a_module(path, "no module descriptor"))
}

/// `name`, or `stem-N.ext` for the first free N
fn unique_entry(taken: &HashSet<String>, file_name: &str) -> String {
    let candidate = format!("{MODULES_ASSET_DIR}{file_name}");
    if !taken.contains(&candidate) {
        return candidate;
    }
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (file_name, String::new()),
    };
    (1..)
        .map(|n| format!("{MODULES_ASSET_DIR}{stem}-{n}{ext}"))
        .find(|name| !taken.contains(name))
        .unwrap_or(candidate)
}

/// Embed every valid module of `modules` into `staged`
///
/// In local mode nothing is embedded and every module is reported skipped.
/// Only IO failures abort the batch.
pub fn embed_modules(
    staged: &mut StagedArchive,
    modules: &[PathBuf],
    use_manager: bool,
) -> Result<Vec<ModuleOutcome>> {
    if use_manager {
        return Ok(modules
            .iter()
            .map(|source| ModuleOutcome::Skipped {
                source: source.clone(),
                reason: "local mode loads modules from the manager".to_string(),
            })
            .collect());
    }

    let mut taken: HashSet<String> = staged
        .names()
        .filter(|n| n.starts_with(MODULES_ASSET_DIR))
        .map(str::to_string)
        .collect();
    let mut outcomes = Vec::with_capacity(modules.len());

    for source in modules {
        let bytes = fs::read(source)?;
        let info = match validate_module(source, bytes.clone()) {
            Ok(info) => info,
            Err(error) => {
                warn!("⚠️ {error}");
                outcomes.push(ModuleOutcome::Rejected {
                    source: source.clone(),
                    error,
                });
                continue;
            }
        };

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "module.apk".to_string());
        let entry = unique_entry(&taken, &file_name);
        staged.put(&entry, &bytes, Compression::Stored)?;
        taken.insert(entry.clone());
        debug!("🧩 {} -> {entry} ({:?})", source.display(), info.descriptor);
        outcomes.push(ModuleOutcome::Embedded {
            source: source.clone(),
            entry,
            package: info.package,
        });
    }

    let embedded = outcomes.iter().filter(|o| o.is_embedded()).count();
    info!("🧩 Embedded {embedded}/{} modules", modules.len());
    Ok(outcomes)
}

/// Write modules already embedded in `archive` into `dir` and remove them
/// from `staged`, so they can be embedded again
pub fn extract_embedded(
    archive: &Archive,
    staged: &mut StagedArchive,
    dir: &Path,
) -> Result<Vec<PathBuf>> {
    let mut extracted = Vec::new();
    for entry in archive.entries() {
        let Some(file_name) = entry.name.strip_prefix(MODULES_ASSET_DIR) else {
            continue;
        };
        if file_name.is_empty() || file_name.contains('/') {
            continue;
        }
        let path = dir.join(file_name);
        fs::write(&path, entry.read()?)?;
        staged.remove(&entry.name);
        extracted.push(path);
    }
    if !extracted.is_empty() {
        debug!("📤 Extracted {} embedded modules", extracted.len());
    }
    Ok(extracted)
}
