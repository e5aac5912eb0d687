//! Signature engine
//!
//! Signing happens in two steps whose order the types enforce:
//! [`SignatureEngine::freeze`] applies the JAR signature and fixes the
//! archive layout, then [`SignatureEngine::seal`] signs the frozen bytes and
//! splices in the APK Signing Block. Only a [`SignedArchive`] can be written.

pub mod algorithm;
pub mod block;
pub mod identity;
pub mod schemes;
pub mod v1;
pub mod verifier;

pub use identity::{IdentitySource, SigningIdentity, reset_default_identity};
pub use schemes::BlockScheme;
pub use verifier::{SchemeStatus, VerifyResult, verify_apk};

use crate::apk::zip::{FrozenArchive, StagedArchive};
use crate::exceptions::{PatchError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Which signature schemes to produce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schemes {
    pub v1: bool,
    pub v2: bool,
    pub v3: bool,
}

impl Schemes {
    pub const ALL: Schemes = Schemes {
        v1: true,
        v2: true,
        v3: true,
    };

    pub fn count(&self) -> usize {
        [self.v1, self.v2, self.v3].iter().filter(|s| **s).count()
    }

    pub fn validate(&self) -> Result<()> {
        if self.count() == 0 {
            return Err(PatchError::SchemeConflict(
                "at least one of v1, v2 and v3 must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    /// Block schemes in signing-block order
    pub fn block_schemes(&self) -> Vec<BlockScheme> {
        let mut out = Vec::new();
        if self.v2 {
            out.push(BlockScheme::V2);
        }
        if self.v3 {
            out.push(BlockScheme::V3);
        }
        out
    }
}

impl Default for Schemes {
    fn default() -> Self {
        Schemes::ALL
    }
}

impl fmt::Display for Schemes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(self.v1, "v1"), (self.v2, "v2"), (self.v3, "v3")]
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("+"))
        }
    }
}

/// Signs staged archives with one identity and scheme selection
#[derive(Debug)]
pub struct SignatureEngine {
    identity: SigningIdentity,
    schemes: Schemes,
}

impl SignatureEngine {
    pub fn new(identity: SigningIdentity, schemes: Schemes) -> Result<Self> {
        schemes.validate()?;
        info!(
            "🔑 Signing with {} ({}-bit key), schemes {}",
            &identity.fingerprint()[..16],
            identity.key_bits(),
            schemes
        );
        Ok(SignatureEngine { identity, schemes })
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn schemes(&self) -> Schemes {
        self.schemes
    }

    /// Drop stale signatures, apply v1, and fix the layout
    pub fn freeze(&self, mut staged: StagedArchive) -> Result<FrozenArchive> {
        let stripped = v1::strip_signature_files(&mut staged);
        if !stripped.is_empty() {
            debug!("🗑️ Removed {} old signature files", stripped.len());
        }
        if self.schemes.v1 {
            let block_ids: Vec<u32> = self
                .schemes
                .block_schemes()
                .iter()
                .map(|s| s.scheme_id())
                .collect();
            v1::sign(&mut staged, &self.identity, &block_ids)?;
        }
        staged.layout()
    }

    /// Compute v2/v3 over the frozen regions and splice the signing block
    pub fn seal(&self, frozen: FrozenArchive) -> Result<SignedArchive> {
        let block_schemes = self.schemes.block_schemes();
        let signing_block = if block_schemes.is_empty() {
            None
        } else {
            let eocd = frozen.end_of_central_directory()?;
            let algorithm = self.identity.signature_algorithm();
            let digest = algorithm.content_digest(&[
                frozen.entries_section(),
                frozen.central_directory(),
                &eocd,
            ]);
            debug!("🔐 Content digest {}: {}", algorithm, hex::encode(&digest));

            let mut pairs = Vec::with_capacity(block_schemes.len());
            for scheme in block_schemes {
                let value =
                    schemes::build_scheme_block(scheme, &self.identity, &digest, self.schemes.v3)?;
                pairs.push((scheme.block_id(), value));
            }
            Some(block::encode(&pairs)?)
        };

        let bytes = frozen.assemble(signing_block.as_deref())?;
        debug!("📦 Sealed archive: {} bytes", bytes.len());
        Ok(SignedArchive {
            bytes,
            schemes: self.schemes,
        })
    }
}

/// Final archive image, ready to be written
#[derive(Debug)]
pub struct SignedArchive {
    bytes: Vec<u8>,
    schemes: Schemes,
}

impl SignedArchive {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn schemes(&self) -> Schemes {
        self.schemes
    }

    /// Write into a temp file beside `path`; nothing is visible at `path`
    /// until the returned output is committed
    pub fn stage(&self, path: &Path) -> Result<PendingOutput> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&self.bytes)?;
        temp.as_file().sync_all()?;
        debug!("📝 Staged {} bytes for {}", self.bytes.len(), path.display());
        Ok(PendingOutput {
            temp,
            path: path.to_path_buf(),
            len: self.bytes.len(),
        })
    }

    /// Write atomically: a temp file in the target directory replaces `path`
    pub fn persist(&self, path: &Path) -> Result<()> {
        self.stage(path)?.commit()
    }
}

/// Fully written output waiting in a temp file; dropping it discards the data
#[derive(Debug)]
pub struct PendingOutput {
    temp: NamedTempFile,
    path: PathBuf,
    len: usize,
}

impl PendingOutput {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rename into place, replacing any existing file
    pub fn commit(self) -> Result<()> {
        self.temp
            .persist(&self.path)
            .map_err(|e| PatchError::IoError(e.error))?;
        info!("💾 Wrote {} ({} bytes)", self.path.display(), self.len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::signing::identity::tests::test_identity;
    use crate::apk::zip::{Archive, Compression};
    use std::io::Read;
    use tempfile::TempDir;

    fn staged() -> StagedArchive {
        let mut staged = StagedArchive::new();
        staged
            .put("AndroidManifest.xml", b"manifest", Compression::Deflated)
            .unwrap();
        staged.put("classes.dex", &[3u8; 5000], Compression::Deflated).unwrap();
        staged
            .put("META-INF/CERT.RSA", b"old signature", Compression::Deflated)
            .unwrap();
        staged
    }

    #[test]
    fn test_zero_schemes_is_a_conflict() {
        let none = Schemes {
            v1: false,
            v2: false,
            v3: false,
        };
        assert!(matches!(
            SignatureEngine::new(test_identity(), none),
            Err(PatchError::SchemeConflict(_))
        ));
        assert_eq!(none.to_string(), "none");
        assert_eq!(Schemes::ALL.to_string(), "v1+v2+v3");
    }

    #[test]
    fn test_seal_and_persist_round_trip() {
        let engine = SignatureEngine::new(test_identity(), Schemes::ALL).unwrap();
        let signed = engine.seal(engine.freeze(staged()).unwrap()).unwrap();

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.apk");
        signed.persist(&path).unwrap();

        let archive = Archive::open(&path).unwrap();
        assert!(!archive.contains("META-INF/CERT.RSA"));
        assert!(archive.contains("META-INF/LSPATCH.SF"));
        let located = block::locate(archive.bytes(), archive.central_directory_offset() as usize)
            .unwrap()
            .unwrap();
        assert!(located.get(BlockScheme::V2.block_id()).is_some());
        assert!(located.get(BlockScheme::V3.block_id()).is_some());

        // The zip crate still reads everything past the signing block
        let mut zip = zip::ZipArchive::new(std::fs::File::open(&path).unwrap()).unwrap();
        let mut dex = Vec::new();
        zip.by_name("classes.dex").unwrap().read_to_end(&mut dex).unwrap();
        assert_eq!(dex, vec![3u8; 5000]);
    }

    #[test]
    fn test_v1_only_has_no_signing_block() {
        let schemes = Schemes {
            v1: true,
            v2: false,
            v3: false,
        };
        let engine = SignatureEngine::new(test_identity(), schemes).unwrap();
        let signed = engine.seal(engine.freeze(staged()).unwrap()).unwrap();
        let archive = Archive::from_bytes(Path::new("v1.apk"), signed.bytes().to_vec()).unwrap();
        let located =
            block::locate(archive.bytes(), archive.central_directory_offset() as usize).unwrap();
        assert!(located.is_none());
    }

    #[test]
    fn test_persist_replaces_existing_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.apk");
        std::fs::write(&path, b"previous").unwrap();
        let engine = SignatureEngine::new(test_identity(), Schemes::ALL).unwrap();
        engine
            .seal(engine.freeze(staged()).unwrap())
            .unwrap()
            .persist(&path)
            .unwrap();
        assert_ne!(std::fs::read(&path).unwrap(), b"previous");
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_dropped_pending_output_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.apk");
        let engine = SignatureEngine::new(test_identity(), Schemes::ALL).unwrap();
        let signed = engine.seal(engine.freeze(staged()).unwrap()).unwrap();

        let pending = signed.stage(&path).unwrap();
        assert_eq!(pending.path(), path.as_path());
        assert!(!path.exists());
        drop(pending);
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);

        signed.stage(&path).unwrap().commit().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), signed.bytes());
    }
}
