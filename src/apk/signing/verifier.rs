//! APK signature verifier

use super::block::{self, LocatedBlock};
use super::schemes::{self, BlockScheme, SchemeSigner};
use super::v1::{self, MANIFEST_NAME, SignatureBlock, parse_manifest};
use crate::apk::zip::Archive;
use crate::exceptions::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, info, warn};
use serde::Serialize;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Outcome of checking one scheme
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "lowercase")]
pub enum SchemeStatus {
    Absent,
    Valid,
    Invalid(String),
}

impl SchemeStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, SchemeStatus::Valid)
    }

    pub fn is_present(&self) -> bool {
        !matches!(self, SchemeStatus::Absent)
    }

    fn log_label(&self) -> &'static str {
        match self {
            SchemeStatus::Absent => "➖ ABSENT",
            SchemeStatus::Valid => "✅ VALID",
            SchemeStatus::Invalid(_) => "❌ INVALID",
        }
    }
}

impl fmt::Display for SchemeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemeStatus::Absent => f.write_str("absent"),
            SchemeStatus::Valid => f.write_str("valid"),
            SchemeStatus::Invalid(reason) => write!(f, "invalid ({reason})"),
        }
    }
}

/// Per-scheme verification report
#[derive(Debug, Clone, Serialize)]
pub struct VerifyResult {
    pub v1: SchemeStatus,
    pub v2: SchemeStatus,
    pub v3: SchemeStatus,
    /// Hex SHA-256 of the signer certificate
    pub signer_sha256: Option<String>,
}

impl VerifyResult {
    /// At least one scheme is present and none is invalid
    pub fn is_verified(&self) -> bool {
        let all = [&self.v1, &self.v2, &self.v3];
        all.iter().any(|s| s.is_present())
            && all.iter().all(|s| !matches!(s, SchemeStatus::Invalid(_)))
    }
}

/// Verify the archive at `path`
pub fn verify_apk(path: &Path) -> Result<VerifyResult> {
    info!("🔍 Verifying {}", path.display());
    let archive = Archive::open(path)?;
    verify_archive(&archive)
}

/// Verify every signature scheme carried by `archive`
pub fn verify_archive(archive: &Archive) -> Result<VerifyResult> {
    let located = block::locate(archive.bytes(), archive.central_directory_offset() as usize)?;

    let (v1, v1_cert, advertised) = verify_v1(archive)?;
    let mut block_certs = Vec::new();
    let mut statuses = Vec::new();
    for scheme in [BlockScheme::V2, BlockScheme::V3] {
        let (status, cert) = match &located {
            Some(found) => verify_block_scheme(archive, found, scheme),
            None => (SchemeStatus::Absent, None),
        };
        block_certs.push(cert);
        statuses.push(status);
    }
    let mut v3 = statuses.pop().unwrap_or(SchemeStatus::Absent);
    let mut v2 = statuses.pop().unwrap_or(SchemeStatus::Absent);

    // Stripping protection: v1 names the block schemes that must exist
    for (status, scheme) in [(&mut v2, BlockScheme::V2), (&mut v3, BlockScheme::V3)] {
        if *status == SchemeStatus::Absent && advertised.contains(&scheme.scheme_id()) {
            *status = SchemeStatus::Invalid(format!("{scheme} advertised by v1 but stripped"));
        }
    }
    if v2.is_valid() && v3 == SchemeStatus::Absent && v2_requires_v3(located.as_ref()) {
        v3 = SchemeStatus::Invalid("v3 required by v2 signer but stripped".to_string());
    }

    debug!("v1 signature: {}", v1.log_label());
    debug!("v2 signature: {}", v2.log_label());
    debug!("v3 signature: {}", v3.log_label());

    let signer_cert = block_certs
        .into_iter()
        .rev()
        .flatten()
        .next()
        .or(v1_cert);
    let result = VerifyResult {
        v1,
        v2,
        v3,
        signer_sha256: signer_cert.map(|der| hex::encode(Sha256::digest(der))),
    };
    debug!(
        "🔍 Verification results: v1={}, v2={}, v3={}",
        result.v1, result.v2, result.v3
    );
    Ok(result)
}

/// Certificate (DER) of whoever signed `archive`, without verifying it
///
/// v3 is preferred over v2, and both over v1.
pub fn signing_certificate(archive: &Archive) -> Result<Option<Vec<u8>>> {
    let located = match block::locate(archive.bytes(), archive.central_directory_offset() as usize)
    {
        Ok(found) => found,
        Err(e) => {
            warn!("⚠️ Ignoring unreadable signing block: {e}");
            None
        }
    };
    if let Some(found) = &located {
        for scheme in [BlockScheme::V3, BlockScheme::V2] {
            let Some(value) = found.get(scheme.block_id()) else {
                continue;
            };
            match schemes::parse_signers(scheme, value) {
                Ok(signers) => {
                    if let Some(cert) = signers.into_iter().find_map(first_certificate) {
                        return Ok(Some(cert));
                    }
                }
                Err(e) => warn!("⚠️ Ignoring unreadable {scheme} block: {e}"),
            }
        }
    }

    for entry in archive.entries() {
        if !is_signature_block_name(&entry.name) {
            continue;
        }
        match SignatureBlock::parse(&entry.read()?) {
            Ok(parsed) => return Ok(Some(parsed.certificate_der)),
            Err(e) => warn!("⚠️ Ignoring unreadable {}: {e}", entry.name),
        }
    }
    Ok(None)
}

fn first_certificate(signer: SchemeSigner) -> Option<Vec<u8>> {
    signer.certificates.into_iter().next()
}

fn is_signature_block_name(name: &str) -> bool {
    if !v1::is_signature_file(name) {
        return false;
    }
    let upper = name.to_ascii_uppercase();
    [".RSA", ".DSA", ".EC"].iter().any(|ext| upper.ends_with(ext))
}

fn v2_requires_v3(located: Option<&LocatedBlock>) -> bool {
    located
        .and_then(|found| found.get(BlockScheme::V2.block_id()))
        .and_then(|value| schemes::parse_signers(BlockScheme::V2, value).ok())
        .is_some_and(|signers| signers.iter().any(SchemeSigner::requires_v3))
}

/// The three regions covered by v2/v3, with the EOCD pointing at the block
fn signed_regions<'a>(archive: &'a Archive, found: &LocatedBlock) -> (&'a [u8], &'a [u8], Vec<u8>) {
    let bytes = archive.bytes();
    let cd_offset = archive.central_directory_offset() as usize;
    let eocd_offset = archive.end_of_central_directory_offset() as usize;
    let mut eocd = bytes[eocd_offset..].to_vec();
    eocd[16..20].copy_from_slice(&(found.offset as u32).to_le_bytes());
    (&bytes[..found.offset], &bytes[cd_offset..eocd_offset], eocd)
}

fn verify_block_scheme(
    archive: &Archive,
    found: &LocatedBlock,
    scheme: BlockScheme,
) -> (SchemeStatus, Option<Vec<u8>>) {
    let Some(value) = found.get(scheme.block_id()) else {
        return (SchemeStatus::Absent, None);
    };
    let signers = match schemes::parse_signers(scheme, value) {
        Ok(signers) => signers,
        Err(e) => return (SchemeStatus::Invalid(e.to_string()), None),
    };
    let (entries, central_directory, eocd) = signed_regions(archive, found);
    let regions = [entries, central_directory, eocd.as_slice()];
    for (i, signer) in signers.iter().enumerate() {
        if let Err(reason) = schemes::verify_signer(signer, &regions) {
            return (
                SchemeStatus::Invalid(format!("signer #{}: {reason}", i + 1)),
                None,
            );
        }
    }
    let cert = signers.into_iter().find_map(first_certificate);
    (SchemeStatus::Valid, cert)
}

fn entry_digest_matches(section: &v1::ManifestSection, content: &[u8]) -> Option<bool> {
    if let Some(expected) = section.get("SHA-256-Digest") {
        return Some(BASE64.encode(Sha256::digest(content)) == expected);
    }
    if let Some(expected) = section.get("SHA1-Digest") {
        return Some(BASE64.encode(Sha1::digest(content)) == expected);
    }
    None
}

/// v1 status, signer certificate, and the block scheme ids the signature
/// file advertises
type V1Outcome = (SchemeStatus, Option<Vec<u8>>, Vec<u32>);

fn verify_v1(archive: &Archive) -> Result<V1Outcome> {
    let Some(sf_entry) = archive.entries().iter().find(|e| {
        v1::is_signature_file(&e.name) && e.name.to_ascii_uppercase().ends_with(".SF")
    }) else {
        return Ok((SchemeStatus::Absent, None, Vec::new()));
    };
    let invalid =
        |reason: String| -> Result<V1Outcome> { Ok((SchemeStatus::Invalid(reason), None, Vec::new())) };

    let Some(manifest_entry) = archive.entry(MANIFEST_NAME) else {
        return invalid("MANIFEST.MF missing".to_string());
    };
    let manifest = manifest_entry.read()?;
    let signature_file = sf_entry.read()?;

    let stem = &sf_entry.name[..sf_entry.name.len() - 3];
    let Some(block_entry) = archive.entries().iter().find(|e| {
        e.name.len() > stem.len() && e.name.starts_with(stem) && is_signature_block_name(&e.name)
    }) else {
        return invalid(format!("no signature block for {}", sf_entry.name));
    };
    let signature_block = match SignatureBlock::parse(&block_entry.read()?) {
        Ok(parsed) => parsed,
        Err(e) => return invalid(e.to_string()),
    };
    if !signature_block.verify(&signature_file)? {
        return invalid(format!("{} signature does not verify", block_entry.name));
    }

    let sf_sections = parse_manifest(&signature_file);
    let sf_main = sf_sections.first().cloned().unwrap_or_default();
    let manifest_digest_ok = match (
        sf_main.get("SHA-256-Digest-Manifest"),
        sf_main.get("SHA1-Digest-Manifest"),
    ) {
        (Some(expected), _) => BASE64.encode(Sha256::digest(&manifest)) == expected,
        (None, Some(expected)) => BASE64.encode(Sha1::digest(&manifest)) == expected,
        (None, None) => false,
    };
    if !manifest_digest_ok {
        return invalid("signature file does not match MANIFEST.MF".to_string());
    }

    let sections = parse_manifest(&manifest);
    for entry in archive.entries() {
        if entry.is_directory() || v1::is_signature_file(&entry.name) {
            continue;
        }
        let Some(section) = sections
            .iter()
            .skip(1)
            .find(|s| s.get("Name") == Some(entry.name.as_str()))
        else {
            return invalid(format!("{} is not covered by MANIFEST.MF", entry.name));
        };
        let content = match entry.read() {
            Ok(content) => content,
            Err(e) => return invalid(e.to_string()),
        };
        match entry_digest_matches(section, &content) {
            Some(true) => {}
            Some(false) => return invalid(format!("digest mismatch for {}", entry.name)),
            None => return invalid(format!("no supported digest for {}", entry.name)),
        }
    }
    for section in sections.iter().skip(1) {
        if let Some(name) = section.get("Name") {
            if !archive.contains(name) {
                return invalid(format!("MANIFEST.MF names missing entry {name}"));
            }
        }
    }

    let advertised = sf_main
        .get("X-Android-APK-Signed")
        .map(|v| {
            v.split(',')
                .filter_map(|id| id.trim().parse::<u32>().ok())
                .collect()
        })
        .unwrap_or_default();
    Ok((
        SchemeStatus::Valid,
        Some(signature_block.certificate_der),
        advertised,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apk::signing::identity::tests::test_identity;
    use crate::apk::signing::{Schemes, SignatureEngine};
    use crate::apk::zip::{Compression, StagedArchive};

    fn signed(schemes: Schemes) -> Vec<u8> {
        let mut staged = StagedArchive::new();
        staged
            .put("AndroidManifest.xml", b"manifest", Compression::Deflated)
            .unwrap();
        staged.put("classes.dex", b"dex code", Compression::Deflated).unwrap();
        staged.put("resources.arsc", &[9u8; 64], Compression::Stored).unwrap();
        let engine = SignatureEngine::new(test_identity(), schemes).unwrap();
        engine
            .seal(engine.freeze(staged).unwrap())
            .unwrap()
            .bytes()
            .to_vec()
    }

    fn open(bytes: Vec<u8>) -> Archive {
        Archive::from_bytes(Path::new("test.apk"), bytes).unwrap()
    }

    #[test]
    fn test_all_schemes_verify() {
        let archive = open(signed(Schemes::ALL));
        let result = verify_archive(&archive).unwrap();
        assert_eq!(result.v1, SchemeStatus::Valid);
        assert_eq!(result.v2, SchemeStatus::Valid);
        assert_eq!(result.v3, SchemeStatus::Valid);
        assert!(result.is_verified());
        assert_eq!(result.signer_sha256, Some(test_identity().fingerprint()));
    }

    #[test]
    fn test_v2_only() {
        let schemes = Schemes {
            v1: false,
            v2: true,
            v3: false,
        };
        let result = verify_archive(&open(signed(schemes))).unwrap();
        assert_eq!(result.v1, SchemeStatus::Absent);
        assert_eq!(result.v2, SchemeStatus::Valid);
        assert_eq!(result.v3, SchemeStatus::Absent);
        assert!(result.is_verified());
    }

    #[test]
    fn test_modified_entry_fails_every_scheme() {
        let mut bytes = signed(Schemes::ALL);
        // resources.arsc is stored, so its bytes appear verbatim
        let pos = bytes
            .windows(64)
            .position(|w| w == [9u8; 64])
            .unwrap();
        bytes[pos] = 8;
        let result = verify_archive(&open(bytes)).unwrap();
        assert!(matches!(result.v1, SchemeStatus::Invalid(_)));
        assert!(matches!(result.v2, SchemeStatus::Invalid(_)));
        assert!(matches!(result.v3, SchemeStatus::Invalid(_)));
        assert!(!result.is_verified());
    }

    #[test]
    fn test_unsigned_archive() {
        let mut staged = StagedArchive::new();
        staged.put("a.txt", b"a", Compression::Stored).unwrap();
        let plain = staged.layout().unwrap().assemble(None).unwrap();
        let archive = open(plain);
        let result = verify_archive(&archive).unwrap();
        assert_eq!(result.v1, SchemeStatus::Absent);
        assert_eq!(result.signer_sha256, None);
        assert!(!result.is_verified());
        assert!(signing_certificate(&archive).unwrap().is_none());
    }

    #[test]
    fn test_stripped_block_is_detected() {
        let v1_only = Schemes {
            v1: true,
            v2: false,
            v3: false,
        };
        // v1 claiming block schemes that are not there
        let mut staged = StagedArchive::new();
        staged.put("a.txt", b"a", Compression::Stored).unwrap();
        v1::sign(&mut staged, &test_identity(), &[2]).unwrap();
        let bytes = staged.layout().unwrap().assemble(None).unwrap();
        let result = verify_archive(&open(bytes)).unwrap();
        assert_eq!(result.v1, SchemeStatus::Valid);
        assert!(matches!(result.v2, SchemeStatus::Invalid(_)));
        assert_eq!(result.v3, SchemeStatus::Absent);

        let result = verify_archive(&open(signed(v1_only))).unwrap();
        assert_eq!(result.v2, SchemeStatus::Absent);
        assert!(result.is_verified());
    }

    #[test]
    fn test_signing_certificate_prefers_block() {
        let archive = open(signed(Schemes::ALL));
        let cert = signing_certificate(&archive).unwrap().unwrap();
        assert_eq!(cert, test_identity().certificate_der());
    }
}
