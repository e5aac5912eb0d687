//! JAR (v1) signing: MANIFEST.MF, LSPATCH.SF and a detached PKCS#7 block

use super::identity::SigningIdentity;
use super::algorithm::SignatureAlgorithm;
use crate::apk::defaults::{V1_CREATED_BY, V1_SIGNER_NAME};
use crate::apk::zip::{Compression, StagedArchive};
use crate::exceptions::{PatchError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{
    CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
    SignerInfos,
};
use der::asn1::{OctetString, SetOfVec};
use der::oid::ObjectIdentifier;
use der::{Any, Decode, Encode};
use log::{debug, trace};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;
use x509_cert::spki::AlgorithmIdentifierOwned;

pub const MANIFEST_NAME: &str = "META-INF/MANIFEST.MF";

pub const OID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");
pub const OID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
pub const OID_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.1");
pub const OID_SHA512: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.16.840.1.101.3.4.2.3");
pub const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
pub const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
pub const OID_SHA512_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

// Content bytes per physical line, excluding CRLF
const MAX_LINE: usize = 70;

fn signature_file_name() -> String {
    format!("META-INF/{V1_SIGNER_NAME}.SF")
}

fn signature_block_name() -> String {
    format!("META-INF/{V1_SIGNER_NAME}.RSA")
}

/// Whether `name` is JAR signature metadata that a new signature replaces
pub fn is_signature_file(name: &str) -> bool {
    let Some(file) = name.strip_prefix("META-INF/") else {
        return false;
    };
    if file.contains('/') {
        return false;
    }
    let upper = file.to_ascii_uppercase();
    upper == "MANIFEST.MF"
        || upper.starts_with("SIG-")
        || [".SF", ".RSA", ".DSA", ".EC"]
            .iter()
            .any(|ext| upper.ends_with(ext))
}

/// Drop existing signature files, returning their names
pub fn strip_signature_files(staged: &mut StagedArchive) -> Vec<String> {
    let removed = staged.retain(|entry| !is_signature_file(&entry.name));
    for name in &removed {
        debug!("🗑️ Dropped old signature file {name}");
    }
    removed
}

/// Add MANIFEST.MF, the signature file and the PKCS#7 block to `staged`
///
/// `block_schemes` are the v2+ scheme ids that will follow, advertised in
/// `X-Android-APK-Signed` so stripping them is detectable.
pub fn sign(
    staged: &mut StagedArchive,
    identity: &SigningIdentity,
    block_schemes: &[u32],
) -> Result<()> {
    strip_signature_files(staged);

    let mut names: Vec<String> = staged
        .entries()
        .iter()
        .filter(|e| !e.is_directory())
        .map(|e| e.name.clone())
        .collect();
    names.sort();

    let mut digests = Vec::with_capacity(names.len());
    for name in names {
        let content = staged.read_entry(&name)?;
        digests.push((name, BASE64.encode(Sha256::digest(&content))));
    }

    let (manifest, sections) = build_manifest(&digests);
    let apk_signed = block_schemes
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    let signature_file = build_signature_file(&manifest, &sections, &apk_signed);
    let block = build_pkcs7(identity, &signature_file)?;

    staged.put(MANIFEST_NAME, &manifest, Compression::Deflated)?;
    staged.put(&signature_file_name(), &signature_file, Compression::Deflated)?;
    staged.put(&signature_block_name(), &block, Compression::Deflated)?;
    debug!("✍️ v1 signed {} entries", sections.len());
    Ok(())
}

/// Write `name: value` wrapped to 72-byte lines
fn write_attribute(out: &mut Vec<u8>, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let mut rest = line.as_bytes();
    let mut limit = MAX_LINE;
    loop {
        let take = rest.len().min(limit);
        out.extend_from_slice(&rest[..take]);
        out.extend_from_slice(b"\r\n");
        rest = &rest[take..];
        if rest.is_empty() {
            break;
        }
        out.push(b' ');
        limit = MAX_LINE - 1;
    }
}

/// MANIFEST.MF plus each per-entry section's exact bytes
fn build_manifest(digests: &[(String, String)]) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
    let mut out = Vec::new();
    write_attribute(&mut out, "Manifest-Version", "1.0");
    write_attribute(&mut out, "Created-By", V1_CREATED_BY);
    out.extend_from_slice(b"\r\n");

    let mut sections = Vec::with_capacity(digests.len());
    for (name, digest) in digests {
        let mut section = Vec::new();
        write_attribute(&mut section, "Name", name);
        write_attribute(&mut section, "SHA-256-Digest", digest);
        section.extend_from_slice(b"\r\n");
        out.extend_from_slice(&section);
        sections.push((name.clone(), section));
    }
    (out, sections)
}

fn build_signature_file(manifest: &[u8], sections: &[(String, Vec<u8>)], apk_signed: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_attribute(&mut out, "Signature-Version", "1.0");
    write_attribute(&mut out, "Created-By", V1_CREATED_BY);
    write_attribute(
        &mut out,
        "SHA-256-Digest-Manifest",
        &BASE64.encode(Sha256::digest(manifest)),
    );
    if !apk_signed.is_empty() {
        write_attribute(&mut out, "X-Android-APK-Signed", apk_signed);
    }
    out.extend_from_slice(b"\r\n");

    for (name, section) in sections {
        write_attribute(&mut out, "Name", name);
        write_attribute(&mut out, "SHA-256-Digest", &BASE64.encode(Sha256::digest(section)));
        out.extend_from_slice(b"\r\n");
    }
    out
}

fn algorithm(oid: ObjectIdentifier) -> AlgorithmIdentifierOwned {
    AlgorithmIdentifierOwned {
        oid,
        parameters: Some(Any::null()),
    }
}

/// Detached SignedData over `signature_file`, without signed attributes
fn build_pkcs7(identity: &SigningIdentity, signature_file: &[u8]) -> Result<Vec<u8>> {
    let certificate = identity.certificate().clone();
    let signature = identity.sign(SignatureAlgorithm::RsaPkcs1Sha256, signature_file)?;

    let signer_info = SignerInfo {
        version: CmsVersion::V1,
        sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
            issuer: certificate.tbs_certificate.issuer.clone(),
            serial_number: certificate.tbs_certificate.serial_number.clone(),
        }),
        digest_alg: algorithm(OID_SHA256),
        signed_attrs: None,
        signature_algorithm: algorithm(OID_RSA_ENCRYPTION),
        signature: OctetString::new(signature)?,
        unsigned_attrs: None,
    };

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::try_from(vec![algorithm(OID_SHA256)])?,
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: OID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(SetOfVec::try_from(vec![
            CertificateChoices::Certificate(certificate),
        ])?)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::try_from(vec![signer_info])?),
    };

    let content_info = ContentInfo {
        content_type: OID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)?,
    };
    Ok(content_info.to_der()?)
}

/// Parsed detached PKCS#7 signature block
#[derive(Debug, Clone)]
pub struct SignatureBlock {
    pub certificate: Certificate,
    pub certificate_der: Vec<u8>,
    pub digest_algorithm: ObjectIdentifier,
    pub signature_algorithm: ObjectIdentifier,
    pub signature: Vec<u8>,
}

impl SignatureBlock {
    pub fn parse(der_bytes: &[u8]) -> Result<Self> {
        let corrupt = |what: &str| PatchError::CorruptArchive(format!("v1 signature block: {what}"));
        let content_info = ContentInfo::from_der(der_bytes)
            .map_err(|e| corrupt(&e.to_string()))?;
        if content_info.content_type != OID_SIGNED_DATA {
            return Err(corrupt("not SignedData"));
        }
        let signed_data: SignedData = content_info
            .content
            .decode_as()
            .map_err(|e| corrupt(&e.to_string()))?;
        let signer = signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or_else(|| corrupt("no signer"))?;

        let certificates = signed_data
            .certificates
            .as_ref()
            .map(|set| set.0.iter().collect::<Vec<_>>())
            .unwrap_or_default();
        let certificate = certificates
            .into_iter()
            .find_map(|choice| match choice {
                CertificateChoices::Certificate(cert) => match &signer.sid {
                    SignerIdentifier::IssuerAndSerialNumber(id)
                        if id.serial_number != cert.tbs_certificate.serial_number =>
                    {
                        None
                    }
                    _ => Some(cert.clone()),
                },
                _ => None,
            })
            .ok_or_else(|| corrupt("signer certificate missing"))?;
        let certificate_der = certificate.to_der()?;

        Ok(SignatureBlock {
            certificate,
            certificate_der,
            digest_algorithm: signer.digest_alg.oid,
            signature_algorithm: signer.signature_algorithm.oid,
            signature: signer.signature.as_bytes().to_vec(),
        })
    }

    /// Verify the signature over `signature_file` when no signed attributes
    /// are present
    pub fn verify(&self, signature_file: &[u8]) -> Result<bool> {
        let uses = |digest: ObjectIdentifier, combined: ObjectIdentifier| {
            self.digest_algorithm == digest || self.signature_algorithm == combined
        };
        let algorithm = if uses(OID_SHA512, OID_SHA512_WITH_RSA) {
            SignatureAlgorithm::RsaPkcs1Sha512
        } else if uses(OID_SHA256, OID_SHA256_WITH_RSA) {
            SignatureAlgorithm::RsaPkcs1Sha256
        } else {
            return Ok(false);
        };
        let spki = self
            .certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()?;
        Ok(algorithm.verify(&spki, signature_file, &self.signature))
    }
}

/// One `Name:` section (or the main section) of a JAR manifest
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSection {
    pub attributes: Vec<(String, String)>,
}

impl ManifestSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Parse manifest or signature-file text: main section first
pub fn parse_manifest(bytes: &[u8]) -> Vec<ManifestSection> {
    let mut logical: Vec<Vec<u8>> = Vec::new();
    for line in bytes.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let continuation =
            line.first() == Some(&b' ') && logical.last().is_some_and(|l| !l.is_empty());
        match logical.last_mut() {
            Some(last) if continuation => last.extend_from_slice(&line[1..]),
            _ => logical.push(line.to_vec()),
        }
    }

    let mut sections = vec![ManifestSection::default()];
    let mut fresh = false;
    for line in logical {
        if line.is_empty() {
            fresh = true;
            continue;
        }
        if fresh {
            sections.push(ManifestSection::default());
            fresh = false;
        }
        let text = String::from_utf8_lossy(&line);
        if let Some((key, value)) = text.split_once(": ") {
            if let Some(section) = sections.last_mut() {
                section.attributes.push((key.to_string(), value.to_string()));
            }
        } else {
            trace!("Ignoring manifest line {text:?}");
        }
    }
    sections
}
