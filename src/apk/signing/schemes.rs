//! APK Signature Scheme v2 and v3 signer blocks
//!
//! Both schemes sign the same chunked content digest and share one signer
//! layout; v3 adds an SDK range around the signatures and drops the
//! stripping-protection attribute.

use super::algorithm::SignatureAlgorithm;
use super::block::{LpReader, lp_sequence, put_lp};
use super::identity::SigningIdentity;
use crate::apk::constants::{
    APK_SIGNATURE_SCHEME_V2_BLOCK_ID, APK_SIGNATURE_SCHEME_V3_BLOCK_ID, SCHEME_ID_V2,
    SCHEME_ID_V3, STRIPPING_PROTECTION_ATTR_ID,
};
use crate::apk::defaults::{V3_MAX_SDK, V3_MIN_SDK};
use crate::exceptions::{PatchError, Result};
use log::{debug, trace};
use std::fmt;

/// Whole-file signature schemes carried in the signing block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockScheme {
    V2,
    V3,
}

impl BlockScheme {
    pub fn block_id(self) -> u32 {
        match self {
            BlockScheme::V2 => APK_SIGNATURE_SCHEME_V2_BLOCK_ID,
            BlockScheme::V3 => APK_SIGNATURE_SCHEME_V3_BLOCK_ID,
        }
    }

    pub fn scheme_id(self) -> u32 {
        match self {
            BlockScheme::V2 => SCHEME_ID_V2,
            BlockScheme::V3 => SCHEME_ID_V3,
        }
    }
}

impl fmt::Display for BlockScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.scheme_id())
    }
}

/// Build the id-value pair content for `scheme`
///
/// `content_digest` must come from `identity.signature_algorithm()`.
/// `protect_v3` adds the stripping-protection attribute to a v2 signer.
pub fn build_scheme_block(
    scheme: BlockScheme,
    identity: &SigningIdentity,
    content_digest: &[u8],
    protect_v3: bool,
) -> Result<Vec<u8>> {
    let algorithm = identity.signature_algorithm();

    let mut digest_record = Vec::new();
    digest_record.extend_from_slice(&algorithm.id().to_le_bytes());
    put_lp(&mut digest_record, content_digest);
    let digests = lp_sequence([digest_record]);
    let certificates = lp_sequence([identity.certificate_der()]);

    let attributes = if scheme == BlockScheme::V2 && protect_v3 {
        let mut attr = Vec::new();
        attr.extend_from_slice(&STRIPPING_PROTECTION_ATTR_ID.to_le_bytes());
        attr.extend_from_slice(&SCHEME_ID_V3.to_le_bytes());
        lp_sequence([attr])
    } else {
        Vec::new()
    };

    let mut signed_data = Vec::new();
    put_lp(&mut signed_data, &digests);
    put_lp(&mut signed_data, &certificates);
    match scheme {
        BlockScheme::V2 => {
            put_lp(&mut signed_data, &attributes);
            // additional attributes, unused
            put_lp(&mut signed_data, &[]);
        }
        BlockScheme::V3 => {
            signed_data.extend_from_slice(&V3_MIN_SDK.to_le_bytes());
            signed_data.extend_from_slice(&V3_MAX_SDK.to_le_bytes());
            put_lp(&mut signed_data, &attributes);
        }
    }

    let signature = identity.sign(algorithm, &signed_data)?;
    let mut signature_record = Vec::new();
    signature_record.extend_from_slice(&algorithm.id().to_le_bytes());
    put_lp(&mut signature_record, &signature);
    let signatures = lp_sequence([signature_record]);

    let mut signer = Vec::new();
    put_lp(&mut signer, &signed_data);
    if scheme == BlockScheme::V3 {
        signer.extend_from_slice(&V3_MIN_SDK.to_le_bytes());
        signer.extend_from_slice(&V3_MAX_SDK.to_le_bytes());
    }
    put_lp(&mut signer, &signatures);
    put_lp(&mut signer, &identity.public_key_der()?);

    debug!("✍️ {} signer built with {}", scheme, algorithm);
    Ok(lp_sequence([lp_sequence([signer])]))
}

/// One decoded signer of a v2/v3 block
#[derive(Debug, Clone)]
pub struct SchemeSigner {
    pub signed_data: Vec<u8>,
    pub digests: Vec<(u32, Vec<u8>)>,
    pub certificates: Vec<Vec<u8>>,
    pub attributes: Vec<(u32, Vec<u8>)>,
    pub sdk_range: Option<(u32, u32)>,
    pub signatures: Vec<(u32, Vec<u8>)>,
    pub public_key: Vec<u8>,
}

impl SchemeSigner {
    /// Whether this v2 signer declares that a v3 signature must also exist
    pub fn requires_v3(&self) -> bool {
        self.attributes.iter().any(|(id, value)| {
            *id == STRIPPING_PROTECTION_ATTR_ID
                && value.get(..4) == Some(&SCHEME_ID_V3.to_le_bytes()[..])
        })
    }
}

fn id_value(item: &[u8]) -> Result<(u32, Vec<u8>)> {
    let mut reader = LpReader::new(item);
    let id = reader.read_u32()?;
    Ok((id, reader.read_lp()?.to_vec()))
}

fn id_raw(item: &[u8]) -> Result<(u32, Vec<u8>)> {
    let mut reader = LpReader::new(item);
    let id = reader.read_u32()?;
    Ok((id, item[4..].to_vec()))
}

/// Decode every signer in a scheme block value
pub fn parse_signers(scheme: BlockScheme, value: &[u8]) -> Result<Vec<SchemeSigner>> {
    let mut outer = LpReader::new(value);
    let signers = LpReader::new(outer.read_lp()?).read_all()?;
    if signers.is_empty() {
        return Err(PatchError::CorruptArchive(format!("{scheme} block has no signers")));
    }

    signers
        .into_iter()
        .map(|raw| {
            let mut reader = LpReader::new(raw);
            let signed_data = reader.read_lp()?;
            let sdk_range = match scheme {
                BlockScheme::V2 => None,
                BlockScheme::V3 => Some((reader.read_u32()?, reader.read_u32()?)),
            };
            let signatures = LpReader::new(reader.read_lp()?)
                .read_all()?
                .into_iter()
                .map(id_value)
                .collect::<Result<Vec<_>>>()?;
            let public_key = reader.read_lp()?.to_vec();

            let mut data = LpReader::new(signed_data);
            let digests = LpReader::new(data.read_lp()?)
                .read_all()?
                .into_iter()
                .map(id_value)
                .collect::<Result<Vec<_>>>()?;
            let certificates = LpReader::new(data.read_lp()?)
                .read_all()?
                .into_iter()
                .map(<[u8]>::to_vec)
                .collect();
            if scheme == BlockScheme::V3 {
                let inner = (data.read_u32()?, data.read_u32()?);
                if Some(inner) != sdk_range {
                    return Err(PatchError::CorruptArchive(
                        "v3 signer SDK range differs from signed data".to_string(),
                    ));
                }
            }
            let attributes = LpReader::new(data.read_lp()?)
                .read_all()?
                .into_iter()
                .map(id_raw)
                .collect::<Result<Vec<_>>>()?;

            Ok(SchemeSigner {
                signed_data: signed_data.to_vec(),
                digests,
                certificates,
                attributes,
                sdk_range,
                signatures,
                public_key,
            })
        })
        .collect()
}

/// Verify one signer against the three signed regions
///
/// Returns a description of the first problem found.
pub fn verify_signer(signer: &SchemeSigner, regions: &[&[u8]]) -> std::result::Result<(), String> {
    let (algorithm, signature) = signer
        .signatures
        .iter()
        .filter_map(|(id, sig)| SignatureAlgorithm::from_id(*id).map(|alg| (alg, sig)))
        .max_by_key(|(alg, _)| alg.id())
        .ok_or("no supported signature algorithm")?;

    if !algorithm.verify(&signer.public_key, &signer.signed_data, signature) {
        return Err(format!("{algorithm} signature does not verify"));
    }

    let digest = signer
        .digests
        .iter()
        .find(|(id, _)| *id == algorithm.id())
        .map(|(_, d)| d)
        .ok_or("signed data lacks a digest for the signature algorithm")?;
    let actual = algorithm.content_digest(regions);
    trace!("  digest expected={} actual={}", hex::encode(digest), hex::encode(&actual));
    if *digest != actual {
        return Err("content digest mismatch".to_string());
    }

    let certificate = signer.certificates.first().ok_or("no certificates")?;
    let spki = certificate_public_key(certificate).ok_or("unparsable certificate")?;
    if spki != signer.public_key {
        return Err("certificate key differs from signer key".to_string());
    }
    Ok(())
}

fn certificate_public_key(certificate_der: &[u8]) -> Option<Vec<u8>> {
    use der::{Decode, Encode};
    let certificate = x509_cert::Certificate::from_der(certificate_der).ok()?;
    certificate
        .tbs_certificate
        .subject_public_key_info
        .to_der()
        .ok()
}
