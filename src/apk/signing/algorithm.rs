//! Signature algorithms and the chunked content digest shared by v2 and v3

use crate::apk::constants::{
    CHUNK_PREFIX, CONTENT_DIGEST_CHUNK_SIZE, SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA256,
    SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA512, TOP_LEVEL_PREFIX,
};
use crate::apk::defaults::SHA512_KEY_THRESHOLD_BITS;
use rsa::RsaPublicKey;
use rsa::pkcs1v15::{Signature, VerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;

/// RSA PKCS#1 v1.5 variants used for block signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaPkcs1Sha256,
    RsaPkcs1Sha512,
}

impl SignatureAlgorithm {
    /// Algorithm apksigner picks for an RSA key of `bits`
    pub fn for_key_bits(bits: usize) -> Self {
        if bits <= SHA512_KEY_THRESHOLD_BITS {
            SignatureAlgorithm::RsaPkcs1Sha256
        } else {
            SignatureAlgorithm::RsaPkcs1Sha512
        }
    }

    pub fn id(self) -> u32 {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA256,
            SignatureAlgorithm::RsaPkcs1Sha512 => SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA512,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA256 => Some(SignatureAlgorithm::RsaPkcs1Sha256),
            SIGNATURE_RSA_PKCS1_V1_5_WITH_SHA512 => Some(SignatureAlgorithm::RsaPkcs1Sha512),
            _ => None,
        }
    }

    /// Chunked digest over the three signed regions
    pub fn content_digest(self, regions: &[&[u8]]) -> Vec<u8> {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => chunked_digest::<Sha256>(regions),
            SignatureAlgorithm::RsaPkcs1Sha512 => chunked_digest::<Sha512>(regions),
        }
    }

    /// Verify `signature` over `data` with a DER SubjectPublicKeyInfo
    pub fn verify(self, public_key_der: &[u8], data: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = RsaPublicKey::from_public_key_der(public_key_der) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(signature) else {
            return false;
        };
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => VerifyingKey::<Sha256>::new(key)
                .verify(data, &signature)
                .is_ok(),
            SignatureAlgorithm::RsaPkcs1Sha512 => VerifyingKey::<Sha512>::new(key)
                .verify(data, &signature)
                .is_ok(),
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureAlgorithm::RsaPkcs1Sha256 => f.write_str("RSA-PKCS1-SHA256"),
            SignatureAlgorithm::RsaPkcs1Sha512 => f.write_str("RSA-PKCS1-SHA512"),
        }
    }
}

/// `H(0x5a || count || H(0xa5 || len || chunk)...)` over 1 MiB chunks
fn chunked_digest<D: Digest>(regions: &[&[u8]]) -> Vec<u8> {
    let chunks: Vec<&[u8]> = regions
        .iter()
        .flat_map(|region| region.chunks(CONTENT_DIGEST_CHUNK_SIZE))
        .collect();

    let mut top = D::new();
    top.update([TOP_LEVEL_PREFIX]);
    top.update((chunks.len() as u32).to_le_bytes());
    for chunk in chunks {
        let mut hasher = D::new();
        hasher.update([CHUNK_PREFIX]);
        hasher.update((chunk.len() as u32).to_le_bytes());
        hasher.update(chunk);
        top.update(hasher.finalize());
    }
    top.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_for_key_size() {
        assert_eq!(
            SignatureAlgorithm::for_key_bits(2048),
            SignatureAlgorithm::RsaPkcs1Sha256
        );
        assert_eq!(
            SignatureAlgorithm::for_key_bits(3072),
            SignatureAlgorithm::RsaPkcs1Sha256
        );
        assert_eq!(
            SignatureAlgorithm::for_key_bits(4096),
            SignatureAlgorithm::RsaPkcs1Sha512
        );
        assert_eq!(SignatureAlgorithm::from_id(0x0103), Some(SignatureAlgorithm::RsaPkcs1Sha256));
        assert_eq!(SignatureAlgorithm::from_id(0x0201), None);
    }

    #[test]
    fn test_chunked_digest_structure() {
        let region = vec![7u8; CONTENT_DIGEST_CHUNK_SIZE + 10];
        let digest = SignatureAlgorithm::RsaPkcs1Sha256.content_digest(&[&region, b"cd", b"eocd"]);

        let chunk = |data: &[u8]| {
            let mut h = Sha256::new();
            h.update([0xa5]);
            h.update((data.len() as u32).to_le_bytes());
            h.update(data);
            h.finalize()
        };
        let mut top = Sha256::new();
        top.update([0x5a]);
        top.update(4u32.to_le_bytes());
        top.update(chunk(&region[..CONTENT_DIGEST_CHUNK_SIZE]));
        top.update(chunk(&region[CONTENT_DIGEST_CHUNK_SIZE..]));
        top.update(chunk(b"cd"));
        top.update(chunk(b"eocd"));
        assert_eq!(digest, top.finalize().to_vec());
    }

    #[test]
    fn test_empty_region_contributes_no_chunk() {
        let with_empty = SignatureAlgorithm::RsaPkcs1Sha512.content_digest(&[b"a", b"", b"b"]);
        let without = SignatureAlgorithm::RsaPkcs1Sha512.content_digest(&[b"a", b"b"]);
        assert_eq!(with_empty, without);
        assert_eq!(with_empty.len(), 64);
    }
}
