//! Signing identity resolution
//!
//! An identity is an RSA private key plus its X.509 certificate, read from a
//! PEM bundle. The managed default lives in `identity.pem` under the engine
//! home directory and is created on first use.

use super::algorithm::SignatureAlgorithm;
use crate::apk::defaults::{
    DEFAULT_HOME_SUBDIR, DEFAULT_IDENTITY_FILE, DEFAULT_IDENTITY_SUBJECT,
    DEFAULT_IDENTITY_VALIDITY_SECS, DEFAULT_KEY_BITS, HOME_ENV,
};
use crate::exceptions::{PatchError, Result};
use der::{Decode, Encode};
use log::{debug, info, warn};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs1v15::SigningKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use x509_cert::Certificate;
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;

fn unavailable(msg: impl Into<String>) -> PatchError {
    PatchError::SigningIdentityUnavailable(msg.into())
}

/// Where the signing identity comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentitySource {
    /// Caller-supplied PEM bundle (private key + certificate)
    Pem(PathBuf),
    /// Engine-managed identity in this directory, created if missing
    ManagedDefault(PathBuf),
}

impl IdentitySource {
    /// `$LSPATCH_HOME`, else `$HOME/.config/lspatch`
    pub fn default_home() -> Result<PathBuf> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            return Ok(PathBuf::from(home));
        }
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(DEFAULT_HOME_SUBDIR))
            .map_err(|_| unavailable(format!("neither {HOME_ENV} nor HOME is set")))
    }

    pub fn resolve(&self) -> Result<SigningIdentity> {
        match self {
            IdentitySource::Pem(path) => {
                debug!("🔑 Loading signing identity from {path:?}");
                let text = fs::read_to_string(path)
                    .map_err(|e| unavailable(format!("failed to read {path:?}: {e}")))?;
                SigningIdentity::from_pem(&text)
            }
            IdentitySource::ManagedDefault(dir) => {
                let path = dir.join(DEFAULT_IDENTITY_FILE);
                if path.exists() {
                    debug!("🔑 Using managed identity {path:?}");
                    let text = fs::read_to_string(&path)
                        .map_err(|e| unavailable(format!("failed to read {path:?}: {e}")))?;
                    return SigningIdentity::from_pem(&text);
                }
                info!("🔑 No managed identity yet, creating {path:?}");
                create_default_identity(dir)
            }
        }
    }
}

/// Regenerate the managed identity in `dir`, replacing any existing one
pub fn reset_default_identity(dir: &Path) -> Result<SigningIdentity> {
    warn!("⚠️ Resetting managed signing identity in {dir:?}");
    create_default_identity(dir)
}

fn create_default_identity(dir: &Path) -> Result<SigningIdentity> {
    let identity = SigningIdentity::generate(DEFAULT_KEY_BITS, DEFAULT_IDENTITY_SUBJECT)?;
    let pem = identity.to_pem()?;

    fs::create_dir_all(dir).map_err(|e| unavailable(format!("cannot create {dir:?}: {e}")))?;
    let path = dir.join(DEFAULT_IDENTITY_FILE);
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| unavailable(format!("cannot write identity in {dir:?}: {e}")))?;
    tmp.write_all(pem.as_bytes())?;
    tmp.persist(&path)
        .map_err(|e| unavailable(format!("cannot persist {path:?}: {}", e.error)))?;
    info!("✅ Created signing identity {}", &identity.fingerprint()[..16]);
    Ok(identity)
}

/// Certificate plus matching private key
#[derive(Clone)]
pub struct SigningIdentity {
    key: RsaPrivateKey,
    certificate: Certificate,
    certificate_der: Vec<u8>,
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("key_bits", &self.key_bits())
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

impl SigningIdentity {
    /// Parse a PEM bundle holding a PKCS#8 or PKCS#1 RSA key and a certificate
    pub fn from_pem(text: &str) -> Result<Self> {
        let blocks = pem::parse_many(text)
            .map_err(|e| unavailable(format!("failed to parse PEM: {e}")))?;

        let mut key = None;
        let mut certificate_der = None;
        for block in &blocks {
            match block.tag() {
                "PRIVATE KEY" => {
                    key = Some(
                        RsaPrivateKey::from_pkcs8_der(block.contents())
                            .map_err(|e| unavailable(format!("invalid PKCS#8 key: {e}")))?,
                    );
                }
                "RSA PRIVATE KEY" => {
                    key = Some(
                        RsaPrivateKey::from_pkcs1_der(block.contents())
                            .map_err(|e| unavailable(format!("invalid PKCS#1 key: {e}")))?,
                    );
                }
                // First certificate is the signer; chain certificates follow
                "CERTIFICATE" if certificate_der.is_none() => {
                    certificate_der = Some(block.contents().to_vec());
                }
                other => debug!("Skipping PEM block {other}"),
            }
        }

        let key = key.ok_or_else(|| unavailable("PEM bundle has no private key"))?;
        let certificate_der =
            certificate_der.ok_or_else(|| unavailable("PEM bundle has no certificate"))?;
        Self::from_parts(key, certificate_der)
    }

    fn from_parts(key: RsaPrivateKey, certificate_der: Vec<u8>) -> Result<Self> {
        let certificate = Certificate::from_der(&certificate_der)?;
        let spki = certificate.tbs_certificate.subject_public_key_info.to_der()?;
        let cert_key = RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| unavailable(format!("certificate key is not RSA: {e}")))?;
        if cert_key != key.to_public_key() {
            return Err(unavailable("private key does not match certificate"));
        }
        Ok(SigningIdentity {
            key,
            certificate,
            certificate_der,
        })
    }

    /// Fresh self-signed identity
    pub fn generate(bits: usize, subject: &str) -> Result<Self> {
        debug!("🔑 Generating RSA-{bits} identity for {subject}");
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)?;

        let mut serial = [0u8; 16];
        rand::RngCore::fill_bytes(&mut rng, &mut serial);
        // Positive and without a leading zero octet
        serial[0] = (serial[0] & 0x7f) | 0x01;

        let subject =
            Name::from_str(subject).map_err(|e| unavailable(format!("bad subject: {e}")))?;
        let validity = Validity::from_now(Duration::from_secs(DEFAULT_IDENTITY_VALIDITY_SECS))?;
        let spki = SubjectPublicKeyInfoOwned::from_key(key.to_public_key())
            .map_err(|e| unavailable(format!("cannot encode public key: {e}")))?;

        let signer = SigningKey::<Sha256>::new(key.clone());
        let certificate = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::new(&serial)?,
            validity,
            subject,
            spki,
            &signer,
        )
        .and_then(|builder| builder.build::<rsa::pkcs1v15::Signature>())
        .map_err(|e| unavailable(format!("cannot build certificate: {e}")))?;

        let certificate_der = certificate.to_der()?;
        Ok(SigningIdentity {
            key,
            certificate,
            certificate_der,
        })
    }

    /// PEM bundle: PKCS#8 key followed by the certificate
    pub fn to_pem(&self) -> Result<String> {
        let key_der = self
            .key
            .to_pkcs8_der()
            .map_err(|e| unavailable(format!("cannot encode private key: {e}")))?;
        let blocks = [
            pem::Pem::new("PRIVATE KEY", key_der.as_bytes().to_vec()),
            pem::Pem::new("CERTIFICATE", self.certificate_der.clone()),
        ];
        Ok(pem::encode_many(&blocks))
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// DER SubjectPublicKeyInfo
    pub fn public_key_der(&self) -> Result<Vec<u8>> {
        Ok(self.certificate.tbs_certificate.subject_public_key_info.to_der()?)
    }

    pub fn key_bits(&self) -> usize {
        self.key.size() * 8
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::for_key_bits(self.key_bits())
    }

    /// Sign with PKCS#1 v1.5 using the digest of `algorithm`
    pub fn sign(&self, algorithm: SignatureAlgorithm, data: &[u8]) -> Result<Vec<u8>> {
        let signature = match algorithm {
            SignatureAlgorithm::RsaPkcs1Sha256 => SigningKey::<Sha256>::new(self.key.clone())
                .try_sign(data)
                .map(|s| s.to_vec()),
            SignatureAlgorithm::RsaPkcs1Sha512 => SigningKey::<Sha512>::new(self.key.clone())
                .try_sign(data)
                .map(|s| s.to_vec()),
        };
        signature.map_err(|e| unavailable(format!("signing failed: {e}")))
    }

    /// Hex SHA-256 of the DER certificate
    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(&self.certificate_der))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) const TEST_IDENTITY_PEM: &str = include_str!("testdata/identity.pem");

    pub(crate) fn test_identity() -> SigningIdentity {
        SigningIdentity::from_pem(TEST_IDENTITY_PEM).unwrap()
    }

    #[test]
    fn test_load_fixture_identity() {
        let identity = test_identity();
        assert_eq!(identity.key_bits(), 2048);
        assert_eq!(
            identity.signature_algorithm(),
            SignatureAlgorithm::RsaPkcs1Sha256
        );
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = test_identity();
        let spki = identity.public_key_der().unwrap();
        for alg in [
            SignatureAlgorithm::RsaPkcs1Sha256,
            SignatureAlgorithm::RsaPkcs1Sha512,
        ] {
            let sig = identity.sign(alg, b"payload").unwrap();
            assert!(alg.verify(&spki, b"payload", &sig));
            assert!(!alg.verify(&spki, b"tampered", &sig));
        }
    }

    #[test]
    fn test_pem_missing_certificate() {
        let key_only: String = TEST_IDENTITY_PEM
            .split("-----BEGIN CERTIFICATE-----")
            .next()
            .unwrap()
            .to_string();
        let err = SigningIdentity::from_pem(&key_only).unwrap_err();
        assert!(matches!(err, PatchError::SigningIdentityUnavailable(_)));
    }

    #[test]
    fn test_pem_source_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = IdentitySource::Pem(dir.path().join("nope.pem"))
            .resolve()
            .unwrap_err();
        assert!(matches!(err, PatchError::SigningIdentityUnavailable(_)));
    }

    #[test]
    fn test_managed_default_created_once_and_reset() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("home");
        let source = IdentitySource::ManagedDefault(home.clone());

        let first = source.resolve().unwrap();
        assert!(home.join(DEFAULT_IDENTITY_FILE).exists());
        let again = source.resolve().unwrap();
        assert_eq!(first.fingerprint(), again.fingerprint());

        let reset = reset_default_identity(&home).unwrap();
        assert_ne!(reset.fingerprint(), first.fingerprint());
        assert_eq!(source.resolve().unwrap().fingerprint(), reset.fingerprint());
    }

    #[test]
    fn test_generated_identity_round_trips_through_pem() {
        let identity = SigningIdentity::generate(1024, "CN=Roundtrip").unwrap();
        let reloaded = SigningIdentity::from_pem(&identity.to_pem().unwrap()).unwrap();
        assert_eq!(identity.fingerprint(), reloaded.fingerprint());
        assert_eq!(reloaded.key_bits(), 1024);
    }
}
