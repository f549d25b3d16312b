//! Artifact verification.
//!
//! A downloaded installer is trusted only if all of the following hold:
//!
//! 1. the appcast declares a length and the byte count equals it,
//! 2. its digest equals the declared `shaSignature`/`md5Signature`,
//! 3. if signed, the Ed25519 signature verifies under the trusted key
//!    named by the enclosure's key version.
//!
//! An artifact with no usable digest passes step 2 only through a verified
//! signature. A digest that is declared but cannot be checked always fails.
//!
//! Steps 2 and 3 share a single pass over the file: each chunk is fed to
//! the digest and to the streaming signature verifier. The length check
//! runs first and short-circuits, so a truncated download never costs a
//! hash.
//!
//! # Security
//!
//! - Digests are compared in constant time.
//! - Once the [`TrustStore`] holds a key, an unsigned enclosure is rejected
//!   before anything is downloaded.
//! - An unresolvable key version is a configuration error, never a silent
//!   "unsigned" pass.

use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::crypto::{Ed25519StreamVerifier, StreamingVerifier, ED25519_PUBLIC_KEY_LEN};
use crate::error::TrustError;
use crate::manifest::Enclosure;
use crate::trust::{KeyAlgorithm, TrustStore, DEFAULT_KEY_VERSION};

/// Chunk size for the verification pass.
const VERIFY_CHUNK_SIZE: usize = 64 * 1024;

/// Digest algorithm declared by an enclosure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl HashAlgorithm {
    /// Infer the SHA variant from the hex length of a `shaSignature`.
    pub fn from_sha_hex(hex_digest: &str) -> Option<Self> {
        match hex_digest.trim().len() {
            40 => Some(Self::Sha1),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Digest length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Md5 => 16,
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Md5 => "MD5",
        })
    }
}

enum DigestState {
    Sha1(Sha1),
    Sha256(Sha256),
    Md5(Md5),
}

impl DigestState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Md5 => Self::Md5(Md5::new()),
        }
    }

    fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(chunk),
            Self::Sha256(h) => h.update(chunk),
            Self::Md5(h) => h.update(chunk),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Md5(h) => h.finalize().to_vec(),
        }
    }
}

/// A signature as declared by the appcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredSignature {
    pub key_version: String,
    /// Base64-encoded 64-byte Ed25519 signature.
    pub signature: String,
}

/// What the appcast claims about an artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationRequest {
    /// Declared length; `None` fails the length check.
    pub declared_length: Option<u64>,
    /// Declared digest; `None` requires a verified signature instead.
    pub declared_hash: Option<(HashAlgorithm, String)>,
    /// A declared digest no algorithm matches. Always fails the hash check.
    pub malformed_hash: Option<String>,
    pub signature: Option<DeclaredSignature>,
}

impl VerificationRequest {
    /// Collect the trust attributes of an enclosure.
    ///
    /// A SHA digest takes precedence over MD5. A `shaSignature` of
    /// unexpected length is kept as malformed and never falls back to MD5.
    pub fn for_enclosure(enclosure: &Enclosure) -> Self {
        let mut malformed_hash = None;
        let declared_hash = match enclosure.sha_hash.as_deref().map(str::trim) {
            Some(hex_digest) => match HashAlgorithm::from_sha_hex(hex_digest) {
                Some(algorithm) => Some((algorithm, hex_digest.to_string())),
                None => {
                    warn!(len = hex_digest.len(), "shaSignature has unexpected length");
                    malformed_hash = Some(hex_digest.to_string());
                    None
                }
            },
            None => enclosure
                .md5_hash
                .as_deref()
                .map(|hex_digest| (HashAlgorithm::Md5, hex_digest.trim().to_string())),
        };

        let signature = enclosure.ed_signature.as_deref().map(|sig| DeclaredSignature {
            key_version: enclosure
                .ed_key_version
                .clone()
                .unwrap_or_else(|| DEFAULT_KEY_VERSION.to_string()),
            signature: sig.trim().to_string(),
        });

        Self {
            declared_length: enclosure.length,
            declared_hash,
            malformed_hash,
            signature,
        }
    }

    /// Reject, before downloading, a request that can never verify.
    pub fn check_integrity_attributes(&self) -> Result<(), TrustError> {
        if self.declared_length.is_none() {
            return Err(TrustError::MissingLength);
        }
        if let Some(raw) = &self.malformed_hash {
            return Err(TrustError::MalformedDigest(raw.clone()));
        }
        if self.declared_hash.is_none() && self.signature.is_none() {
            return Err(TrustError::MissingIntegrity);
        }
        Ok(())
    }
}

/// Outcome of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationResult {
    pub length_ok: bool,
    pub hash_ok: bool,
    /// `None` when the artifact was not signed.
    pub signature_ok: Option<bool>,
    pub actual_length: u64,
    /// Hex digest of the file, when a digest was computed.
    pub actual_digest: Option<String>,
}

impl VerificationResult {
    /// Overall trust decision.
    pub fn is_trusted(&self) -> bool {
        self.length_ok && self.hash_ok && self.signature_ok.unwrap_or(true)
    }

    /// Turn a failed decision into the most specific [`TrustError`].
    pub fn into_result(self, request: &VerificationRequest) -> Result<(), TrustError> {
        if !self.length_ok {
            return Err(match request.declared_length {
                Some(expected) => TrustError::LengthMismatch {
                    expected,
                    actual: self.actual_length,
                },
                None => TrustError::MissingLength,
            });
        }
        if !self.hash_ok {
            if let Some(raw) = &request.malformed_hash {
                return Err(TrustError::MalformedDigest(raw.clone()));
            }
            return Err(match &request.declared_hash {
                Some((algorithm, expected)) => TrustError::HashMismatch {
                    algorithm: algorithm.to_string(),
                    expected: expected.clone(),
                    actual: self.actual_digest.unwrap_or_default(),
                },
                None if self.signature_ok == Some(false) => TrustError::SignatureInvalid(
                    "signature does not match the downloaded file".to_string(),
                ),
                None => TrustError::MissingIntegrity,
            });
        }
        if self.signature_ok == Some(false) {
            return Err(TrustError::SignatureInvalid(
                "signature does not match the downloaded file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Verifies downloaded artifacts against the trust store.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    trust: Arc<TrustStore>,
}

impl Verifier {
    pub fn new(trust: Arc<TrustStore>) -> Self {
        Self { trust }
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Check, before downloading, that the request can be verified at all.
    ///
    /// Returns the public key to verify with, or `None` for an unsigned
    /// artifact when no keys are configured.
    ///
    /// # Errors
    ///
    /// - [`TrustError::MissingSignature`] if keys are configured but the
    ///   request carries no signature.
    /// - [`TrustError::UnknownKeyVersion`] / [`TrustError::KeyLengthMismatch`]
    ///   if the declared key version does not resolve.
    pub fn check_signature_policy(
        &self,
        request: &VerificationRequest,
    ) -> Result<Option<[u8; ED25519_PUBLIC_KEY_LEN]>, TrustError> {
        match &request.signature {
            None if self.trust.is_empty() => Ok(None),
            None => {
                error!("Enclosure is unsigned but signing keys are configured");
                Err(TrustError::MissingSignature)
            }
            Some(declared) => self
                .trust
                .resolve(&declared.key_version, KeyAlgorithm::Ed25519)
                .map(Some),
        }
    }

    /// Verify a readable artifact.
    ///
    /// Key resolution happens before any byte is read, and the file is
    /// read at most once.
    ///
    /// # Errors
    ///
    /// Returns a [`TrustError`] only for configuration failures
    /// (see [`Self::check_signature_policy`]) and for read failures. A
    /// mismatching file yields `Ok` with a failing [`VerificationResult`].
    pub fn verify<R: Read + Seek>(
        &self,
        mut reader: R,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, TrustError> {
        let public_key = self.check_signature_policy(request)?;

        let actual_length = reader
            .seek(SeekFrom::End(0))
            .map_err(|e| TrustError::Io(e.to_string()))?;
        reader
            .seek(SeekFrom::Start(0))
            .map_err(|e| TrustError::Io(e.to_string()))?;

        let length_ok = match request.declared_length {
            Some(expected) if expected == actual_length => true,
            Some(expected) => {
                error!(expected, actual = actual_length, "Artifact length mismatch");
                false
            }
            None => {
                error!(actual = actual_length, "Enclosure declares no length");
                false
            }
        };
        if !length_ok {
            return Ok(VerificationResult {
                length_ok: false,
                hash_ok: false,
                signature_ok: None,
                actual_length,
                actual_digest: None,
            });
        }

        let mut digest = request
            .declared_hash
            .as_ref()
            .map(|(algorithm, _)| DigestState::new(*algorithm));

        let mut signature_ok = None;
        let mut stream: Option<Box<dyn StreamingVerifier>> = None;
        if let (Some(declared), Some(key)) = (&request.signature, public_key) {
            match STANDARD.decode(&declared.signature) {
                Ok(raw) => match Ed25519StreamVerifier::init(&raw, &key) {
                    Ok(v) => stream = Some(Box::new(v)),
                    Err(e) => {
                        warn!(error = %e, "Cannot start signature verification");
                        signature_ok = Some(false);
                    }
                },
                Err(e) => {
                    warn!(error = %e, "Signature is not valid base64");
                    signature_ok = Some(false);
                }
            }
        }

        if digest.is_some() || stream.is_some() {
            let mut buffer = vec![0u8; VERIFY_CHUNK_SIZE];
            loop {
                let read = reader
                    .read(&mut buffer)
                    .map_err(|e| TrustError::Io(e.to_string()))?;
                if read == 0 {
                    break;
                }
                let chunk = &buffer[..read];
                if let Some(d) = digest.as_mut() {
                    d.update(chunk);
                }
                if let Some(s) = stream.as_mut() {
                    s.update(chunk);
                }
            }
        }

        if let Some(s) = stream {
            signature_ok = Some(s.finalize());
        }

        let (hash_ok, actual_digest) = match (digest, &request.declared_hash) {
            (Some(state), Some((algorithm, expected_hex))) => {
                let actual = state.finalize();
                let ok = match hex::decode(expected_hex) {
                    Ok(expected) if expected.len() == algorithm.digest_len() => {
                        actual.ct_eq(&expected).into()
                    }
                    _ => {
                        warn!(%algorithm, "Declared digest is not valid hex");
                        false
                    }
                };
                (ok, Some(hex::encode(actual)))
            }
            _ if request.malformed_hash.is_some() => (false, None),
            _ => {
                if signature_ok != Some(true) {
                    warn!("Enclosure declares no digest and carries no valid signature");
                }
                (signature_ok == Some(true), None)
            }
        };

        let result = VerificationResult {
            length_ok: true,
            hash_ok,
            signature_ok,
            actual_length,
            actual_digest,
        };

        if result.is_trusted() {
            debug!(
                length = actual_length,
                signed = result.signature_ok.is_some(),
                "Artifact verified"
            );
        } else {
            error!(
                hash_ok = result.hash_ok,
                signature_ok = ?result.signature_ok,
                "Artifact failed verification"
            );
        }
        Ok(result)
    }

    /// Verify a file on disk.
    pub fn verify_file(
        &self,
        path: &Path,
        request: &VerificationRequest,
    ) -> Result<VerificationResult, TrustError> {
        let file = File::open(path).map_err(|e| TrustError::Io(format!("{}: {}", path.display(), e)))?;
        let result = self.verify(file, request)?;
        info!(path = %path.display(), trusted = result.is_trusted(), "Verification complete");
        Ok(result)
    }
}
