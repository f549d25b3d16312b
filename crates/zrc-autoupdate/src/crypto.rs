//! Ed25519 signing and streaming verification.
//!
//! Plain Ed25519 verification only needs the message once: the challenge
//! scalar is `SHA-512(R || A || M)`, so it can be absorbed chunk by chunk
//! while the artifact is hashed. [`Ed25519StreamVerifier`] does exactly
//! that and checks `[s]B == R + [k]A` at the end. The curve arithmetic
//! itself comes from `curve25519-dalek`.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use sha2::{Digest, Sha512};

use crate::error::TrustError;

/// Length of an Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature in bytes.
pub const ED25519_SIGNATURE_LEN: usize = 64;

/// Produces detached signatures. Used by release tooling and tests.
pub trait CryptoSigner {
    /// Sign `message` with the 32-byte secret seed `key`.
    fn sign(&self, message: &[u8], key: &[u8; 32]) -> [u8; ED25519_SIGNATURE_LEN];
}

/// Incremental signature check: `init` (the constructor), then `update`
/// any number of times, then `finalize`.
pub trait StreamingVerifier: Send {
    /// Absorb the next chunk of the signed message.
    fn update(&mut self, chunk: &[u8]);

    /// Consume the verifier and report whether the signature holds.
    fn finalize(self: Box<Self>) -> bool;
}

/// Ed25519 signer backed by `ed25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Ed25519Signer;

impl CryptoSigner for Ed25519Signer {
    fn sign(&self, message: &[u8], key: &[u8; 32]) -> [u8; ED25519_SIGNATURE_LEN] {
        SigningKey::from_bytes(key).sign(message).to_bytes()
    }
}

/// Derive the public key that matches a 32-byte secret seed.
pub fn public_key_for(secret: &[u8; 32]) -> [u8; ED25519_PUBLIC_KEY_LEN] {
    SigningKey::from_bytes(secret).verifying_key().to_bytes()
}

/// Streaming Ed25519 verifier.
pub struct Ed25519StreamVerifier {
    hasher: Sha512,
    expected_r: CompressedEdwardsY,
    s: Scalar,
    minus_a: EdwardsPoint,
}

impl Ed25519StreamVerifier {
    /// Start verifying `signature` (64 raw bytes) against `public_key`.
    ///
    /// Fails early when the signature or the key cannot be decoded, so a
    /// malformed signature never costs a pass over the file.
    pub fn init(
        signature: &[u8],
        public_key: &[u8; ED25519_PUBLIC_KEY_LEN],
    ) -> Result<Self, TrustError> {
        let signature = Signature::from_slice(signature)
            .map_err(|e| TrustError::SignatureInvalid(format!("malformed signature: {}", e)))?;
        let key = VerifyingKey::from_bytes(public_key)
            .map_err(|e| TrustError::SignatureInvalid(format!("malformed public key: {}", e)))?;

        let a = CompressedEdwardsY(key.to_bytes())
            .decompress()
            .ok_or_else(|| TrustError::SignatureInvalid("public key is not a curve point".into()))?;
        let s: Option<Scalar> = Scalar::from_canonical_bytes(*signature.s_bytes()).into();
        let s = s.ok_or_else(|| {
            TrustError::SignatureInvalid("signature scalar is not canonical".into())
        })?;
        let expected_r = CompressedEdwardsY(*signature.r_bytes());

        let mut hasher = Sha512::new();
        hasher.update(expected_r.as_bytes());
        hasher.update(key.as_bytes());

        Ok(Self {
            hasher,
            expected_r,
            s,
            minus_a: -a,
        })
    }
}

impl StreamingVerifier for Ed25519StreamVerifier {
    fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    fn finalize(self: Box<Self>) -> bool {
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&self.hasher.finalize());
        let k = Scalar::from_bytes_mod_order_wide(&wide);

        // R' = [s]B - [k]A
        let r = EdwardsPoint::vartime_double_scalar_mul_basepoint(&k, &self.minus_a, &self.s);
        r.compress() == self.expected_r
    }
}
