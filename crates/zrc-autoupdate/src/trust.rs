//! Registry of trusted, versioned public keys.
//!
//! Keys are registered once at startup and only read afterwards. Each key
//! is addressed by a key-version string so that the signing key can be
//! rotated: an appcast names the version it was signed with and the
//! verifier looks it up here.
//!
//! A non-empty store switches the updater into "signing is mandatory"
//! mode: unsigned enclosures are rejected outright.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tracing::{debug, warn};

use crate::crypto::ED25519_PUBLIC_KEY_LEN;
use crate::error::{ConfigError, TrustError};

/// Key version assumed when an enclosure does not name one.
pub const DEFAULT_KEY_VERSION: &str = "1";

/// Signature algorithm of a trusted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Ed25519,
}

impl KeyAlgorithm {
    /// Required public key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            Self::Ed25519 => ED25519_PUBLIC_KEY_LEN,
        }
    }
}

/// A single registered key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKey {
    pub key_version: String,
    pub algorithm: KeyAlgorithm,
    pub public_key: Vec<u8>,
}

/// Versioned public keys used to validate enclosure signatures.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    keys: BTreeMap<String, TrustedKey>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from `"<version>:<base64>"` entries.
    ///
    /// An entry without a `version:` prefix is registered under
    /// [`DEFAULT_KEY_VERSION`].
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, ConfigError> {
        let mut store = Self::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            let (version, key) = match entry.split_once(':') {
                Some((version, key)) => {
                    let version = version.trim().parse::<u32>().map_err(|_| {
                        ConfigError::Invalid(format!("invalid key version in '{}'", entry))
                    })?;
                    (version, key)
                }
                None => (1, entry),
            };
            store.register_key(key, version)?;
        }
        Ok(store)
    }

    /// Register a base64-encoded Ed25519 public key under `key_version`.
    ///
    /// The decoded length is not enforced here; a key of the wrong length
    /// fails with [`TrustError::KeyLengthMismatch`] when it is resolved.
    pub fn register_key(
        &mut self,
        base64_public_key: &str,
        key_version: u32,
    ) -> Result<(), ConfigError> {
        let public_key = STANDARD
            .decode(base64_public_key.trim())
            .map_err(|e| ConfigError::Invalid(format!("public key is not base64: {}", e)))?;

        let algorithm = KeyAlgorithm::Ed25519;
        if public_key.len() != algorithm.key_len() {
            warn!(
                key_version,
                len = public_key.len(),
                "Registered key has unexpected length"
            );
        }

        let key_version = key_version.to_string();
        debug!(key_version = %key_version, "Registered trusted key");
        self.keys.insert(
            key_version.clone(),
            TrustedKey {
                key_version,
                algorithm,
                public_key,
            },
        );
        Ok(())
    }

    /// Look up a key and check it is usable with `algorithm`.
    pub fn resolve(
        &self,
        key_version: &str,
        algorithm: KeyAlgorithm,
    ) -> Result<[u8; ED25519_PUBLIC_KEY_LEN], TrustError> {
        let key = self
            .keys
            .get(key_version.trim())
            .filter(|k| k.algorithm == algorithm)
            .ok_or_else(|| TrustError::UnknownKeyVersion(key_version.to_string()))?;

        key.public_key
            .as_slice()
            .try_into()
            .map_err(|_| TrustError::KeyLengthMismatch {
                key_version: key.key_version.clone(),
                expected: algorithm.key_len(),
                actual: key.public_key.len(),
            })
    }

    /// True when no key is configured (signing not enabled).
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Registered key versions in ascending order.
    pub fn key_versions(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}
