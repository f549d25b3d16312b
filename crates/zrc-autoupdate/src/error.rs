//! Error types for the update engine.
//!
//! Every failure the engine can surface belongs to one of four families:
//! feed parsing, downloading, trust verification, and persisted
//! configuration. [`UpdateError`] wraps them all and maps each onto a
//! machine-readable [`ErrorKind`] so a caller can branch on the kind while
//! still showing the human message.

use std::fmt;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type UpdateResult<T> = Result<T, UpdateError>;

/// Errors produced while parsing an appcast feed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The document is not well-formed XML (unbalanced tags, bad encoding).
    #[error("malformed appcast at line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// The document is well-formed but violates the appcast structure.
    #[error("invalid appcast structure: {0}")]
    Structure(String),
}

impl ParseError {
    /// Line number for syntax errors, if known.
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::Syntax { line, .. } => Some(*line),
            Self::Structure(_) => None,
        }
    }
}

/// Errors produced by the download engine.
///
/// None of these are retried by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    /// The host could not be reached (DNS, connect, TLS handshake).
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// A connect or read timeout elapsed.
    #[error("connection timed out: {0}")]
    Timeout(String),

    /// The server answered with an HTTP error status, or the body stream broke.
    #[error("transfer failed with status {status}: {text}")]
    Transport { status: u16, text: String },

    /// Reading a local (`file://` or UNC) source failed.
    #[error("local file error: {0}")]
    LocalIo(String),

    /// The download was cancelled through its cancel token.
    #[error("download cancelled")]
    Cancelled,

    /// The sink rejected an operation.
    #[error("cannot write download: {0}")]
    SinkIo(String),

    /// The URL uses plaintext HTTP or an unsupported scheme.
    #[error("refusing insecure or unsupported URL: {0}")]
    Insecure(String),

    /// The URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// An indirection endpoint did not yield a download URL.
    #[error("cannot resolve download location: {0}")]
    Resolve(String),
}

impl DownloadError {
    /// Whether an orchestrator may reasonably try again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

/// Trust failures. Always fatal to the current install attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrustError {
    /// File size differs from the length declared by the appcast.
    #[error("length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },

    /// The appcast declares no length for the artifact.
    #[error("update declares no length")]
    MissingLength,

    /// The declared digest cannot be checked against any known algorithm.
    #[error("declared digest cannot be checked: {0}")]
    MalformedDigest(String),

    /// The artifact has neither a usable digest nor a signature.
    #[error("update declares neither a digest nor a signature")]
    MissingIntegrity,

    /// Digest of the file differs from the declared digest.
    #[error("{algorithm} mismatch: expected {expected}, got {actual}")]
    HashMismatch {
        algorithm: String,
        expected: String,
        actual: String,
    },

    /// The enclosure names a key version the trust store does not know.
    #[error("no trusted key registered for key version {0}")]
    UnknownKeyVersion(String),

    /// The registered key has the wrong length for its algorithm.
    #[error("trusted key {key_version} has {actual} bytes, expected {expected}")]
    KeyLengthMismatch {
        key_version: String,
        expected: usize,
        actual: usize,
    },

    /// Signing is configured but the enclosure carries no signature.
    #[error("update is not signed but signing keys are configured")]
    MissingSignature,

    /// The signature did not verify, or could not be decoded.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// The artifact could not be read for verification.
    #[error("cannot read artifact: {0}")]
    Io(String),
}

impl TrustError {
    /// True for failures caused by trust configuration rather than by the
    /// downloaded bytes.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownKeyVersion(_) | Self::KeyLengthMismatch { .. }
        )
    }
}

/// Errors from persisted settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The backing store could not be read.
    #[error("cannot read settings: {0}")]
    Read(String),

    /// The backing store could not be written.
    #[error("cannot write settings: {0}")]
    Write(String),

    /// A static configuration value is invalid.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error returned by the orchestrator and the public helpers.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Trust(#[from] TrustError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The installer could not be started.
    #[error("cannot launch installer: {0}")]
    Launch(String),

    /// IO error while staging files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Machine-readable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse(_) => ErrorKind::Parse,
            Self::Download(DownloadError::Cancelled) => ErrorKind::Cancelled,
            Self::Download(_) => ErrorKind::Network,
            Self::Trust(e) if e.is_configuration_error() => ErrorKind::TrustConfiguration,
            Self::Trust(_) => ErrorKind::Verification,
            Self::Config(_) => ErrorKind::Config,
            Self::Launch(_) => ErrorKind::Launch,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

/// Machine-readable classification of the last failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Parse,
    Network,
    Cancelled,
    Verification,
    TrustConfiguration,
    Config,
    Launch,
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::Network => "network",
            Self::Cancelled => "cancelled",
            Self::Verification => "verification",
            Self::TrustConfiguration => "trust-configuration",
            Self::Config => "config",
            Self::Launch => "launch",
            Self::Io => "io",
        };
        f.write_str(name)
    }
}

/// The most specific failure seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&UpdateError> for LastError {
    fn from(err: &UpdateError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}
