//! # zrc-autoupdate
//!
//! Automatic update client engine for desktop applications.
//!
//! This crate handles:
//! - Appcast (RSS-style XML) parsing with channel and OS filtering
//! - Best-release selection by platform weight
//! - Debian-policy version comparison
//! - Installer download over HTTPS, `file://` or UNC paths, with cancellation
//! - Length, SHA/MD5 and streaming Ed25519 verification against a trust store
//! - Persisted check/skip policy
//! - The end-to-end check, prompt, download, verify and launch flow
//!
//! ## Security
//!
//! - Plaintext HTTP is refused for every fetch
//! - Once any signing key is registered, unsigned installers are rejected
//! - An installer is never launched before it has passed verification

pub mod config;
pub mod crypto;
pub mod download;
pub mod error;
pub mod install;
pub mod manifest;
pub mod orchestrator;
pub mod platform;
pub mod policy;
pub mod prompt;
#[cfg(test)]
mod proptests;
pub mod resolve;
pub mod select;
#[cfg(test)]
pub(crate) mod test_support;
pub mod transport;
pub mod trust;
pub mod verify;
pub mod version;

// Re-export main types for convenience
pub use config::{
    ConfigKey, ConfigStore, MemoryConfigStore, NetworkConfig, SecurityConfig, TomlConfigStore,
    UpdaterConfig,
};
pub use crypto::{CryptoSigner, Ed25519Signer, Ed25519StreamVerifier, StreamingVerifier};
pub use download::{
    CancelToken, DownloadEngine, DownloadHandle, DownloadProgress, DownloadTask, FileSink,
    MemorySink, ProgressSink, Sink, TaskState,
};
pub use error::{
    ConfigError, DownloadError, ErrorKind, LastError, ParseError, TrustError, UpdateError,
    UpdateResult,
};
pub use install::{InstallLauncher, ProcessLauncher};
pub use manifest::{parse_items, CriticalUpdate, Enclosure, ManifestItem};
pub use orchestrator::{
    Collaborators, OrchestratorState, Outcome, UpdateOffer, UpdateOrchestrator,
};
pub use platform::{OsContext, OsVersion};
pub use policy::{Clock, FixedClock, Mode, Status, SystemClock, UpdatePolicy, UpdatePolicyState};
pub use prompt::{FixedPrompt, PromptContext, PromptDecision, PromptUI};
pub use select::{parse_and_select, parse_and_select_for, select, weigh};
pub use transport::{HttpResponse, HttpTransport, ReqwestTransport};
pub use trust::{KeyAlgorithm, TrustStore, TrustedKey};
pub use verify::{HashAlgorithm, VerificationRequest, VerificationResult, Verifier};
pub use version::Version;
