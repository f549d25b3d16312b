//! Update orchestrator - drives the complete update flow.
//!
//! ```text
//! policy decision -> (prompt) -> fetch appcast -> select release
//!   -> compare versions -> skip window -> trust pre-check -> release notes
//!   -> prompt -> download installer -> verify -> persist -> launch
//! ```
//!
//! Failures never escape as `Err`: every run ends in an [`Outcome`], and
//! the most specific failure is also kept as the [`LastError`] so a caller
//! polling "what happened" gets the same answer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{ConfigStore, UpdaterConfig};
use crate::download::{CancelToken, DownloadEngine, DownloadProgress, FileSink, ProgressSink};
use crate::error::{DownloadError, LastError, ParseError, TrustError, UpdateError};
use crate::install::InstallLauncher;
use crate::manifest::ManifestItem;
use crate::platform::OsContext;
use crate::policy::{Clock, Mode, Status, SystemClock, UpdatePolicy};
use crate::prompt::{PromptContext, PromptDecision, PromptUI};
use crate::select::parse_and_select_for;
use crate::transport::HttpTransport;
use crate::trust::TrustStore;
use crate::verify::{VerificationRequest, Verifier};
use crate::version::Version;

/// A release the user can be offered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOffer {
    /// Version as written in the appcast.
    pub version: String,
    pub title: String,
    pub installed_version: String,
    /// Critical updates bypass the skip window.
    pub is_critical: bool,
    /// Fetched release notes, or the inline description.
    pub release_notes: Option<String>,
    pub release_notes_link: Option<String>,
    pub download_url: Option<String>,
    pub download_size: Option<u64>,
    pub published_at: String,
    /// The selected appcast item.
    pub item: ManifestItem,
}

impl UpdateOffer {
    fn new(item: ManifestItem, installed: &Version, release_notes: Option<String>) -> Self {
        let enclosure = item.enclosure.as_ref();
        Self {
            version: item.effective_version().to_string(),
            title: item.title.clone(),
            installed_version: installed.to_string(),
            is_critical: item.is_critical_for(installed),
            release_notes,
            release_notes_link: item.release_notes_link.clone(),
            download_url: enclosure.map(|e| e.url.clone()),
            download_size: enclosure.and_then(|e| e.length),
            published_at: item.published_at.clone(),
            item,
        }
    }
}

/// Current activity of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrchestratorState {
    #[default]
    Idle,
    Checking,
    Downloading,
    Verifying,
    Launching,
    /// The last run failed; see [`UpdateOrchestrator::last_error`].
    Error,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Automatic checks are off.
    Disabled,
    /// Checked recently; nothing was fetched.
    AlreadyChecked,
    /// The user dismissed the first-run question, or the check was cancelled.
    Cancelled,
    /// The appcast offers nothing for this platform and channel.
    ChannelUnavailable,
    /// The installed version is the newest available.
    UpToDate { latest: String },
    /// The newest version is inside its skip window.
    Skipped { version: String },
    /// A newer version exists (check only).
    UpdateAvailable(UpdateOffer),
    /// The user declined this version; it is now skipped.
    Declined { version: String },
    /// The user postponed the decision.
    Deferred(UpdateOffer),
    /// The verified installer was started.
    Launched { version: String, installer: PathBuf },
    /// The installer download was cancelled.
    InstallCanceled,
    Failed(LastError),
}

/// External capabilities the orchestrator is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn HttpTransport>,
    pub store: Arc<dyn ConfigStore>,
    pub prompt: Arc<dyn PromptUI>,
    pub launcher: Arc<dyn InstallLauncher>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// Collaborators on the wall clock.
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn ConfigStore>,
        prompt: Arc<dyn PromptUI>,
        launcher: Arc<dyn InstallLauncher>,
    ) -> Self {
        Self {
            transport,
            store,
            prompt,
            launcher,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Drives update checks and installs for one host application.
pub struct UpdateOrchestrator {
    config: UpdaterConfig,
    installed_version: Version,
    os: OsContext,
    engine: DownloadEngine,
    verifier: Verifier,
    policy: UpdatePolicy,
    prompt: Arc<dyn PromptUI>,
    launcher: Arc<dyn InstallLauncher>,
    state: Arc<RwLock<OrchestratorState>>,
    last_error: Arc<RwLock<Option<LastError>>>,
    current_run: Mutex<CancelToken>,
}

impl UpdateOrchestrator {
    /// Create an orchestrator.
    ///
    /// # Arguments
    ///
    /// * `config` - Static updater configuration
    /// * `installed_version` - Version of the running application
    /// * `collaborators` - Transport, preference store, UI and launcher
    ///
    /// # Errors
    ///
    /// Returns an error if a configured trusted key cannot be decoded.
    pub fn new(
        config: UpdaterConfig,
        installed_version: Version,
        collaborators: Collaborators,
    ) -> Result<Self, UpdateError> {
        let trust = config.security.trust_store()?;
        if trust.is_empty() {
            warn!("No signing keys configured; installers are checked by digest only");
        }

        let mut os = OsContext::current();
        if let Some(label) = &config.os_label {
            os.os_label = label.clone();
        }

        let engine = DownloadEngine::new(collaborators.transport)
            .with_manifest_file_name(config.manifest_file_name.clone());

        Ok(Self {
            config,
            installed_version,
            os,
            engine,
            verifier: Verifier::new(Arc::new(trust)),
            policy: UpdatePolicy::new(collaborators.store, collaborators.clock),
            prompt: collaborators.prompt,
            launcher: collaborators.launcher,
            state: Arc::new(RwLock::new(OrchestratorState::Idle)),
            last_error: Arc::new(RwLock::new(None)),
            current_run: Mutex::new(CancelToken::new()),
        })
    }

    /// Replace the trust store built from the configuration.
    pub fn with_trust_store(mut self, trust: TrustStore) -> Self {
        self.verifier = Verifier::new(Arc::new(trust));
        self
    }

    /// Select releases for `os` instead of the running platform.
    pub fn with_os_context(mut self, os: OsContext) -> Self {
        self.os = os;
        self
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// The most specific failure of the last run, if it failed.
    pub async fn last_error(&self) -> Option<LastError> {
        self.last_error.read().await.clone()
    }

    pub fn policy(&self) -> &UpdatePolicy {
        &self.policy
    }

    pub fn installed_version(&self) -> &Version {
        &self.installed_version
    }

    /// Cancel the run in progress, if any.
    pub fn cancel(&self) {
        if let Ok(token) = self.current_run.lock() {
            token.cancel();
        }
    }

    async fn set_state(&self, state: OrchestratorState) {
        *self.state.write().await = state;
    }

    async fn begin(&self) -> CancelToken {
        *self.last_error.write().await = None;
        let token = CancelToken::new();
        if let Ok(mut current) = self.current_run.lock() {
            *current = token.clone();
        }
        token
    }

    async fn fail(&self, err: UpdateError) -> Outcome {
        let last = LastError::from(&err);
        error!(kind = %last.kind, error = %last.message, "Update failed");
        *self.last_error.write().await = Some(last.clone());
        self.set_state(OrchestratorState::Error).await;
        Outcome::Failed(last)
    }

    async fn finish(&self, outcome: Outcome) -> Outcome {
        self.set_state(OrchestratorState::Idle).await;
        outcome
    }

    // ========================================================================
    // Check
    // ========================================================================

    /// Check for an update without installing it.
    pub async fn check(&self, mode: Mode) -> Outcome {
        let cancel = self.begin().await;
        self.check_with(mode, &cancel).await
    }

    async fn check_with(&self, mode: Mode, cancel: &CancelToken) -> Outcome {
        self.set_state(OrchestratorState::Checking).await;

        match self.decide(mode).await {
            Ok(None) => {}
            Ok(Some(outcome)) => return self.finish(outcome).await,
            Err(e) => return self.fail(e).await,
        }

        let feed = match self.fetch_manifest(cancel).await {
            Ok(feed) => feed,
            Err(DownloadError::Cancelled) => return self.finish(Outcome::Cancelled).await,
            Err(e) => return self.fail(e.into()).await,
        };

        let channel = self
            .policy
            .channel_override()
            .unwrap_or_else(|| self.config.channel.clone());
        let item = match parse_and_select_for(&feed, &channel, &self.os) {
            Ok(Some(item)) => item,
            Ok(None) => {
                info!(channel = %channel, os = %self.os.os_label, "No compatible update found");
                return self.finish(Outcome::ChannelUnavailable).await;
            }
            Err(e) => return self.fail(e.into()).await,
        };

        let latest = item.parsed_version();
        if latest <= self.installed_version && mode != Mode::Reinstall {
            info!(installed = %self.installed_version, latest = %latest, "Up to date");
            return self
                .finish(Outcome::UpToDate {
                    latest: item.effective_version().to_string(),
                })
                .await;
        }

        let version = item.effective_version().to_string();
        let critical = item.is_critical_for(&self.installed_version);
        if !mode.bypasses_policy() && !critical {
            match self.policy.is_skipped(&version) {
                Ok(true) => {
                    info!(version = %version, "Update skipped by user");
                    return self.finish(Outcome::Skipped { version }).await;
                }
                Ok(false) => {}
                Err(e) => return self.fail(e.into()).await,
            }
        }

        if let Some(enclosure) = &item.enclosure {
            let request = VerificationRequest::for_enclosure(enclosure);
            if let Err(e) = self.verifier.check_signature_policy(&request) {
                return self.fail(e.into()).await;
            }
        }

        let notes = self.release_notes(&item, cancel).await;
        let offer = UpdateOffer::new(item, &self.installed_version, notes);
        info!(
            installed = %self.installed_version,
            version = %offer.version,
            critical = offer.is_critical,
            "Update available"
        );
        self.finish(Outcome::UpdateAvailable(offer)).await
    }

    /// Apply the check policy. `Ok(None)` means "go on and check".
    async fn decide(&self, mode: Mode) -> Result<Option<Outcome>, UpdateError> {
        if mode.bypasses_policy() {
            return Ok(None);
        }

        match self.policy.status_for(mode)? {
            Status::Enabled => Ok(None),
            Status::Disabled => Ok(Some(Outcome::Disabled)),
            Status::AlreadyChecked => Ok(Some(Outcome::AlreadyChecked)),
            Status::NeedsPrompt => {
                match self.prompt.ask(&PromptContext::EnableAutoCheck).await {
                    PromptDecision::Auto => {
                        self.policy.set_auto_check(true)?;
                        Ok(None)
                    }
                    PromptDecision::Once => {
                        self.policy.set_auto_check(false)?;
                        Ok(None)
                    }
                    PromptDecision::No => {
                        self.policy.set_auto_check(false)?;
                        Ok(Some(Outcome::Disabled))
                    }
                    PromptDecision::Cancel => Ok(Some(Outcome::Cancelled)),
                }
            }
        }
    }

    fn feed_url(&self) -> String {
        self.policy
            .host_override()
            .unwrap_or_else(|| self.config.appcast_url.clone())
    }

    /// Fetch the appcast, retrying unreachable/timeout failures.
    async fn fetch_manifest(&self, cancel: &CancelToken) -> Result<String, DownloadError> {
        let url = self.feed_url();
        let max_retries = self.config.network.max_retries;
        let delay = Duration::from_millis(self.config.network.retry_delay_ms);

        let mut attempt = 0;
        loop {
            debug!(url = %url, attempt, "Fetching appcast");
            match self.engine.fetch_text(&url, cancel).await {
                Ok(feed) => return Ok(feed),
                Err(e) if e.is_transient() && attempt < max_retries => {
                    attempt += 1;
                    warn!(error = %e, attempt, max_retries, "Appcast fetch failed; retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release notes for an offer. Fetch failures fall back to the inline
    /// description.
    async fn release_notes(&self, item: &ManifestItem, cancel: &CancelToken) -> Option<String> {
        let inline = Some(item.description.trim().to_string()).filter(|d| !d.is_empty());
        let Some(link) = item.release_notes_link.as_deref() else {
            return inline;
        };

        match self.engine.fetch_text(link, cancel).await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(link, error = %e, "Cannot fetch release notes");
                inline
            }
        }
    }

    // ========================================================================
    // Run
    // ========================================================================

    /// Check, ask the user, and install if accepted.
    pub async fn run(&self, mode: Mode) -> Outcome {
        let cancel = self.begin().await;
        let offer = match self.check_with(mode, &cancel).await {
            Outcome::UpdateAvailable(offer) => offer,
            other => return other,
        };

        match self
            .prompt
            .ask(&PromptContext::UpdateAvailable(offer.clone()))
            .await
        {
            PromptDecision::Once | PromptDecision::Auto => self.install_with(&offer, &cancel).await,
            PromptDecision::No => match self.policy.skip(&offer.version) {
                Ok(()) => Outcome::Declined {
                    version: offer.version,
                },
                Err(e) => self.fail(e.into()).await,
            },
            PromptDecision::Cancel => {
                debug!(version = %offer.version, "Update postponed");
                Outcome::Deferred(offer)
            }
        }
    }

    /// Download, verify and launch an offered installer.
    pub async fn install(&self, offer: &UpdateOffer) -> Outcome {
        let cancel = self.begin().await;
        self.install_with(offer, &cancel).await
    }

    async fn install_with(&self, offer: &UpdateOffer, cancel: &CancelToken) -> Outcome {
        let Some(enclosure) = offer.item.enclosure.as_ref() else {
            return self
                .fail(ParseError::Structure("release has no enclosure".to_string()).into())
                .await;
        };

        let request = VerificationRequest::for_enclosure(enclosure);
        if let Err(e) = request
            .check_integrity_attributes()
            .and_then(|()| self.verifier.check_signature_policy(&request).map(|_| ()))
        {
            return self.fail(e.into()).await;
        }

        // Download
        self.set_state(OrchestratorState::Downloading).await;
        let staging = match create_staging_dir(&self.config.download_dir()) {
            Ok(dir) => dir,
            Err(e) => return self.fail(e.into()).await,
        };
        let target = staging.path().join(download_file_name(&offer.item));
        info!(url = %enclosure.url, target = %target.display(), "Downloading installer");

        let prompt = self.prompt.clone();
        let sink = ProgressSink::new(FileSink::new(&target), move |progress: DownloadProgress| {
            prompt.download_progress(progress);
        });
        let handle = self
            .engine
            .spawn(enclosure.url.clone(), sink, cancel.child_token());
        match handle.wait().await {
            Ok(_) => {}
            Err(DownloadError::Cancelled) => {
                info!("Installer download cancelled");
                discard_staging(staging);
                return self.finish(Outcome::InstallCanceled).await;
            }
            Err(e) => {
                discard_staging(staging);
                return self.fail(e.into()).await;
            }
        }

        // Verify
        self.set_state(OrchestratorState::Verifying).await;
        let verifier = self.verifier.clone();
        let path = target.clone();
        let verify_request = request.clone();
        let verified = tokio::task::spawn_blocking(move || {
            verifier
                .verify_file(&path, &verify_request)
                .and_then(|result| result.into_result(&verify_request))
        })
        .await
        .unwrap_or_else(|e| Err(TrustError::Io(format!("verification task failed: {}", e))));
        if let Err(e) = verified {
            discard_staging(staging);
            return self.fail(e.into()).await;
        }

        if let Err(e) = self.policy.mark_checked_once() {
            discard_staging(staging);
            return self.fail(e.into()).await;
        }

        // Launch
        self.set_state(OrchestratorState::Launching).await;
        if let Err(e) = self
            .launcher
            .launch(&target, &offer.item.installer_args)
            .await
        {
            discard_staging(staging);
            return self.fail(e).await;
        }
        // The running installer owns its file from here on.
        let staging_dir = staging.keep();
        debug!(dir = %staging_dir.display(), "Installer staging directory kept");

        info!(version = %offer.version, installer = %target.display(), "Installer launched");
        self.finish(Outcome::Launched {
            version: offer.version.clone(),
            installer: target,
        })
        .await
    }
}

/// Create a directory only this process can write to for one installer.
fn create_staging_dir(parent: &Path) -> std::io::Result<TempDir> {
    std::fs::create_dir_all(parent)?;
    tempfile::Builder::new()
        .prefix("zrc-autoupdate-")
        .tempdir_in(parent)
}

fn discard_staging(staging: TempDir) {
    let path = staging.path().to_path_buf();
    if let Err(e) = staging.close() {
        warn!(path = %path.display(), error = %e, "Cannot remove rejected download");
    }
}

/// Strip any directory part and characters that are unsafe in file names.
fn sanitize_file_name(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == ' ').to_string();
    Some(cleaned).filter(|c| !c.is_empty())
}

/// Local file name for a release's installer.
///
/// Uses the enclosure's `name`, else the last URL path segment, else
/// `update-<version>.bin`.
pub fn download_file_name(item: &ManifestItem) -> String {
    let enclosure = item.enclosure.as_ref();
    enclosure
        .and_then(|e| e.name.as_deref())
        .and_then(sanitize_file_name)
        .or_else(|| {
            enclosure
                .and_then(|e| Url::parse(&e.url).ok())
                .and_then(|url| {
                    url.path_segments()
                        .and_then(|mut segments| segments.next_back().map(str::to_string))
                })
                .and_then(|segment| sanitize_file_name(&segment))
        })
        .unwrap_or_else(|| {
            let version = sanitize_file_name(item.effective_version())
                .unwrap_or_else(|| "latest".to_string());
            format!("update-{}.bin", version)
        })
}
