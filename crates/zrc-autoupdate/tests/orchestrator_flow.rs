//! Integration tests for the end-to-end update flow.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;
use url::Url;

use zrc_autoupdate::crypto::public_key_for;
use zrc_autoupdate::{
    Collaborators, CryptoSigner, DownloadError, DownloadProgress, Ed25519Signer, ErrorKind,
    FixedClock, HttpResponse, HttpTransport, InstallLauncher, MemoryConfigStore, Mode,
    NetworkConfig, OrchestratorState, OsContext, Outcome, PromptContext, PromptDecision, PromptUI,
    TrustStore, UpdateError, UpdateOrchestrator, UpdaterConfig, Version,
};

const FEED_URL: &str = "https://updates.example.com/appcast.xml";
const INSTALLER_URL: &str = "https://updates.example.com/files/app-2.0.exe";
const NOTES_URL: &str = "https://updates.example.com/notes/2.0.html";
const SEED: [u8; 32] = [42u8; 32];

// =============================================================================
// Fakes
// =============================================================================

/// Serves fixed bodies; a body may be held back until released.
#[derive(Default)]
struct FakeServer {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    stalled: Mutex<Option<String>>,
    requests: Mutex<Vec<String>>,
}

impl FakeServer {
    fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body.into());
    }

    /// Send the first half of `url`, then never finish.
    fn stall(&self, url: &str) {
        *self.stalled.lock().unwrap() = Some(url.to_string());
    }

    fn requested(&self, url: &str) -> bool {
        self.requests.lock().unwrap().iter().any(|r| r == url)
    }
}

#[async_trait]
impl HttpTransport for FakeServer {
    async fn get(&self, url: &Url) -> Result<HttpResponse, DownloadError> {
        self.requests.lock().unwrap().push(url.to_string());
        let Some(body) = self.bodies.lock().unwrap().get(url.as_str()).cloned() else {
            return Ok(HttpResponse {
                status: 404,
                status_text: "Not Found".into(),
                content_length: None,
                final_url: url.clone(),
                body: futures_util::stream::empty().boxed(),
            });
        };

        let total = body.len() as u64;
        let stalled = self.stalled.lock().unwrap().as_deref() == Some(url.as_str());
        let body = if stalled {
            let head = Bytes::from(body[..body.len() / 2].to_vec());
            futures_util::stream::once(async move { Ok(head) })
                .chain(futures_util::stream::pending())
                .boxed()
        } else {
            futures_util::stream::iter(vec![Ok(Bytes::from(body))]).boxed()
        };

        Ok(HttpResponse {
            status: 200,
            status_text: "OK".into(),
            content_length: Some(total),
            final_url: url.clone(),
            body,
        })
    }
}

struct ScriptedPrompt {
    decision: PromptDecision,
    asked: Mutex<Vec<PromptContext>>,
    progress: Mutex<Vec<DownloadProgress>>,
}

impl ScriptedPrompt {
    fn new(decision: PromptDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            asked: Mutex::new(Vec::new()),
            progress: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl PromptUI for ScriptedPrompt {
    async fn ask(&self, context: &PromptContext) -> PromptDecision {
        self.asked.lock().unwrap().push(context.clone());
        self.decision
    }

    fn download_progress(&self, progress: DownloadProgress) {
        self.progress.lock().unwrap().push(progress);
    }
}

#[derive(Default)]
struct RecordingLauncher {
    launched: Mutex<Vec<(PathBuf, String, Vec<u8>)>>,
}

#[async_trait]
impl InstallLauncher for RecordingLauncher {
    async fn launch(&self, installer: &Path, args: &str) -> Result<(), UpdateError> {
        let content = std::fs::read(installer)?;
        self.launched
            .lock()
            .unwrap()
            .push((installer.to_path_buf(), args.to_string(), content));
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn installer_bytes() -> Vec<u8> {
    (0..100_000u32).map(|i| (i % 251) as u8).collect()
}

fn feed(installer: &[u8], signature: Option<&str>) -> String {
    let signature = signature
        .map(|s| format!(r#" sparkle:edSignature="{}""#, s))
        .unwrap_or_default();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<rss version="2.0" xmlns:sparkle="http://www.andymatuschak.org/xml-namespaces/sparkle">
  <channel>
    <title>App</title>
    <item>
      <title>Version 2.0</title>
      <sparkle:version>2.0</sparkle:version>
      <sparkle:releaseNotesLink>{notes}</sparkle:releaseNotesLink>
      <sparkle:installerArguments>/S /norestart</sparkle:installerArguments>
      <enclosure url="{url}" length="{len}" type="application/octet-stream"
                 sparkle:shaSignature="{sha}"{signature}/>
    </item>
    <item>
      <title>Version 1.8</title>
      <sparkle:version>1.8</sparkle:version>
      <enclosure url="https://updates.example.com/files/app-1.8.exe" length="10"/>
    </item>
  </channel>
</rss>"#,
        notes = NOTES_URL,
        url = INSTALLER_URL,
        len = installer.len(),
        sha = hex::encode(Sha256::digest(installer)),
        signature = signature,
    )
}

struct Harness {
    server: Arc<FakeServer>,
    prompt: Arc<ScriptedPrompt>,
    launcher: Arc<RecordingLauncher>,
    orchestrator: UpdateOrchestrator,
    _dir: TempDir,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(installed: &str, decision: PromptDecision, trust: TrustStore) -> Harness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let server = Arc::new(FakeServer::default());
    let prompt = ScriptedPrompt::new(decision);
    let launcher = Arc::new(RecordingLauncher::default());

    let config = UpdaterConfig {
        appcast_url: FEED_URL.to_string(),
        download_dir: Some(dir.path().to_path_buf()),
        network: NetworkConfig {
            retry_delay_ms: 1,
            ..NetworkConfig::default()
        },
        ..UpdaterConfig::default()
    };
    let collaborators = Collaborators {
        transport: server.clone(),
        store: Arc::new(MemoryConfigStore::new()),
        prompt: prompt.clone(),
        launcher: launcher.clone(),
        clock: Arc::new(FixedClock::at(1_700_000_000)),
    };
    let orchestrator = UpdateOrchestrator::new(config, Version::parse(installed), collaborators)
        .unwrap()
        .with_trust_store(trust)
        .with_os_context(OsContext::new("windows", "x64", None));

    Harness {
        server,
        prompt,
        launcher,
        orchestrator,
        _dir: dir,
    }
}

impl Harness {
    /// True when no installer or staging directory was left behind.
    fn download_dir_is_empty(&self) -> bool {
        std::fs::read_dir(self._dir.path()).unwrap().next().is_none()
    }
}

fn keyed_store() -> TrustStore {
    let mut store = TrustStore::new();
    store
        .register_key(&STANDARD.encode(public_key_for(&SEED)), 1)
        .unwrap();
    store
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_update_available_without_signing_keys() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::Once, TrustStore::new());
    h.server.serve(FEED_URL, feed(&installer, None));
    h.server.serve(NOTES_URL, "<p>Faster.</p>");

    match h.orchestrator.check(Mode::IgnoreSkip).await {
        Outcome::UpdateAvailable(offer) => {
            assert_eq!(offer.version, "2.0");
            assert_eq!(offer.installed_version, "1.5");
            assert_eq!(offer.release_notes.as_deref(), Some("<p>Faster.</p>"));
            assert_eq!(offer.download_size, Some(installer.len() as u64));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(h.orchestrator.last_error().await.is_none());
    assert!(!h.server.requested(INSTALLER_URL));
}

#[tokio::test]
async fn test_full_run_downloads_verifies_and_launches() {
    let installer = installer_bytes();
    let signature = STANDARD.encode(Ed25519Signer.sign(&installer, &SEED));
    let h = harness("1.5", PromptDecision::Once, keyed_store());
    h.server.serve(FEED_URL, feed(&installer, Some(&signature)));
    h.server.serve(INSTALLER_URL, installer.clone());

    let outcome = h.orchestrator.run(Mode::Enable).await;
    let Outcome::Launched { version, installer: path } = outcome else {
        panic!("unexpected outcome: {:?}", outcome);
    };
    assert_eq!(version, "2.0");
    assert_eq!(path.file_name().unwrap(), "app-2.0.exe");

    // Staged in a fresh private directory, not directly in the download dir.
    let staging = path.parent().unwrap();
    assert_eq!(staging.parent().unwrap(), h._dir.path());
    assert!(staging
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("zrc-autoupdate-"));
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(staging).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
    }
    assert!(path.exists());

    let launched = h.launcher.launched.lock().unwrap();
    assert_eq!(launched.len(), 1);
    assert_eq!(launched[0].1, "/S /norestart");
    assert_eq!(launched[0].2, installer);

    let progress = h.prompt.progress.lock().unwrap();
    assert_eq!(progress.last().unwrap().downloaded, installer.len() as u64);
    assert!(progress.windows(2).all(|w| w[0].downloaded <= w[1].downloaded));

    assert!(h.orchestrator.policy().state().auto_once);
    assert_eq!(h.orchestrator.state().await, OrchestratorState::Idle);
}

#[tokio::test]
async fn test_unsigned_release_rejected_when_keys_configured() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::Once, keyed_store());
    h.server.serve(FEED_URL, feed(&installer, None));
    h.server.serve(INSTALLER_URL, installer);

    let outcome = h.orchestrator.run(Mode::IgnoreSkip).await;
    let Outcome::Failed(last) = outcome else {
        panic!("unexpected outcome: {:?}", outcome);
    };
    assert_eq!(last.kind, ErrorKind::Verification);
    assert_eq!(h.orchestrator.last_error().await, Some(last));
    assert_eq!(h.orchestrator.state().await, OrchestratorState::Error);

    assert!(!h.server.requested(INSTALLER_URL));
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert!(h.prompt.asked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_tampered_installer_is_not_launched() {
    let installer = installer_bytes();
    let signature = STANDARD.encode(Ed25519Signer.sign(&installer, &SEED));
    let h = harness("1.5", PromptDecision::Auto, keyed_store());
    h.server.serve(FEED_URL, feed(&installer, Some(&signature)));

    let mut tampered = installer.clone();
    tampered[500] ^= 0xff;
    h.server.serve(INSTALLER_URL, tampered);

    let outcome = h.orchestrator.run(Mode::IgnoreSkip).await;
    assert!(matches!(outcome, Outcome::Failed(ref e) if e.kind == ErrorKind::Verification));
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert!(h.download_dir_is_empty());
}

#[tokio::test]
async fn test_release_without_integrity_data_is_not_downloaded() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::Auto, TrustStore::new());
    let doc = feed(&installer, None).replace(
        &format!(
            "length=\"{}\" type=\"application/octet-stream\"\n                 sparkle:shaSignature=\"{}\"",
            installer.len(),
            hex::encode(Sha256::digest(&installer))
        ),
        "sparkle:shaSignature=\"deadbeef\"",
    );
    assert!(doc.contains("sparkle:shaSignature=\"deadbeef\""));
    h.server.serve(FEED_URL, doc);
    h.server.serve(INSTALLER_URL, installer);

    let outcome = h.orchestrator.run(Mode::IgnoreSkip).await;
    assert!(matches!(outcome, Outcome::Failed(ref e) if e.kind == ErrorKind::Verification));
    assert!(!h.server.requested(INSTALLER_URL));
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert!(h.download_dir_is_empty());
}

#[tokio::test]
async fn test_unknown_key_version_is_configuration_error() {
    let installer = installer_bytes();
    let signature = STANDARD.encode(Ed25519Signer.sign(&installer, &SEED));
    let h = harness("1.5", PromptDecision::Once, keyed_store());
    let doc = feed(&installer, Some(&signature)).replace(
        "sparkle:edSignature",
        "sparkle:edKeyVersion=\"7\" sparkle:edSignature",
    );
    h.server.serve(FEED_URL, doc);

    let outcome = h.orchestrator.check(Mode::IgnoreSkip).await;
    assert!(matches!(outcome, Outcome::Failed(ref e) if e.kind == ErrorKind::TrustConfiguration));
}

#[tokio::test]
async fn test_up_to_date_and_reinstall() {
    let installer = installer_bytes();
    let h = harness("2.0", PromptDecision::Once, TrustStore::new());
    h.server.serve(FEED_URL, feed(&installer, None));

    assert_eq!(
        h.orchestrator.check(Mode::IgnoreSkip).await,
        Outcome::UpToDate {
            latest: "2.0".to_string()
        }
    );
    assert!(matches!(
        h.orchestrator.check(Mode::Reinstall).await,
        Outcome::UpdateAvailable(_)
    ));
}

#[tokio::test]
async fn test_declined_version_is_skipped_until_ignored() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::No, TrustStore::new());
    h.server.serve(FEED_URL, feed(&installer, None));
    h.orchestrator.policy().set_auto_check(true).unwrap();

    assert_eq!(
        h.orchestrator.run(Mode::Prompt).await,
        Outcome::Declined {
            version: "2.0".to_string()
        }
    );
    assert_eq!(
        h.orchestrator.check(Mode::Prompt).await,
        Outcome::Skipped {
            version: "2.0".to_string()
        }
    );
    assert!(matches!(
        h.orchestrator.check(Mode::IgnoreSkip).await,
        Outcome::UpdateAvailable(_)
    ));
}

#[tokio::test]
async fn test_first_run_prompt_decides_auto_check() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::No, TrustStore::new());
    h.server.serve(FEED_URL, feed(&installer, None));

    assert_eq!(h.orchestrator.check(Mode::Prompt).await, Outcome::Disabled);
    assert_eq!(
        h.prompt.asked.lock().unwrap().as_slice(),
        &[PromptContext::EnableAutoCheck]
    );
    assert_eq!(h.orchestrator.policy().state().auto_check, Some(false));
    assert!(!h.server.requested(FEED_URL));

    // Background checks stay off once the user said no.
    assert_eq!(h.orchestrator.check(Mode::Auto).await, Outcome::Disabled);
}

#[tokio::test]
async fn test_auto_mode_throttles_checks() {
    let installer = installer_bytes();
    let h = harness("1.5", PromptDecision::Once, TrustStore::new());
    h.server.serve(FEED_URL, feed(&installer, None));
    h.orchestrator.policy().set_auto_check(true).unwrap();

    assert!(matches!(
        h.orchestrator.check(Mode::Auto).await,
        Outcome::UpdateAvailable(_)
    ));
    assert_eq!(h.orchestrator.check(Mode::Auto).await, Outcome::AlreadyChecked);
    assert_eq!(h.server.requests.lock().unwrap().iter().filter(|r| *r == FEED_URL).count(), 1);
}

#[tokio::test]
async fn test_cancel_during_download() {
    let installer = installer_bytes();
    let h = Arc::new(harness("1.5", PromptDecision::Once, TrustStore::new()));
    h.server.serve(FEED_URL, feed(&installer, None));
    h.server.serve(INSTALLER_URL, installer);
    h.server.stall(INSTALLER_URL);

    let runner = {
        let h = h.clone();
        tokio::spawn(async move { h.orchestrator.run(Mode::IgnoreSkip).await })
    };

    // Wait until the first half of the installer has arrived.
    for _ in 0..200 {
        if !h.prompt.progress.lock().unwrap().iter().all(|p| p.downloaded == 0) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    h.orchestrator.cancel();

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("run should stop after cancel")
        .unwrap();
    assert_eq!(outcome, Outcome::InstallCanceled);
    assert!(h.orchestrator.last_error().await.is_none());
    assert!(h.launcher.launched.lock().unwrap().is_empty());
    assert!(h.download_dir_is_empty());
}
