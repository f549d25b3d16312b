//! User interaction seam.
//!
//! The engine never draws anything. Whenever it needs a decision it asks a
//! [`PromptUI`] supplied by the host (dialog, console, or a canned answer
//! in tests).

use async_trait::async_trait;

use crate::download::DownloadProgress;
use crate::orchestrator::UpdateOffer;

/// What the user is being asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptContext {
    /// "Should the application check for updates automatically?"
    EnableAutoCheck,
    /// "Version X is available. Install it?"
    UpdateAvailable(UpdateOffer),
}

/// The user's answer.
///
/// For [`PromptContext::EnableAutoCheck`]: `Auto` turns automatic checks
/// on, `Once` checks now without enabling them, `No` turns them off,
/// `Cancel` decides nothing.
///
/// For [`PromptContext::UpdateAvailable`]: `Once` and `Auto` install, `No`
/// skips this version, `Cancel` asks again next time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptDecision {
    Once,
    Auto,
    No,
    Cancel,
}

#[async_trait]
pub trait PromptUI: Send + Sync {
    async fn ask(&self, context: &PromptContext) -> PromptDecision;

    /// Installer download progress. Called in non-decreasing order.
    fn download_progress(&self, _progress: DownloadProgress) {}
}

/// Answers every question the same way. Useful for unattended runs.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub PromptDecision);

#[async_trait]
impl PromptUI for FixedPrompt {
    async fn ask(&self, _context: &PromptContext) -> PromptDecision {
        self.0
    }
}
