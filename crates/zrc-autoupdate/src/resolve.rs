//! Indirection endpoints.
//!
//! Some feeds are not published at a stable URL but as an asset of the
//! latest GitHub release. Such a URL points at the releases API
//! (`https://api.github.com/repos/<owner>/<repo>/releases/latest`); the
//! real location is the `browser_download_url` of the asset whose name
//! equals the expected file name.

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::DownloadError;

const GITHUB_API_HOST: &str = "api.github.com";

/// GitHub release API response.
#[derive(Debug, Deserialize)]
pub struct GitHubRelease {
    #[serde(default)]
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// GitHub release asset.
#[derive(Debug, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Whether `url` is a "latest release" endpoint that must be resolved
/// before fetching.
pub fn is_latest_release_endpoint(url: &Url) -> bool {
    if url.host_str() != Some(GITHUB_API_HOST) {
        return false;
    }
    let Some(segments) = url.path_segments() else {
        return false;
    };
    let segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    matches!(
        segments.as_slice(),
        ["repos", owner, repo, "releases", "latest"] if !owner.is_empty() && !repo.is_empty()
    )
}

/// Extract the download URL of `asset_name` from a release document.
///
/// # Errors
///
/// [`DownloadError::Resolve`] if the document is not a release, has no
/// asset of that name, or the asset URL is invalid.
pub fn asset_url(release_json: &str, asset_name: &str) -> Result<Url, DownloadError> {
    let release: GitHubRelease = serde_json::from_str(release_json)
        .map_err(|e| DownloadError::Resolve(format!("invalid release document: {}", e)))?;

    let asset = release
        .assets
        .iter()
        .find(|a| a.name == asset_name)
        .ok_or_else(|| {
            DownloadError::Resolve(format!(
                "release {} has no asset named {}",
                release.tag_name, asset_name
            ))
        })?;

    debug!(tag = %release.tag_name, asset = %asset.name, "Resolved release asset");
    Url::parse(&asset.browser_download_url)
        .map_err(|e| DownloadError::Resolve(format!("invalid asset URL: {}", e)))
}
