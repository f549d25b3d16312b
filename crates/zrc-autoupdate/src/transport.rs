//! HTTP transport abstraction.
//!
//! The download engine only needs "GET this URL and give me a body stream".
//! Redirects, TLS, proxies and timeouts are the transport's business; the
//! engine maps whatever the transport reports onto [`DownloadError`].

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use hyper::ext::ReasonPhrase;
use tracing::debug;
use url::Url;

use crate::config::NetworkConfig;
use crate::error::DownloadError;

/// Streaming response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, DownloadError>>;

/// Response head plus a streaming body.
pub struct HttpResponse {
    pub status: u16,
    /// Reason phrase as reported by the server or the status registry.
    pub status_text: String,
    pub content_length: Option<u64>,
    /// Final URL after redirects.
    pub final_url: Url,
    pub body: BodyStream,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("status_text", &self.status_text)
            .field("content_length", &self.content_length)
            .field("final_url", &self.final_url.as_str())
            .finish_non_exhaustive()
    }
}

/// Minimal HTTP GET capability.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Issue a GET request.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Unreachable`] or [`DownloadError::Timeout`]
    /// when no response head arrives. HTTP error statuses are returned as a
    /// normal response; the caller decides what they mean.
    async fn get(&self, url: &Url) -> Result<HttpResponse, DownloadError>;
}

/// [`HttpTransport`] backed by `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given timeouts and user agent.
    pub fn new(config: &NetworkConfig) -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .https_only(true)
            .build()
            .map_err(|e| DownloadError::Unreachable(format!("cannot create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

/// Reason phrase sent by the server, else the registered one for `status`.
fn reason_phrase(status: reqwest::StatusCode, sent: Option<&ReasonPhrase>) -> String {
    sent.and_then(|reason| std::str::from_utf8(reason.as_bytes()).ok())
        .or_else(|| status.canonical_reason())
        .unwrap_or("")
        .to_string()
}

fn map_reqwest_error(err: reqwest::Error) -> DownloadError {
    if err.is_timeout() {
        DownloadError::Timeout(err.to_string())
    } else if err.is_connect() || err.is_request() {
        DownloadError::Unreachable(err.to_string())
    } else {
        DownloadError::Transport {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            text: err.to_string(),
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse, DownloadError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if response.url() != url {
            debug!(from = %url, to = %response.url(), "Followed redirect");
        }

        Ok(HttpResponse {
            status: status.as_u16(),
            status_text: reason_phrase(status, response.extensions().get::<ReasonPhrase>()),
            content_length: response.content_length(),
            final_url: response.url().clone(),
            body: response.bytes_stream().map_err(map_reqwest_error).boxed(),
        })
    }
}
