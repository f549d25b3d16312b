//! Fakes shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use url::Url;

use crate::download::Sink;
use crate::error::DownloadError;
use crate::transport::{HttpResponse, HttpTransport};

#[derive(Clone, Default)]
struct Route {
    status: u16,
    status_text: String,
    chunks: Vec<Bytes>,
    content_length: Option<u64>,
    /// Error yielded by the body stream after all chunks.
    tail_error: Option<DownloadError>,
    /// Head errors returned before the route starts answering.
    head_failures: Vec<DownloadError>,
}

/// Scripted [`HttpTransport`].
#[derive(Default)]
pub(crate) struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<String>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn route(&self, url: &str, route: Route) {
        self.routes.lock().unwrap().insert(url.to_string(), route);
    }

    pub(crate) fn serve(&self, url: &str, body: &[u8]) {
        self.serve_chunks(url, vec![body.to_vec()], Some(body.len() as u64));
    }

    pub(crate) fn serve_chunks(&self, url: &str, chunks: Vec<Vec<u8>>, content_length: Option<u64>) {
        self.route(
            url,
            Route {
                status: 200,
                status_text: "OK".into(),
                chunks: chunks.into_iter().map(Bytes::from).collect(),
                content_length,
                ..Route::default()
            },
        );
    }

    pub(crate) fn status(&self, url: &str, status: u16, text: &str) {
        self.route(
            url,
            Route {
                status,
                status_text: text.into(),
                ..Route::default()
            },
        );
    }

    pub(crate) fn break_after(&self, url: &str, chunks: Vec<Vec<u8>>, error: DownloadError) {
        let total = chunks.iter().map(Vec::len).sum::<usize>() as u64 * 2;
        self.route(
            url,
            Route {
                status: 200,
                status_text: "OK".into(),
                chunks: chunks.into_iter().map(Bytes::from).collect(),
                content_length: Some(total),
                tail_error: Some(error),
                ..Route::default()
            },
        );
    }

    /// Fail the next `errors.len()` requests to `url` before answering.
    pub(crate) fn fail_first(&self, url: &str, errors: Vec<DownloadError>) {
        let mut routes = self.routes.lock().unwrap();
        let route = routes.entry(url.to_string()).or_default();
        route.head_failures = errors;
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn get(&self, url: &Url) -> Result<HttpResponse, DownloadError> {
        self.requests.lock().unwrap().push(url.to_string());

        let route = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url.as_str()) {
                Some(route) if !route.head_failures.is_empty() => {
                    return Err(route.head_failures.remove(0));
                }
                Some(route) => route.clone(),
                None => Route {
                    status: 404,
                    status_text: "Not Found".into(),
                    ..Route::default()
                },
            }
        };

        let mut items: Vec<Result<Bytes, DownloadError>> =
            route.chunks.into_iter().map(Ok).collect();
        if let Some(err) = route.tail_error {
            items.push(Err(err));
        }

        Ok(HttpResponse {
            status: route.status,
            status_text: route.status_text,
            content_length: route.content_length,
            final_url: url.clone(),
            body: futures_util::stream::iter(items).boxed(),
        })
    }
}

/// Sink that counts lifecycle calls and can trigger a callback per append.
#[derive(Clone, Default)]
pub(crate) struct CountingSink {
    pub(crate) data: Arc<Mutex<Vec<u8>>>,
    pub(crate) size: Arc<Mutex<Option<u64>>>,
    pub(crate) opens: Arc<AtomicUsize>,
    pub(crate) closes: Arc<AtomicUsize>,
    pub(crate) on_append: Option<Arc<dyn Fn(u64) + Send + Sync>>,
}

impl std::fmt::Debug for CountingSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CountingSink")
            .field("len", &self.len())
            .field("opens", &self.opens())
            .field("closes", &self.closes())
            .field("on_append", &self.on_append.is_some())
            .finish()
    }
}

impl CountingSink {
    pub(crate) fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl Sink for CountingSink {
    fn set_size(&mut self, size: Option<u64>) -> Result<(), DownloadError> {
        *self.size.lock().unwrap() = size;
        Ok(())
    }

    fn open(&mut self) -> Result<(), DownloadError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn append(&mut self, chunk: &[u8]) -> Result<(), DownloadError> {
        let done = {
            let mut data = self.data.lock().unwrap();
            data.extend_from_slice(chunk);
            data.len() as u64
        };
        if let Some(hook) = &self.on_append {
            hook(done);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DownloadError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
