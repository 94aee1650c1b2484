//! Concurrent page fetching with per-URL failure isolation.
//!
//! [`ConcurrentFetcher::fetch_all`] fetches every URL through the rate-limited
//! gate, hands each page to a [`ContentExtractor`], and returns exactly one
//! [`FetchResult`] per input URL. A failing URL becomes a `success = false`
//! entry; it never aborts its siblings.

mod page;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;
use varnika_gate::RateLimitGate;
use varnika_shared::{FetchResult, UpstreamError, VarnikaError};

pub use page::{HttpPageFetcher, html_to_page, page_client, truncate_chars};

/// A downloaded page reduced to readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPage {
    pub url: String,
    pub title: Option<String>,
    /// Page body as Markdown.
    pub text: String,
    /// SHA-256 of the extracted text.
    pub content_hash: String,
}

/// Capability: fetch rendered page content for a URL.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<RawPage, UpstreamError>;
}

/// Capability: extract structured information relevant to `query` from a page.
#[async_trait]
pub trait ContentExtractor: Send + Sync {
    async fn extract(&self, page: &RawPage, query: &str) -> Result<String, UpstreamError>;
}

/// Extractor that keeps the page text as-is, cut to a maximum length.
#[derive(Debug, Clone)]
pub struct PassthroughExtractor {
    max_chars: usize,
}

impl PassthroughExtractor {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[async_trait]
impl ContentExtractor for PassthroughExtractor {
    async fn extract(&self, page: &RawPage, _query: &str) -> Result<String, UpstreamError> {
        Ok(truncate_chars(&page.text, self.max_chars))
    }
}

// ---------------------------------------------------------------------------
// ConcurrentFetcher
// ---------------------------------------------------------------------------

/// Bounded-parallelism fetch + extract over a list of URLs.
#[derive(Clone)]
pub struct ConcurrentFetcher {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn ContentExtractor>,
    gate: RateLimitGate,
    /// Extraction talks to the language model, which is slower than a page fetch.
    extract_gate: RateLimitGate,
    concurrency: usize,
}

impl ConcurrentFetcher {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Arc<dyn ContentExtractor>,
        gate: RateLimitGate,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            extract_gate: gate.clone(),
            gate,
            concurrency: concurrency.max(1),
        }
    }

    /// Run extraction through its own gate instead of the fetch gate.
    pub fn with_extract_gate(mut self, gate: RateLimitGate) -> Self {
        self.extract_gate = gate;
        self
    }

    /// Fetch and extract every URL. Returns one result per input, in input order.
    ///
    /// When `cancel` fires, unfinished URLs are reported as cancelled failures.
    #[instrument(skip_all, fields(urls = urls.len(), concurrency = self.concurrency))]
    pub async fn fetch_all(
        &self,
        urls: &[String],
        query: &str,
        cancel: &CancellationToken,
    ) -> Vec<FetchResult> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (idx, url) in urls.iter().enumerate() {
            let this = self.clone();
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let url = url.clone();
            let query = query.to_string();

            tasks.spawn(async move {
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return (idx, FetchResult::failure(url, VarnikaError::Cancelled.to_string(), 0));
                    }
                    permit = sem.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return (idx, FetchResult::failure(url, "fetch pool closed", 0));
                };
                (idx, this.fetch_one(url, &query, &cancel).await)
            });
        }

        let mut slots: Vec<Option<FetchResult>> = vec![None; urls.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(e) => warn!(error = %e, "fetch task did not complete"),
            }
        }

        let results: Vec<FetchResult> = slots
            .into_iter()
            .zip(urls)
            .map(|(slot, url)| {
                slot.unwrap_or_else(|| FetchResult::failure(url.clone(), "fetch task aborted", 0))
            })
            .collect();

        let succeeded = results.iter().filter(|r| r.success).count();
        info!(
            succeeded,
            failed = results.len() - succeeded,
            "fetch complete"
        );
        results
    }

    async fn fetch_one(&self, url: String, query: &str, cancel: &CancellationToken) -> FetchResult {
        let start = Instant::now();
        let elapsed_ms = || start.elapsed().as_millis() as u64;

        let parsed = match Url::parse(&url) {
            Ok(u) => u,
            Err(e) => return FetchResult::failure(url, format!("invalid URL: {e}"), 0),
        };

        let page = match self
            .gate
            .call("fetch", cancel, || self.fetcher.fetch(&parsed))
            .await
        {
            Ok(page) => page,
            Err(e) => {
                debug!(%url, error = %e, "fetch failed");
                return FetchResult::failure(url, e.to_string(), elapsed_ms());
            }
        };

        match self
            .extract_gate
            .call("extract", cancel, || self.extractor.extract(&page, query))
            .await
        {
            Ok(summary) => FetchResult::success(url, page.title, summary, elapsed_ms()),
            Err(e) => {
                debug!(%url, error = %e, "extraction failed");
                FetchResult::failure(url, e.to_string(), elapsed_ms())
            }
        }
    }
}
