//! Source discovery: turn a query into a ranked, de-duplicated list of URLs.
//!
//! The primary search capability is tried first. When it is rate limited past
//! the retry budget, or returns nothing usable, the secondary capability is
//! asked instead. Whether other primary errors also fall back is a policy
//! switch (`fallback_on_error`).

mod cache;
mod filter;
mod providers;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use varnika_gate::RateLimitGate;
use varnika_shared::{ErrorKind, Result, UpstreamError, VarnikaError};

pub use cache::SearchCache;
pub use filter::{LinkFilter, dedupe_urls, rank_hits, relevance};
pub use providers::{DuckDuckGoSearch, SerperSearch};

/// One search result as returned by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: String,
}

/// Capability: fetch candidate URLs for a query.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Short name used in logs and cache keys.
    fn name(&self) -> &str;

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> std::result::Result<Vec<SearchHit>, UpstreamError>;
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Primary/secondary search with fallback, filtering and ranking.
pub struct Discovery {
    primary: Arc<dyn SearchProvider>,
    secondary: Option<Arc<dyn SearchProvider>>,
    gate: RateLimitGate,
    filter: LinkFilter,
    fallback_on_error: bool,
    cache: Option<SearchCache>,
}

impl Discovery {
    pub fn new(primary: Arc<dyn SearchProvider>, gate: RateLimitGate) -> Self {
        Self {
            primary,
            secondary: None,
            gate,
            filter: LinkFilter::default(),
            fallback_on_error: true,
            cache: None,
        }
    }

    pub fn with_secondary(mut self, secondary: Arc<dyn SearchProvider>) -> Self {
        self.secondary = Some(secondary);
        self
    }

    pub fn with_filter(mut self, filter: LinkFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_cache(mut self, cache: Option<SearchCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Also fall back when the primary fails for reasons other than rate limiting.
    pub fn fallback_on_error(mut self, enabled: bool) -> Self {
        self.fallback_on_error = enabled;
        self
    }

    /// Discover up to `max_results` URLs for `query`.
    #[instrument(skip_all, fields(query = %query, max_results = max_results))]
    pub async fn discover(
        &self,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(VarnikaError::validation("search query is empty"));
        }
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let primary_error = match self.search(&*self.primary, query, max_results, cancel).await {
            Ok(hits) => {
                let urls = dedupe_urls(&hits, &self.filter, max_results);
                if !urls.is_empty() {
                    info!(provider = self.primary.name(), count = urls.len(), "sources discovered");
                    return Ok(urls);
                }
                info!(provider = self.primary.name(), "no usable results from primary");
                None
            }
            Err(e) => match e.kind() {
                ErrorKind::Cancelled => return Err(e),
                ErrorKind::RateLimitExceeded => {
                    warn!(provider = self.primary.name(), "primary rate limited, falling back");
                    Some(e)
                }
                _ if self.fallback_on_error => {
                    warn!(provider = self.primary.name(), error = %e, "primary failed, falling back");
                    Some(e)
                }
                _ => return Err(e),
            },
        };

        let Some(secondary) = &self.secondary else {
            return Err(primary_error.unwrap_or_else(|| no_sources(query)));
        };

        let hits = self.search(&**secondary, query, max_results, cancel).await?;
        let ranked = rank_hits(query, hits);
        let urls = dedupe_urls(&ranked, &self.filter, max_results);
        if urls.is_empty() {
            return Err(no_sources(query));
        }
        info!(provider = secondary.name(), count = urls.len(), "sources discovered");
        Ok(urls)
    }

    async fn search(
        &self,
        provider: &dyn SearchProvider,
        query: &str,
        max_results: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let key = SearchCache::key(provider.name(), query, max_results);
        if let Some(hits) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!(provider = provider.name(), "search cache hit");
            return Ok(hits);
        }

        let hits = self
            .gate
            .call(provider.name(), cancel, || provider.search(query, max_results))
            .await?;

        if let Some(cache) = &self.cache {
            cache.insert(key, hits.clone());
        }
        Ok(hits)
    }
}

fn no_sources(query: &str) -> VarnikaError {
    VarnikaError::Upstream(format!("no sources found for '{query}'"))
}
