//! Stub capabilities shared by the pipeline and tracker tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;
use varnika_artifacts::ArtifactStore;
use varnika_crawler::{ConcurrentFetcher, PageFetcher, PassthroughExtractor, RawPage};
use varnika_discovery::{Discovery, SearchHit, SearchProvider};
use varnika_gate::{RateLimitGate, RetryPolicy};
use varnika_shared::{PathsConfig, UpstreamError};
use varnika_storage::SourcesLedger;

use crate::llm::{ArticleWriter, Summarizer};
use crate::pipeline::Pipeline;

pub const URL_A_FAILS: &str = "https://a.example/fail";
pub const URL_B_OK: &str = "https://b.example/ok";

struct StubSearch {
    urls: Vec<String>,
}

#[async_trait]
impl SearchProvider for StubSearch {
    fn name(&self) -> &str {
        "stub"
    }

    async fn search(&self, _query: &str, max: usize) -> Result<Vec<SearchHit>, UpstreamError> {
        Ok(self
            .urls
            .iter()
            .take(max)
            .map(|u| SearchHit {
                url: u.clone(),
                title: String::new(),
                snippet: String::new(),
            })
            .collect())
    }
}

/// Fails for any URL containing "fail".
struct StubPages;

#[async_trait]
impl PageFetcher for StubPages {
    async fn fetch(&self, url: &Url) -> Result<RawPage, UpstreamError> {
        if url.as_str().contains("fail") {
            return Err(UpstreamError::NotReachable(format!("{url}: connection refused")));
        }
        Ok(RawPage {
            url: url.to_string(),
            title: Some("Page".into()),
            text: format!("content of {url}"),
            content_hash: String::new(),
        })
    }
}

struct StubSummarizer {
    delay: Duration,
}

#[async_trait]
impl Summarizer for StubSummarizer {
    async fn summarize(&self, context: &str) -> Result<String, UpstreamError> {
        tokio::time::sleep(self.delay).await;
        Ok(format!("summary of {context}"))
    }
}

/// Echoes the instruction and context back as the article.
struct StubWriter;

#[async_trait]
impl ArticleWriter for StubWriter {
    async fn write(
        &self,
        _style: &str,
        context: &str,
        instruction: &str,
    ) -> Result<String, UpstreamError> {
        Ok(format!("{instruction}\n\n{context}"))
    }
}

pub fn fast_gate() -> RateLimitGate {
    RateLimitGate::new(RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        jitter: 0.0,
        attempt_timeout: Duration::from_secs(60),
        overall_timeout: Duration::from_secs(600),
    })
}

pub fn paths(dir: &Path) -> PathsConfig {
    PathsConfig {
        data_dir: dir.join("data").display().to_string(),
        articles_dir: dir.join("articles").display().to_string(),
        ..PathsConfig::default()
    }
}

/// A pipeline over stubs whose search returns `urls`, rooted at `dir`.
pub fn pipeline(dir: &Path, urls: &[&str]) -> Pipeline {
    pipeline_with_delay(dir, urls, Duration::ZERO)
}

/// Like [`pipeline`], with a summarizer that takes `delay` per call.
pub fn pipeline_with_delay(dir: &Path, urls: &[&str], delay: Duration) -> Pipeline {
    let gate = fast_gate();
    let search = StubSearch {
        urls: urls.iter().map(|u| u.to_string()).collect(),
    };
    let discovery = Discovery::new(Arc::new(search), gate.clone());
    let fetcher = ConcurrentFetcher::new(
        Arc::new(StubPages),
        Arc::new(PassthroughExtractor::new(1000)),
        gate.clone(),
        2,
    );
    let paths = paths(dir);
    let ledger = SourcesLedger::new(paths.sources_path(), paths.backups_dir());

    Pipeline::new(
        Arc::new(discovery),
        fetcher,
        Arc::new(StubSummarizer { delay }),
        Arc::new(StubWriter),
        Arc::new(ledger),
        ArtifactStore::new(&paths),
        gate,
    )
}
