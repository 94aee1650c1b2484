//! Assemble a [`Pipeline`] and [`JobTracker`] from an [`AppConfig`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};
use varnika_artifacts::ArtifactStore;
use varnika_crawler::{
    ConcurrentFetcher, ContentExtractor, HttpPageFetcher, PassthroughExtractor, page_client,
};
use varnika_discovery::{Discovery, DuckDuckGoSearch, LinkFilter, SearchCache, SerperSearch};
use varnika_gate::http::build_client;
use varnika_gate::{RateLimitGate, RetryPolicy};
use varnika_shared::{AppConfig, Result, UpstreamError, serper_api_key, validate_api_key};
use varnika_storage::{SourcesLedger, SqlJobStore, TrackerLease};

use crate::jobs::JobTracker;
use crate::llm::{ArticleWriter, ChatClient, LlmExtractor, LlmSummarizer, LlmWriter, Summarizer};
use crate::pipeline::Pipeline;

/// How long startup waits for another tracker to finish its own recovery.
const LEASE_WAIT: Duration = Duration::from_secs(10);

/// Stands in for the language model when no API key is configured.
///
/// Fetch still works through [`PassthroughExtractor`]; summarize and write
/// fail with a message naming the missing variable.
struct MissingKey {
    env: String,
}

impl MissingKey {
    fn error(&self) -> UpstreamError {
        UpstreamError::Failed(format!(
            "language model API key not found. Set the {} environment variable.",
            self.env
        ))
    }
}

#[async_trait]
impl Summarizer for MissingKey {
    async fn summarize(&self, _context: &str) -> std::result::Result<String, UpstreamError> {
        Err(self.error())
    }
}

#[async_trait]
impl ArticleWriter for MissingKey {
    async fn write(
        &self,
        _style: &str,
        _context: &str,
        _instruction: &str,
    ) -> std::result::Result<String, UpstreamError> {
        Err(self.error())
    }
}

/// Build the discovery service: DuckDuckGo first, Serper as fallback when
/// its key is set.
pub fn build_discovery(config: &AppConfig, gate: RateLimitGate) -> Result<Discovery> {
    let search = &config.search;
    let client = build_client(
        &config.fetch.user_agent,
        Duration::from_secs(config.fetch.timeout_secs),
    )?;

    let primary = DuckDuckGoSearch::new(client.clone(), &search.duckduckgo_endpoint, &search.region);
    let mut discovery = Discovery::new(Arc::new(primary), gate)
        .with_filter(LinkFilter::from_patterns(&search.blocked_patterns)?)
        .with_cache(SearchCache::from_config(&config.cache))
        .fallback_on_error(search.fallback_on_error);

    match serper_api_key(config) {
        Some(key) => {
            let serper = SerperSearch::new(client, &search.serper_endpoint, key, &search.region);
            discovery = discovery.with_secondary(Arc::new(serper));
        }
        None => info!(
            env = %search.serper_api_key_env,
            "no secondary search key, using the primary provider only"
        ),
    }
    Ok(discovery)
}

/// Retry policy for language model calls.
///
/// Backoff follows `[retry]`; each attempt may run for `llm.timeout_secs`.
pub fn llm_retry_policy(config: &AppConfig) -> RetryPolicy {
    let mut policy = RetryPolicy::from(&config.retry);
    policy.attempt_timeout = Duration::from_secs(config.llm.timeout_secs);
    policy.overall_timeout = policy.overall_timeout.max(policy.attempt_timeout);
    policy
}

/// Build the full pipeline from configuration.
pub fn build_pipeline(config: &AppConfig) -> Result<Pipeline> {
    config.validate()?;
    let gate = RateLimitGate::new(RetryPolicy::from(&config.retry));
    let llm_gate = RateLimitGate::new(llm_retry_policy(config));
    let discovery = build_discovery(config, gate.clone())?;

    let client = page_client(
        &config.fetch.user_agent,
        Duration::from_secs(config.fetch.timeout_secs),
        false,
    )?;
    let pages = HttpPageFetcher::new(client, config.fetch.max_content_chars);

    let llm = &config.llm;
    let (extractor, summarizer, writer): (
        Arc<dyn ContentExtractor>,
        Arc<dyn Summarizer>,
        Arc<dyn ArticleWriter>,
    ) = match validate_api_key(config) {
        Ok(key) => {
            let client = build_client(
                &config.fetch.user_agent,
                Duration::from_secs(llm.timeout_secs),
            )?;
            let chat = ChatClient::new(client, &llm.base_url, key);
            (
                Arc::new(LlmExtractor::new(chat.clone(), &llm.extraction_model)),
                Arc::new(LlmSummarizer::new(chat.clone(), &llm.summarizer_model)),
                Arc::new(LlmWriter::new(chat, &llm.writer_model)),
            )
        }
        Err(_) => {
            warn!(
                env = %llm.api_key_env,
                "no language model key, pages are kept verbatim and summarize/write will fail"
            );
            let missing = Arc::new(MissingKey {
                env: llm.api_key_env.clone(),
            });
            (
                Arc::new(PassthroughExtractor::new(config.fetch.max_content_chars)),
                missing.clone(),
                missing,
            )
        }
    };

    let fetcher = ConcurrentFetcher::new(Arc::new(pages), extractor, gate, config.fetch.concurrency)
        .with_extract_gate(llm_gate.clone());

    Ok(Pipeline::new(
        Arc::new(discovery),
        fetcher,
        summarizer,
        writer,
        Arc::new(SourcesLedger::from_config(config)),
        ArtifactStore::from_config(config),
        llm_gate,
    )
    .with_max_results(config.search.max_results))
}

/// Build a tracker backed by the job database, failing any jobs a previous
/// process left unfinished when no other tracker is using the database.
pub async fn build_tracker(config: &AppConfig) -> Result<JobTracker> {
    let pipeline = build_pipeline(config)?;
    let db_path = config.paths.jobs_db_path();
    let store = SqlJobStore::open(&db_path).await?;
    let lease = TrackerLease::acquire(&db_path, LEASE_WAIT).await?;
    let tracker = JobTracker::from_config(Arc::new(pipeline), Arc::new(store), &config.jobs)
        .with_lease(lease);

    tracker.recover_interrupted().await?;
    Ok(tracker)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use varnika_shared::{ErrorKind, Stage, StageSet};

    use super::*;
    use crate::pipeline::{PipelineOutput, PipelineRequest, SilentProgress};
    use crate::testing::paths;

    fn offline_config(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths = paths(dir.path());
        config.llm.api_key_env = "VARNIKA_TEST_KEY_THAT_IS_NEVER_SET".into();
        config.search.serper_api_key_env = "VARNIKA_TEST_SERPER_KEY_THAT_IS_NEVER_SET".into();
        config
    }

    #[test]
    fn pipeline_builds_without_keys() {
        let dir = TempDir::new().expect("tempdir");
        build_pipeline(&offline_config(&dir)).expect("pipeline");
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let mut config = offline_config(&dir);
        config.fetch.concurrency = 0;
        let err = build_pipeline(&config).err().expect("zero concurrency is invalid");
        assert_eq!(err.kind(), ErrorKind::Config);

        let mut config = offline_config(&dir);
        config.search.blocked_patterns = vec!["(".into()];
        assert!(build_pipeline(&config).is_err());
    }

    #[test]
    fn model_calls_get_the_model_timeout() {
        let config = AppConfig::default();
        let policy = llm_retry_policy(&config);
        assert_eq!(policy.attempt_timeout, Duration::from_secs(config.llm.timeout_secs));
        assert!(policy.attempt_timeout > RetryPolicy::from(&config.retry).attempt_timeout);
        assert!(policy.overall_timeout >= policy.attempt_timeout);
        assert_eq!(policy.max_attempts, config.retry.max_attempts.max(1));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_completion_fits_the_model_gate() {
        let gate = RateLimitGate::new(llm_retry_policy(&AppConfig::default()));
        let answer = gate
            .call("summarize", &CancellationToken::new(), || async {
                tokio::time::sleep(Duration::from_secs(45)).await;
                Ok::<_, UpstreamError>("done")
            })
            .await
            .expect("45s completion");
        assert_eq!(answer, "done");
    }

    #[tokio::test]
    async fn summarize_without_key_names_the_variable() {
        let dir = TempDir::new().expect("tempdir");
        let config = offline_config(&dir);
        let pipeline = build_pipeline(&config).expect("pipeline");
        pipeline
            .artifacts()
            .write_summary("already summarized")
            .expect("seed summary");

        let req = PipelineRequest::new(StageSet::single(Stage::Write))
            .with_query("qubits")
            .validate()
            .expect("valid");
        let mut out = PipelineOutput::default();
        let err = pipeline
            .run(
                &req,
                &SilentProgress,
                &CancellationToken::new(),
                &mut out,
            )
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("VARNIKA_TEST_KEY_THAT_IS_NEVER_SET"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn tracker_opens_job_database() {
        let dir = TempDir::new().expect("tempdir");
        let config = offline_config(&dir);
        let tracker = build_tracker(&config).await.expect("tracker");
        assert!(config.paths.jobs_db_path().exists());
        let page = tracker.list(10, 0).await.expect("list");
        assert!(page.jobs.is_empty());
    }

    #[tokio::test]
    async fn second_tracker_on_one_database_starts_alongside_the_first() {
        let dir = TempDir::new().expect("tempdir");
        let config = offline_config(&dir);
        let first = build_tracker(&config).await.expect("first tracker");
        let second = build_tracker(&config).await.expect("second tracker");
        assert_eq!(second.recover_interrupted().await.expect("recover"), 0);
        drop(first);
    }
}
