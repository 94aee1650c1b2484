//! The stage pipeline: discover → fetch → summarize → write.
//!
//! Any non-empty subset of stages may be requested. Stages run in pipeline
//! order; each one consumes the previous stage's output, or, when that stage
//! was not requested, the artifact a previous run persisted to disk.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use varnika_artifacts::{ArtifactStore, article_file_name};
use varnika_crawler::ConcurrentFetcher;
use varnika_discovery::Discovery;
use varnika_gate::RateLimitGate;
use varnika_shared::{
    ArticleFormat, FetchResult, Result, SourceEntry, Stage, StageSet, VarnikaError, is_http_url,
};
use varnika_storage::SourcesLedger;

use crate::llm::{ArticleWriter, Summarizer};

/// Ledger topic for URL-only requests.
pub const CUSTOM_URLS_TOPIC: &str = "Custom URLs";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// What a caller asks the pipeline to do.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub stages: StageSet,
    pub query: Option<String>,
    pub urls: Vec<String>,
    pub format: ArticleFormat,
    pub output_name: Option<String>,
    /// Overrides the configured discovery limit.
    pub max_results: Option<usize>,
    /// Record discovered or explicitly given URLs in the sources ledger.
    pub save_to_sources: bool,
}

impl PipelineRequest {
    pub fn new(stages: StageSet) -> Self {
        Self {
            stages,
            query: None,
            urls: Vec::new(),
            format: ArticleFormat::default(),
            output_name: None,
            max_results: None,
            save_to_sources: true,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_urls(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_format(mut self, format: ArticleFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_output_name(mut self, name: impl Into<String>) -> Self {
        self.output_name = Some(name.into());
        self
    }

    /// The ledger topic for this request.
    pub fn topic(&self) -> &str {
        self.query.as_deref().unwrap_or(CUSTOM_URLS_TOPIC)
    }

    /// Normalize the request and reject ones no stage could act on.
    ///
    /// Blank queries become `None`; URLs that are not http(s) are dropped
    /// with a warning.
    pub fn validate(mut self) -> Result<Self> {
        self.query = self
            .query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty());

        let given = self.urls.len();
        self.urls = std::mem::take(&mut self.urls)
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| {
                let ok = is_http_url(u);
                if !ok {
                    warn!(url = %u, "skipping invalid URL");
                }
                ok
            })
            .collect();

        if self.query.is_none() && self.urls.is_empty() {
            if given > 0 {
                return Err(VarnikaError::validation(
                    "none of the given URLs is a valid http(s) URL",
                ));
            }
            if self.stages.contains(Stage::Discover) || self.stages.contains(Stage::Fetch) {
                return Err(VarnikaError::validation(
                    "a query or at least one URL is required",
                ));
            }
        }
        if self.stages.contains(Stage::Discover) && self.query.is_none() {
            return Err(VarnikaError::validation("the discover stage needs a query"));
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// Location of a saved article.
#[derive(Debug, Clone, Serialize)]
pub struct SavedArticle {
    pub name: String,
    pub path: String,
}

/// Everything the pipeline produced. Filled in stage by stage, so a failed
/// run still carries the output of the stages that finished.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineOutput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub discovered: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_added: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fetched: Vec<FetchResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub article: Option<SavedArticle>,
}

impl PipelineOutput {
    pub fn is_empty(&self) -> bool {
        self.discovered.is_empty()
            && self.sources_added.is_none()
            && self.fetched.is_empty()
            && self.summary.is_none()
            && self.article.is_none()
    }

    pub fn succeeded(&self) -> usize {
        self.fetched.iter().filter(|r| r.success).count()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Receives stage boundaries as the pipeline advances.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn stage(&self, stage: Stage, progress: u8, message: String);
}

/// No-op reporter for headless/test usage.
pub struct SilentProgress;

#[async_trait]
impl ProgressReporter for SilentProgress {
    async fn stage(&self, _stage: Stage, _progress: u8, _message: String) {}
}

/// Progress at the start of stage `index` (zero-based) out of `total`.
pub fn stage_progress(index: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (index.min(total) * 100 / total) as u8
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline {
    discovery: Arc<Discovery>,
    fetcher: ConcurrentFetcher,
    summarizer: Arc<dyn Summarizer>,
    writer: Arc<dyn ArticleWriter>,
    ledger: Arc<SourcesLedger>,
    artifacts: ArtifactStore,
    /// Gate for summarize and write model calls.
    gate: RateLimitGate,
    max_results: usize,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("artifacts", &self.artifacts)
            .field("max_results", &self.max_results)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        discovery: Arc<Discovery>,
        fetcher: ConcurrentFetcher,
        summarizer: Arc<dyn Summarizer>,
        writer: Arc<dyn ArticleWriter>,
        ledger: Arc<SourcesLedger>,
        artifacts: ArtifactStore,
        gate: RateLimitGate,
    ) -> Self {
        Self {
            discovery,
            fetcher,
            summarizer,
            writer,
            ledger,
            artifacts,
            gate,
            max_results: 6,
        }
    }

    /// Default discovery limit when the request does not set one.
    pub fn with_max_results(mut self, max_results: usize) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn ledger(&self) -> &SourcesLedger {
        &self.ledger
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Run the requested stages in order, recording output into `out`.
    ///
    /// The first failing stage stops the run; `out` keeps what earlier stages
    /// produced.
    #[instrument(skip_all, fields(stages = %req.stages, topic = %req.topic()))]
    pub async fn run(
        &self,
        req: &PipelineRequest,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let total = req.stages.len();
        for (index, stage) in req.stages.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(VarnikaError::Cancelled);
            }
            progress
                .stage(
                    stage,
                    stage_progress(index, total),
                    format!("{} ({}/{total})", capitalize(stage.label()), index + 1),
                )
                .await;
            info!(%stage, "stage started");

            match stage {
                Stage::Discover => self.discover(req, cancel, out).await?,
                Stage::Fetch => self.fetch(req, cancel, out).await?,
                Stage::Summarize => self.summarize(req, cancel, out).await?,
                Stage::Write => self.write(req, cancel, out).await?,
            }
        }
        Ok(())
    }

    async fn discover(
        &self,
        req: &PipelineRequest,
        cancel: &CancellationToken,
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let query = req
            .query
            .as_deref()
            .ok_or_else(|| VarnikaError::validation("the discover stage needs a query"))?;
        let max_results = req.max_results.unwrap_or(self.max_results);

        out.discovered = self.discovery.discover(query, max_results, cancel).await?;

        if req.save_to_sources {
            let urls = out.discovered.clone();
            self.record_sources(req.topic(), &urls, out).await?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        req: &PipelineRequest,
        cancel: &CancellationToken,
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let urls = if req.stages.contains(Stage::Discover) {
            out.discovered.clone()
        } else if !req.urls.is_empty() {
            if req.save_to_sources {
                self.record_sources(req.topic(), &req.urls, out).await?;
            }
            req.urls.clone()
        } else {
            self.saved_urls(req.topic()).await?
        };

        let results = self.fetcher.fetch_all(&urls, req.topic(), cancel).await;
        out.fetched = results;
        if cancel.is_cancelled() {
            return Err(VarnikaError::Cancelled);
        }

        let succeeded = out.succeeded();
        if succeeded == 0 {
            return Err(VarnikaError::Upstream(format!(
                "all {} URLs failed to fetch",
                out.fetched.len()
            )));
        }
        let fetched = out.fetched.clone();
        self.on_artifacts(move |a| a.write_context(&fetched)).await?;
        info!(
            succeeded,
            failed = out.fetched.len() - succeeded,
            "extracted context saved"
        );
        Ok(())
    }

    async fn summarize(
        &self,
        req: &PipelineRequest,
        cancel: &CancellationToken,
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let context = if req.stages.contains(Stage::Fetch) {
            render_context(&out.fetched)
        } else {
            render_context(&self.on_artifacts(|a| a.read_context()).await?)
        };
        if context.trim().is_empty() {
            return Err(VarnikaError::validation("no extracted context to summarize"));
        }

        let summary = self
            .gate
            .call("summarize", cancel, || self.summarizer.summarize(&context))
            .await?;
        let saved = summary.clone();
        self.on_artifacts(move |a| a.write_summary(&saved)).await?;
        out.summary = Some(summary);
        Ok(())
    }

    async fn write(
        &self,
        req: &PipelineRequest,
        cancel: &CancellationToken,
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let context = match (&out.summary, req.stages.contains(Stage::Summarize)) {
            (Some(summary), true) => summary.clone(),
            _ => self.on_artifacts(|a| a.read_summary()).await?,
        };
        if context.trim().is_empty() {
            return Err(VarnikaError::validation("no condensed context to write from"));
        }

        let style = self.on_artifacts(|a| a.writing_style()).await?;
        let instruction = req.format.instruction();
        let article = self
            .gate
            .call("write", cancel, || {
                self.writer.write(&style, &context, instruction)
            })
            .await?;

        let name = article_file_name(
            req.query.as_deref().unwrap_or("untitled"),
            req.output_name.as_deref(),
            Utc::now().date_naive(),
        );
        let meta = self
            .on_artifacts(move |a| a.write_article(&name, &article))
            .await?;
        out.article = Some(SavedArticle {
            name: meta.name,
            path: meta.path.display().to_string(),
        });
        Ok(())
    }

    /// Run artifact file I/O on the blocking pool.
    async fn on_artifacts<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ArtifactStore) -> Result<T> + Send + 'static,
    {
        let store = self.artifacts.clone();
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(|e| VarnikaError::Storage(format!("artifact task failed: {e}")))?
    }

    async fn record_sources(
        &self,
        topic: &str,
        urls: &[String],
        out: &mut PipelineOutput,
    ) -> Result<()> {
        let entries: Vec<SourceEntry> = urls.iter().map(SourceEntry::new).collect();
        let outcome = self.ledger.append(topic, &entries).await?;
        *out.sources_added.get_or_insert(0) += outcome.added;
        Ok(())
    }

    /// URLs saved in the ledger under `topic`, for fetch runs without discovery.
    async fn saved_urls(&self, topic: &str) -> Result<Vec<String>> {
        let urls: Vec<String> = self
            .ledger
            .records()
            .await?
            .into_iter()
            .filter(|r| r.topic.eq_ignore_ascii_case(topic))
            .flat_map(|r| r.entries.into_iter().map(|e| e.url))
            .collect();
        if urls.is_empty() {
            return Err(VarnikaError::not_found(format!(
                "no saved sources for topic '{topic}'"
            )));
        }
        Ok(urls)
    }
}

/// Successful fetch results as plain text for the summarizer.
pub fn render_context(results: &[FetchResult]) -> String {
    results
        .iter()
        .filter(|r| r.success)
        .filter_map(|r| {
            let summary = r.summary.as_deref()?.trim();
            if summary.is_empty() {
                return None;
            }
            let heading = r.title.as_deref().unwrap_or(&r.url);
            Some(format!("## {heading}\nSource: {}\n\n{summary}\n", r.url))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
