//! Core domain types for Varnika pipelines.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VarnikaError};

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for job identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One phase of the pipeline. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discover,
    Fetch,
    Summarize,
    Write,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Discover, Stage::Fetch, Stage::Summarize, Stage::Write];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Fetch => "fetch",
            Self::Summarize => "summarize",
            Self::Write => "write",
        }
    }

    /// Label shown while the stage is running.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Discover => "discovering",
            Self::Fetch => "fetching",
            Self::Summarize => "summarizing",
            Self::Write => "writing",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = VarnikaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discover" | "discovering" | "search" => Ok(Self::Discover),
            "fetch" | "fetching" | "extract" => Ok(Self::Fetch),
            "summarize" | "summarizing" | "summarise" => Ok(Self::Summarize),
            "write" | "writing" => Ok(Self::Write),
            other => Err(VarnikaError::validation(format!(
                "unknown stage '{other}' (expected discover, fetch, summarize or write)"
            ))),
        }
    }
}

/// A non-empty set of stages, always iterated in pipeline order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Stage>", into = "Vec<Stage>")]
pub struct StageSet(BTreeSet<Stage>);

impl StageSet {
    pub fn new(stages: impl IntoIterator<Item = Stage>) -> Result<Self> {
        let set: BTreeSet<Stage> = stages.into_iter().collect();
        if set.is_empty() {
            return Err(VarnikaError::validation("at least one stage must be requested"));
        }
        Ok(Self(set))
    }

    /// Every stage, discover through write.
    pub fn all() -> Self {
        Self(Stage::ALL.into_iter().collect())
    }

    pub fn single(stage: Stage) -> Self {
        Self(BTreeSet::from([stage]))
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0.contains(&stage)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        self.0.iter().copied()
    }
}

impl TryFrom<Vec<Stage>> for StageSet {
    type Error = VarnikaError;

    fn try_from(stages: Vec<Stage>) -> Result<Self> {
        Self::new(stages)
    }
}

impl From<StageSet> for Vec<Stage> {
    fn from(set: StageSet) -> Self {
        set.0.into_iter().collect()
    }
}

impl std::fmt::Display for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.iter().map(|s| s.as_str()).collect();
        f.write_str(&names.join("+"))
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = VarnikaError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(VarnikaError::validation(format!("unknown job status '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ArticleFormat
// ---------------------------------------------------------------------------

/// Shape of the generated article.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleFormat {
    #[default]
    Detailed,
    Summarized,
    Points,
}

impl ArticleFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detailed => "detailed",
            Self::Summarized => "summarized",
            Self::Points => "points",
        }
    }

    /// Instruction handed to the writing capability.
    pub fn instruction(&self) -> &'static str {
        match self {
            Self::Detailed => "Write a detailed comprehensive article based on the provided context",
            Self::Summarized => "Write a concise summary article based on the provided context",
            Self::Points => "Write an article in bullet points based on the provided context",
        }
    }
}

impl std::fmt::Display for ArticleFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ArticleFormat {
    type Err = VarnikaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detailed" => Ok(Self::Detailed),
            "summarized" | "summary" => Ok(Self::Summarized),
            "points" | "bullets" => Ok(Self::Points),
            other => Err(VarnikaError::validation(format!(
                "unknown article format '{other}' (expected detailed, summarized or points)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Source records
// ---------------------------------------------------------------------------

/// One URL in the sources ledger, with an optional extracted summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// A topic heading in the ledger and the sources listed under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub topic: String,
    pub entries: Vec<SourceEntry>,
}

impl SourceRecord {
    pub fn urls(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.url.as_str())
    }
}

// ---------------------------------------------------------------------------
// FetchResult
// ---------------------------------------------------------------------------

/// Outcome of fetching and extracting one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub success: bool,
    /// Page title, when the page had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Extracted summary text (present on success).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Failure reason (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl FetchResult {
    pub fn success(
        url: impl Into<String>,
        title: Option<String>,
        summary: impl Into<String>,
        elapsed_ms: u64,
    ) -> Self {
        Self {
            url: url.into(),
            success: true,
            title,
            summary: Some(summary.into()),
            error: None,
            elapsed_ms,
        }
    }

    pub fn failure(url: impl Into<String>, error: impl Into<String>, elapsed_ms: u64) -> Self {
        Self {
            url: url.into(),
            success: false,
            title: None,
            summary: None,
            error: Some(error.into()),
            elapsed_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_display_and_parse() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().expect("parse JobId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn job_ids_are_time_ordered() {
        let a = JobId::new();
        let b = JobId::new();
        assert!(a < b);
    }

    #[test]
    fn stage_set_is_ordered_and_deduped() {
        let set = StageSet::new([Stage::Write, Stage::Discover, Stage::Write]).expect("set");
        let stages: Vec<Stage> = set.iter().collect();
        assert_eq!(stages, vec![Stage::Discover, Stage::Write]);
        assert!(set.contains(Stage::Write));
        assert_eq!(set.to_string(), "discover+write");
    }

    #[test]
    fn empty_stage_set_is_rejected() {
        let err = StageSet::new(Vec::new()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ValidationError);

        let json_err = serde_json::from_str::<StageSet>("[]");
        assert!(json_err.is_err());
    }

    #[test]
    fn stage_parses_labels_and_names() {
        assert_eq!("fetching".parse::<Stage>().expect("stage"), Stage::Fetch);
        assert_eq!("Write".parse::<Stage>().expect("stage"), Stage::Write);
        assert!("publish".parse::<Stage>().is_err());
    }

    #[test]
    fn article_format_instructions() {
        let fmt: ArticleFormat = "points".parse().expect("format");
        assert!(fmt.instruction().contains("bullet points"));
        assert_eq!(ArticleFormat::default(), ArticleFormat::Detailed);
    }

    #[test]
    fn fetch_result_serialization_skips_empty_fields() {
        let ok = FetchResult::success("https://a.example/", None, "text", 12);
        let json = serde_json::to_string(&ok).expect("serialize");
        assert!(!json.contains("error"));

        let failed = FetchResult::failure("https://b.example/", "HTTP 404", 3);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("HTTP 404"));
    }
}
