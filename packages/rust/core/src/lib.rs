//! Pipeline orchestration for varnika.
//!
//! [`pipeline::Pipeline`] runs the discover, fetch, summarize and write
//! stages over the lower crates; [`jobs::JobTracker`] runs pipelines as
//! background jobs with progress, cancellation and timeouts.

pub mod jobs;
pub mod llm;
pub mod pipeline;
pub mod setup;

#[cfg(test)]
mod testing;

pub use jobs::JobTracker;
pub use pipeline::{
    CUSTOM_URLS_TOPIC, Pipeline, PipelineOutput, PipelineRequest, ProgressReporter, SavedArticle,
    SilentProgress,
};
pub use setup::{build_discovery, build_pipeline, build_tracker};
