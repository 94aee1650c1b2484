//! Shared types, error model, and configuration for Varnika.
//!
//! This crate is the foundation depended on by all other Varnika crates.
//! It provides:
//! - [`VarnikaError`] and [`UpstreamError`], the error model
//! - Domain types ([`Job`], [`StageSet`], [`SourceRecord`], [`FetchResult`], [`JobId`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod job;
pub mod types;
pub mod urls;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, FetchConfig, JobsConfig, LedgerConfig, LlmConfig, PathsConfig,
    RetryConfig, SearchConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, render_config, serper_api_key, validate_api_key,
};
pub use error::{ErrorKind, Result, UpstreamError, VarnikaError};
pub use job::{Job, JobError, Transition};
pub use types::{
    ArticleFormat, FetchResult, JobId, JobStatus, SourceEntry, SourceRecord, Stage, StageSet,
};
pub use urls::{is_http_url, normalize_url};
