//! Application configuration for Varnika.
//!
//! User config lives at `~/.varnika/varnika.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VarnikaError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "varnika.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".varnika";

// ---------------------------------------------------------------------------
// Config structs (matching varnika.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Where artifacts and the sources ledger live.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Search providers and discovery policy.
    #[serde(default)]
    pub search: SearchConfig,

    /// Backoff policy for rate-limited calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Page fetching.
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Language-model endpoint and models.
    #[serde(default)]
    pub llm: LlmConfig,

    /// Sources ledger locking and backups.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Job tracker limits.
    #[serde(default)]
    pub jobs: JobsConfig,

    /// In-memory search cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_articles_dir")]
    pub articles_dir: String,
    #[serde(default = "default_sources_file")]
    pub sources_file: String,
    #[serde(default = "default_context_json")]
    pub context_json: String,
    #[serde(default = "default_context_txt")]
    pub context_txt: String,
    #[serde(default = "default_writing_style")]
    pub writing_style: String,
    #[serde(default = "default_jobs_db")]
    pub jobs_db: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            articles_dir: default_articles_dir(),
            sources_file: default_sources_file(),
            context_json: default_context_json(),
            context_txt: default_context_txt(),
            writing_style: default_writing_style(),
            jobs_db: default_jobs_db(),
        }
    }
}

impl PathsConfig {
    fn in_data_dir(&self, name: &str) -> PathBuf {
        Path::new(&self.data_dir).join(name)
    }

    pub fn sources_path(&self) -> PathBuf {
        self.in_data_dir(&self.sources_file)
    }

    /// Backups of the sources ledger sit next to it.
    pub fn backups_dir(&self) -> PathBuf {
        self.in_data_dir("backups")
    }

    pub fn context_json_path(&self) -> PathBuf {
        self.in_data_dir(&self.context_json)
    }

    pub fn context_txt_path(&self) -> PathBuf {
        self.in_data_dir(&self.context_txt)
    }

    pub fn writing_style_path(&self) -> PathBuf {
        self.in_data_dir(&self.writing_style)
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.in_data_dir(&self.jobs_db)
    }

    pub fn articles_path(&self) -> PathBuf {
        PathBuf::from(&self.articles_dir)
    }
}

fn default_data_dir() -> String {
    "./data".into()
}
fn default_articles_dir() -> String {
    "./articles".into()
}
fn default_sources_file() -> String {
    "sources.md".into()
}
fn default_context_json() -> String {
    "context.json".into()
}
fn default_context_txt() -> String {
    "context.txt".into()
}
fn default_writing_style() -> String {
    "writing_style.txt".into()
}
fn default_jobs_db() -> String {
    "jobs.db".into()
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Default number of URLs returned by discovery.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    #[serde(default = "default_duckduckgo_endpoint")]
    pub duckduckgo_endpoint: String,

    #[serde(default = "default_serper_endpoint")]
    pub serper_endpoint: String,

    /// Name of the env var holding the Serper key (never store the key itself).
    #[serde(default = "default_serper_api_key_env")]
    pub serper_api_key_env: String,

    /// Region hint passed to the providers.
    #[serde(default = "default_region")]
    pub region: String,

    /// Regex patterns for links that never carry article content.
    #[serde(default = "default_blocked_patterns")]
    pub blocked_patterns: Vec<String>,

    /// Fall back to the secondary provider on any primary error, not only
    /// on rate limiting or an empty result.
    #[serde(default = "default_true")]
    pub fallback_on_error: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            duckduckgo_endpoint: default_duckduckgo_endpoint(),
            serper_endpoint: default_serper_endpoint(),
            serper_api_key_env: default_serper_api_key_env(),
            region: default_region(),
            blocked_patterns: default_blocked_patterns(),
            fallback_on_error: true,
        }
    }
}

fn default_max_results() -> usize {
    6
}
fn default_duckduckgo_endpoint() -> String {
    "https://html.duckduckgo.com/html/".into()
}
fn default_serper_endpoint() -> String {
    "https://google.serper.dev/search".into()
}
fn default_serper_api_key_env() -> String {
    "SERPER_API_KEY".into()
}
fn default_region() -> String {
    "in".into()
}
fn default_blocked_patterns() -> Vec<String> {
    vec![
        r"(^|\.)youtube\.com/".into(),
        r"(^|\.)youtu\.be/".into(),
        r"(^|\.)vimeo\.com/".into(),
        r"(^|\.)tiktok\.com/".into(),
    ]
}
fn default_true() -> bool {
    true
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts for a rate-limited call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay (0.2 = +/-20%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Wall-clock cap for the whole retry loop.
    #[serde(default = "default_overall_timeout_secs")]
    pub overall_timeout_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            overall_timeout_secs: default_overall_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_jitter() -> f64 {
    0.2
}
fn default_attempt_timeout_secs() -> u64 {
    30
}
fn default_overall_timeout_secs() -> u64 {
    180
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Maximum pages fetched at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Page text handed to extraction is truncated to this many chars.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("varnika/{}", env!("CARGO_PKG_VERSION"))
}
fn default_max_content_chars() -> usize {
    12_000
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API root (the client appends `/chat/completions`).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_extraction_model")]
    pub extraction_model: String,

    #[serde(default = "default_summarizer_model")]
    pub summarizer_model: String,

    #[serde(default = "default_writer_model")]
    pub writer_model: String,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            extraction_model: default_extraction_model(),
            summarizer_model: default_summarizer_model(),
            writer_model: default_writer_model(),
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

fn default_llm_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_llm_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_extraction_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_summarizer_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_writer_model() -> String {
    "anthropic/claude-3.5-sonnet".into()
}
fn default_llm_timeout_secs() -> u64 {
    120
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Backups kept before the oldest is evicted.
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// How long a writer waits for the advisory lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_backups: default_max_backups(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

fn default_max_backups() -> usize {
    10
}
fn default_lock_timeout_ms() -> u64 {
    5000
}

/// `[jobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// A job still running after this long fails with `timeout`.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    /// Terminal jobs kept before the oldest are evicted.
    #[serde(default = "default_max_retained")]
    pub max_retained: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            job_timeout_secs: default_job_timeout_secs(),
            max_retained: default_max_retained(),
        }
    }
}

fn default_job_timeout_secs() -> u64 {
    900
}
fn default_max_retained() -> usize {
    200
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_ttl_secs(),
            max_size: default_cache_max_size(),
        }
    }
}

fn default_ttl_secs() -> u64 {
    3600
}
fn default_cache_max_size() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.varnika/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| VarnikaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.varnika/varnika.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| VarnikaError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| VarnikaError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file to `path` (or the standard location).
/// Returns the path to the created file.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| VarnikaError::io(dir, e))?;
    }

    let content = render_config(&AppConfig::default())?;
    std::fs::write(&path, content).map_err(|e| VarnikaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Serialize a config as pretty TOML.
pub fn render_config(config: &AppConfig) -> Result<String> {
    toml::to_string_pretty(config).map_err(|e| VarnikaError::config(e.to_string()))
}

impl AppConfig {
    /// Reject values that would make the pipeline unusable.
    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(VarnikaError::config("retry.max_attempts must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(VarnikaError::config("retry.jitter must be in [0, 1)"));
        }
        if self.fetch.concurrency == 0 {
            return Err(VarnikaError::config("fetch.concurrency must be at least 1"));
        }
        if self.search.max_results == 0 {
            return Err(VarnikaError::config("search.max_results must be at least 1"));
        }
        Ok(())
    }
}

/// Check that the language-model API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    read_key(&config.llm.api_key_env).ok_or_else(|| {
        VarnikaError::config(format!(
            "language model API key not found. Set the {} environment variable.",
            config.llm.api_key_env
        ))
    })
}

/// The Serper key is optional: without it the secondary provider is disabled.
pub fn serper_api_key(config: &AppConfig) -> Option<String> {
    read_key(&config.search.serper_api_key_env)
}

fn read_key(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Some(val),
        _ => None,
    }
}
