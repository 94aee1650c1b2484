//! CLI command definitions, routing, and tracing setup.

use std::io::Read;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, bail, eyre};
use indicatif::MultiProgress;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use varnika_artifacts::ArtifactStore;
use varnika_core::{JobTracker, PipelineRequest, build_tracker};
use varnika_shared::{
    AppConfig, ArticleFormat, Job, JobId, JobStatus, SourceEntry, Stage, StageSet, init_config,
    load_config, load_config_from, render_config,
};
use varnika_storage::{JobStore, SourcesLedger, SqlJobStore};

use crate::progress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// varnika: research a topic and write an article about it.
#[derive(Parser)]
#[command(
    name = "varnika",
    version,
    about = "Discover web sources for a topic, condense them, and write a styled article.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.varnika/varnika.toml).
    #[arg(long, global = true, env = "VARNIKA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run pipeline stages for a query or a list of URLs.
    Run {
        /// Topic to research.
        query: Option<String>,

        /// Fetch these URLs instead of discovering sources (repeatable).
        #[arg(long = "url", short = 'u')]
        urls: Vec<String>,

        /// Stages to run, comma-separated: discover,fetch,summarize,write.
        #[arg(long, short, value_delimiter = ',')]
        stages: Vec<Stage>,

        /// Article format: detailed, summarized, or points.
        #[arg(long, short, default_value = "detailed")]
        format: ArticleFormat,

        /// Article file name (defaults to article_<query>_<date>).
        #[arg(long, short)]
        name: Option<String>,

        /// Number of sources to discover.
        #[arg(long)]
        max_results: Option<usize>,

        /// Run each stage as its own job, all at once.
        #[arg(long)]
        concurrent: bool,

        /// Do not record discovered or given URLs in the sources ledger.
        #[arg(long)]
        no_save_sources: bool,
    },

    /// Inspect pipeline jobs.
    Jobs {
        #[command(subcommand)]
        action: JobsAction,
    },

    /// Read or edit the sources ledger.
    Sources {
        #[command(subcommand)]
        action: SourcesAction,
    },

    /// Read or clear the stored context.
    Context {
        #[command(subcommand)]
        action: ContextAction,
    },

    /// Manage generated articles.
    Articles {
        #[command(subcommand)]
        action: ArticlesAction,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum JobsAction {
    /// List recent jobs, newest first.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show one job as JSON.
    Show { id: JobId },
}

#[derive(Subcommand)]
pub(crate) enum SourcesAction {
    /// Print the ledger.
    Show {
        /// Print parsed records as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Replace the ledger with the contents of a file ("-" for stdin).
    Set { file: PathBuf },
    /// Append URLs under a topic.
    Append {
        topic: String,
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Empty the ledger (a backup is kept).
    Clear,
    /// List retained backups, newest first.
    Backups,
}

#[derive(Subcommand)]
pub(crate) enum ContextAction {
    /// Print sources, extracted context and condensed context.
    Show,
    /// Empty the extracted and condensed context.
    Clear,
}

#[derive(Subcommand)]
pub(crate) enum ArticlesAction {
    /// List saved articles.
    List,
    /// Print an article.
    Show { name: String },
    /// Delete an article.
    Delete { name: String },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "varnika=info",
        1 => "varnika=debug",
        _ => "varnika=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run {
            query,
            urls,
            stages,
            format,
            name,
            max_results,
            concurrent,
            no_save_sources,
        } => {
            let stages = if stages.is_empty() {
                StageSet::all()
            } else {
                StageSet::new(stages)?
            };
            let mut req = PipelineRequest::new(stages)
                .with_urls(urls)
                .with_format(format);
            if let Some(query) = query {
                req = req.with_query(query);
            }
            if let Some(name) = name {
                req = req.with_output_name(name);
            }
            req.max_results = max_results;
            req.save_to_sources = !no_save_sources;
            cmd_run(&load(config_path)?, req, concurrent).await
        }
        Command::Jobs { action } => {
            let config = load(config_path)?;
            match action {
                JobsAction::List { limit, offset } => cmd_jobs_list(&config, limit, offset).await,
                JobsAction::Show { id } => cmd_jobs_show(&config, id).await,
            }
        }
        Command::Sources { action } => {
            let ledger = SourcesLedger::from_config(&load(config_path)?);
            match action {
                SourcesAction::Show { json } => cmd_sources_show(&ledger, json).await,
                SourcesAction::Set { file } => cmd_sources_set(&ledger, &file).await,
                SourcesAction::Append { topic, urls } => {
                    cmd_sources_append(&ledger, &topic, &urls).await
                }
                SourcesAction::Clear => cmd_sources_clear(&ledger).await,
                SourcesAction::Backups => cmd_sources_backups(&ledger).await,
            }
        }
        Command::Context { action } => {
            let config = load(config_path)?;
            match action {
                ContextAction::Show => cmd_context_show(&config).await,
                ContextAction::Clear => cmd_context_clear(&config),
            }
        }
        Command::Articles { action } => {
            let artifacts = ArtifactStore::from_config(&load(config_path)?);
            match action {
                ArticlesAction::List => cmd_articles_list(&artifacts),
                ArticlesAction::Show { name } => {
                    println!("{}", artifacts.read_article(&name)?);
                    Ok(())
                }
                ArticlesAction::Delete { name } => {
                    artifacts.delete_article(&name)?;
                    println!("Deleted {name}");
                    Ok(())
                }
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, req: PipelineRequest, concurrent: bool) -> Result<()> {
    let req = req.validate()?;
    let tracker = build_tracker(config).await?;

    let requests: Vec<PipelineRequest> = if concurrent && req.stages.len() > 1 {
        req.stages
            .iter()
            .map(|stage| PipelineRequest {
                stages: StageSet::single(stage),
                ..req.clone()
            })
            .collect()
    } else {
        vec![req]
    };

    let mut ids = Vec::with_capacity(requests.len());
    for r in requests {
        let label = r.stages.to_string();
        let id = tracker.submit(r).await?;
        info!(job_id = %id, stages = %label, "job submitted");
        ids.push((id, label));
    }

    let cancel_tracker = tracker.clone();
    let cancel_ids: Vec<JobId> = ids.iter().map(|(id, _)| *id).collect();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling jobs");
            cancel_all(&cancel_tracker, &cancel_ids).await;
        }
    });

    let multi = MultiProgress::new();
    let mut set = JoinSet::new();
    for (id, label) in ids {
        let tracker = tracker.clone();
        let bar = progress::job_bar(&multi, &label);
        set.spawn(async move { progress::follow(&tracker, id, bar).await });
    }

    let mut jobs = Vec::new();
    while let Some(joined) = set.join_next().await {
        jobs.push(joined.map_err(|e| eyre!("progress task failed: {e}"))??);
    }
    interrupt.abort();

    jobs.sort_by_key(|j| j.created_at());
    let mut failed = 0;
    for job in &jobs {
        print_job_outcome(job);
        if job.status() == JobStatus::Failed {
            failed += 1;
        }
    }
    if failed > 0 {
        bail!("{failed} of {} job(s) failed", jobs.len());
    }
    Ok(())
}

fn print_job_outcome(job: &Job) {
    println!();
    println!("  Job {} [{}]: {}", job.id(), job.stages(), job.status());
    if let Some(err) = job.error() {
        println!("  Error:   {} ({})", err.message, err.kind);
    }
    let Some(result) = job.result() else {
        return;
    };
    if let Some(discovered) = result.get("discovered").and_then(|v| v.as_array()) {
        println!("  Sources: {} discovered", discovered.len());
    }
    if let Some(added) = result.get("sources_added").and_then(|v| v.as_u64()) {
        println!("  Ledger:  {added} added");
    }
    if let Some(fetched) = result.get("fetched").and_then(|v| v.as_array()) {
        let ok = fetched
            .iter()
            .filter(|r| r.get("success").and_then(|s| s.as_bool()) == Some(true))
            .count();
        println!("  Fetched: {ok}/{} pages", fetched.len());
    }
    if result.get("summary").is_some() {
        println!("  Summary: written");
    }
    if let Some(path) = result.pointer("/article/path").and_then(|v| v.as_str()) {
        println!("  Article: {path}");
    }
}

// ---------------------------------------------------------------------------
// jobs
// ---------------------------------------------------------------------------

/// Open the job database for reading, or `None` when nothing has run yet.
async fn job_store(config: &AppConfig) -> Result<Option<SqlJobStore>> {
    let path = config.paths.jobs_db_path();
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(SqlJobStore::open_readonly(&path).await?))
}

async fn cmd_jobs_list(config: &AppConfig, limit: usize, offset: usize) -> Result<()> {
    let Some(store) = job_store(config).await? else {
        println!("No jobs yet.");
        return Ok(());
    };
    let page = store.list(limit, offset).await?;
    if page.jobs.is_empty() {
        println!("No jobs.");
        return Ok(());
    }
    println!(
        "  {:<36}  {:<10}  {:<26}  {:>4}  {:<20}  TOPIC",
        "ID", "STATUS", "STAGES", "%", "UPDATED"
    );
    for job in &page.jobs {
        println!(
            "  {:<36}  {:<10}  {:<26}  {:>4}  {:<20}  {}",
            job.id(),
            job.status(),
            job.stages().to_string(),
            job.progress(),
            job.updated_at().format("%Y-%m-%d %H:%M:%S"),
            job.topic().unwrap_or("-"),
        );
    }
    println!("  ({} of {} shown)", page.jobs.len(), page.total);
    Ok(())
}

async fn cmd_jobs_show(config: &AppConfig, id: JobId) -> Result<()> {
    let store = job_store(config)
        .await?
        .ok_or_else(|| eyre!("job {id} not found"))?;
    let job = store
        .load(id)
        .await?
        .ok_or_else(|| eyre!("job {id} not found"))?;
    println!("{}", serde_json::to_string_pretty(&job)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// sources
// ---------------------------------------------------------------------------

async fn cmd_sources_show(ledger: &SourcesLedger, json: bool) -> Result<()> {
    if json {
        let records = ledger.records().await?;
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else {
        print!("{}", ledger.get().await?);
    }
    Ok(())
}

async fn cmd_sources_set(ledger: &SourcesLedger, file: &Path) -> Result<()> {
    let text = if file == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(file)
            .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?
    };
    ledger.replace(&text).await?;
    println!("Sources replaced ({} bytes)", text.len());
    Ok(())
}

async fn cmd_sources_append(ledger: &SourcesLedger, topic: &str, urls: &[String]) -> Result<()> {
    let entries: Vec<SourceEntry> = urls.iter().map(SourceEntry::new).collect();
    let outcome = ledger.append(topic, &entries).await?;
    println!(
        "Added {} URL(s) under \"{topic}\", skipped {}",
        outcome.added, outcome.skipped
    );
    Ok(())
}

async fn cmd_sources_clear(ledger: &SourcesLedger) -> Result<()> {
    ledger.clear().await?;
    println!("Sources cleared");
    Ok(())
}

async fn cmd_sources_backups(ledger: &SourcesLedger) -> Result<()> {
    let backups = ledger.backups().await?;
    if backups.is_empty() {
        println!("No backups.");
        return Ok(());
    }
    for b in backups {
        println!(
            "  {}  {:>8} B  {}",
            b.modified.format("%Y-%m-%d %H:%M:%S"),
            b.size,
            b.path.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// context / articles
// ---------------------------------------------------------------------------

async fn cmd_context_show(config: &AppConfig) -> Result<()> {
    let ledger = SourcesLedger::from_config(config);
    let artifacts = ArtifactStore::from_config(config);

    let context = match artifacts.read_context() {
        Ok(results) => serde_json::to_value(results)?,
        Err(e) if e.kind() == varnika_shared::ErrorKind::NotFound => serde_json::json!([]),
        Err(e) => return Err(e.into()),
    };
    let condensed = match artifacts.read_summary() {
        Ok(text) => text,
        Err(e) if e.kind() == varnika_shared::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let view = serde_json::json!({
        "sources": ledger.get().await?,
        "context": context,
        "condensed_context": condensed,
    });
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

fn cmd_context_clear(config: &AppConfig) -> Result<()> {
    ArtifactStore::from_config(config).clear_context()?;
    println!("Context cleared");
    Ok(())
}

fn cmd_articles_list(artifacts: &ArtifactStore) -> Result<()> {
    let articles = artifacts.list_articles()?;
    if articles.is_empty() {
        println!("No articles in {}", artifacts.articles_dir().display());
        return Ok(());
    }
    for a in articles {
        println!(
            "  {:<48}  {:>8} B  {}  {}",
            a.name,
            a.size_bytes,
            a.modified.format("%Y-%m-%d %H:%M"),
            &a.sha256[..12.min(a.sha256.len())],
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

/// Request cancellation of every job in `ids`, returning how many accepted it.
///
/// Jobs that already finished refuse; that is expected during shutdown.
async fn cancel_all(tracker: &JobTracker, ids: &[JobId]) -> usize {
    let mut cancelled = 0;
    for id in ids {
        match tracker.cancel(*id).await {
            Ok(()) => cancelled += 1,
            Err(e) => debug!(job_id = %id, error = %e, "job not cancelled"),
        }
    }
    cancelled
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    println!("{}", render_config(&load(path)?)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_parses_stages_and_urls() {
        let cli = Cli::parse_from([
            "varnika",
            "run",
            "--stages",
            "fetch,summarize",
            "--url",
            "https://a.example/",
            "--url",
            "https://b.example/",
            "--format",
            "points",
        ]);
        let Command::Run {
            query,
            urls,
            stages,
            format,
            ..
        } = cli.command
        else {
            panic!("expected run");
        };
        assert!(query.is_none());
        assert_eq!(urls.len(), 2);
        assert_eq!(stages, vec![Stage::Fetch, Stage::Summarize]);
        assert_eq!(format, ArticleFormat::Points);
    }

    #[tokio::test]
    async fn cancel_all_skips_jobs_it_cannot_cancel() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig::default();
        config.paths.data_dir = dir.path().join("data").display().to_string();
        config.paths.articles_dir = dir.path().join("articles").display().to_string();
        config.llm.api_key_env = "VARNIKA_CLI_TEST_KEY_THAT_IS_NEVER_SET".into();
        let tracker = build_tracker(&config).await.expect("tracker");

        assert_eq!(cancel_all(&tracker, &[JobId::new(), JobId::new()]).await, 0);
    }

    #[test]
    fn unknown_stage_is_rejected() {
        assert!(Cli::try_parse_from(["varnika", "run", "q", "--stages", "publish"]).is_err());
    }
}
