//! The sources ledger: a Markdown file of discovered URLs grouped under topic
//! headings.
//!
//! Every mutation runs under two locks: an in-process mutex that serializes
//! callers sharing one [`SourcesLedger`], and an advisory file lock on a
//! `<file>.lock` sidecar that serializes separate handles and processes. Both
//! waits together are bounded by the lock timeout. If the platform cannot lock
//! files at all, the mutation proceeds without the file lock and a warning is
//! logged; only the in-process guarantee remains. File I/O runs on tokio's
//! blocking pool.
//!
//! Before a mutation replaces existing content, the prior content is copied to
//! a timestamped backup. Only the newest `max_backups` backups are kept.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use regex::Regex;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use varnika_shared::{AppConfig, Result, SourceEntry, SourceRecord, VarnikaError, normalize_url};

use crate::fsutil::{read_or_empty, write_atomic};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);
const DEFAULT_MAX_BACKUPS: usize = 10;
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+(.*\S)\s*$").expect("valid regex"));
static LINK_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s+\[[^\]]*\]\(\s*(?P<url>[^)\s]+)\s*\)").expect("valid regex")
});
static BARE_ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-*]\s+(?P<url>https?://\S+)").expect("valid regex"));

/// Result of an [`SourcesLedger::append`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Entries written under the topic.
    pub added: usize,
    /// Entries dropped as duplicates or invalid URLs.
    pub skipped: usize,
}

/// A retained backup of earlier ledger content.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// SourcesLedger
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SourcesLedger {
    files: Arc<LedgerFiles>,
    lock_timeout: Duration,
    guard: Arc<Mutex<()>>,
}

impl SourcesLedger {
    pub fn new(path: impl Into<PathBuf>, backups_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: Arc::new(LedgerFiles {
                path: path.into(),
                backups_dir: backups_dir.into(),
                max_backups: DEFAULT_MAX_BACKUPS,
            }),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            guard: Arc::new(Mutex::new(())),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.paths.sources_path(), config.paths.backups_dir())
            .with_max_backups(config.ledger.max_backups)
            .with_lock_timeout(Duration::from_millis(config.ledger.lock_timeout_ms))
    }

    pub fn with_max_backups(mut self, max_backups: usize) -> Self {
        Arc::make_mut(&mut self.files).max_backups = max_backups;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.files.path
    }

    /// Current ledger text. A ledger that was never written reads as empty.
    pub async fn get(&self) -> Result<String> {
        let files = Arc::clone(&self.files);
        blocking(move || read_or_empty(&files.path)).await
    }

    /// Parse the ledger into topic records, in file order.
    pub async fn records(&self) -> Result<Vec<SourceRecord>> {
        Ok(parse_records(&self.get().await?))
    }

    /// Overwrite the whole ledger.
    #[instrument(skip_all, fields(path = %self.path().display(), bytes = text.len()))]
    pub async fn replace(&self, text: &str) -> Result<()> {
        let locks = self.lock().await?;

        let files = Arc::clone(&self.files);
        let text = text.to_string();
        blocking(move || {
            let _locks = locks;
            files.backup_current()?;
            write_atomic(&files.path, &text)
        })
        .await?;
        info!("ledger replaced");
        Ok(())
    }

    /// Empty the ledger, keeping a backup of what was there.
    #[instrument(skip_all, fields(path = %self.path().display()))]
    pub async fn clear(&self) -> Result<()> {
        let locks = self.lock().await?;

        let files = Arc::clone(&self.files);
        blocking(move || {
            let _locks = locks;
            files.backup_current()?;
            write_atomic(&files.path, "")
        })
        .await?;
        info!("ledger cleared");
        Ok(())
    }

    /// Add entries under `topic`, creating the heading when it does not exist.
    ///
    /// URLs already listed under the topic (compared after normalization) are
    /// skipped, as are duplicates within `entries`. Nothing is written when
    /// every entry is skipped.
    #[instrument(skip_all, fields(path = %self.path().display(), topic = %topic, entries = entries.len()))]
    pub async fn append(&self, topic: &str, entries: &[SourceEntry]) -> Result<AppendOutcome> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(VarnikaError::validation("ledger topic must not be empty"));
        }

        let locks = self.lock().await?;

        let files = Arc::clone(&self.files);
        let topic = topic.to_string();
        let entries = entries.to_vec();
        let outcome = blocking(move || {
            let _locks = locks;
            let current = read_or_empty(&files.path)?;
            let (updated, outcome) = insert_entries(&current, &topic, &entries);
            if outcome.added > 0 {
                files.backup_current()?;
                write_atomic(&files.path, &updated)?;
            }
            Ok(outcome)
        })
        .await?;

        if outcome.added == 0 {
            debug!(skipped = outcome.skipped, "nothing new to append");
        } else {
            info!(added = outcome.added, skipped = outcome.skipped, "ledger appended");
        }
        Ok(outcome)
    }

    /// Retained backups, newest first.
    pub async fn backups(&self) -> Result<Vec<BackupInfo>> {
        let files = Arc::clone(&self.files);
        blocking(move || files.backups()).await
    }

    // -- locking -------------------------------------------------------------

    fn lock_path(&self) -> PathBuf {
        self.files.lock_path()
    }

    /// Take the in-process guard, then the file lock, both within `lock_timeout`.
    ///
    /// The returned locks move into the blocking write, so they stay held until
    /// the write finishes even if the calling future is dropped.
    async fn lock(&self) -> Result<Locks> {
        let start = Instant::now();
        let deadline = start + self.lock_timeout;
        let inner = tokio::time::timeout_at(deadline, Arc::clone(&self.guard).lock_owned())
            .await
            .map_err(|_| self.timed_out(start))?;
        let file = self.acquire_file_lock(start, deadline).await?;
        Ok(Locks {
            _inner: inner,
            _file: file,
        })
    }

    fn timed_out(&self, start: Instant) -> VarnikaError {
        VarnikaError::LockTimeout {
            path: self.files.path.clone(),
            waited_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn acquire_file_lock(&self, start: Instant, deadline: Instant) -> Result<FileLock> {
        let lock_path = self.lock_path();
        let file = {
            let lock_path = lock_path.clone();
            blocking(move || {
                if let Some(parent) = lock_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| VarnikaError::io(parent, e))?;
                }
                OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&lock_path)
                    .map_err(|e| VarnikaError::io(&lock_path, e))
            })
            .await?
        };

        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(FileLock { file: Some(file) }),
                Err(e) if is_contended(&e) => {
                    if Instant::now() >= deadline {
                        return Err(self.timed_out(start));
                    }
                    tokio::time::sleep(LOCK_POLL_INTERVAL).await;
                }
                Err(e) => {
                    warn!(
                        path = %lock_path.display(),
                        error = %e,
                        "file locking unavailable, continuing without cross-process lock"
                    );
                    return Ok(FileLock { file: None });
                }
            }
        }
    }
}

/// Run blocking file work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| VarnikaError::Storage(format!("ledger I/O task failed: {e}")))?
}

/// The ledger's on-disk layout. Every method here does blocking I/O.
#[derive(Debug, Clone)]
struct LedgerFiles {
    path: PathBuf,
    backups_dir: PathBuf,
    max_backups: usize,
}

impl LedgerFiles {
    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "ledger".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn backup_name_parts(&self) -> (String, String) {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sources".into());
        let ext = self
            .path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "md".into());
        (stem, ext)
    }

    /// Backup files for this ledger, oldest first.
    fn backup_paths(&self) -> Result<Vec<PathBuf>> {
        let (stem, ext) = self.backup_name_parts();
        let prefix = format!("{stem}-");
        let suffix = format!(".{ext}");

        let dir = match std::fs::read_dir(&self.backups_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VarnikaError::io(&self.backups_dir, e)),
        };

        let mut paths: Vec<PathBuf> = dir
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(&suffix))
            })
            .collect();
        // Timestamps are zero-padded, so name order is age order.
        paths.sort();
        Ok(paths)
    }

    fn backups(&self) -> Result<Vec<BackupInfo>> {
        let mut paths = self.backup_paths()?;
        paths.reverse();

        let mut backups = Vec::with_capacity(paths.len());
        for path in paths {
            let meta = std::fs::metadata(&path).map_err(|e| VarnikaError::io(&path, e))?;
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            backups.push(BackupInfo {
                path,
                size: meta.len(),
                modified,
            });
        }
        Ok(backups)
    }

    /// Copy the current file into the backups directory and prune old backups.
    /// Called with both locks held.
    fn backup_current(&self) -> Result<()> {
        let current = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(VarnikaError::io(&self.path, e)),
        };

        let (stem, ext) = self.backup_name_parts();
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        let backup = self
            .backups_dir
            .join(format!("{stem}-{stamp}-{}.{ext}", Uuid::now_v7()));
        write_atomic(&backup, &current)?;
        debug!(backup = %backup.display(), "ledger backed up");

        let paths = self.backup_paths()?;
        let excess = paths.len().saturating_sub(self.max_backups);
        for old in paths.into_iter().take(excess) {
            if let Err(e) = std::fs::remove_file(&old) {
                warn!(path = %old.display(), error = %e, "failed to prune backup");
            }
        }
        Ok(())
    }
}

/// Both mutation locks, released together on drop.
struct Locks {
    _inner: OwnedMutexGuard<()>,
    _file: FileLock,
}

/// Held advisory lock; released on drop.
struct FileLock {
    file: Option<File>,
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = FileExt::unlock(file);
        }
    }
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

// ---------------------------------------------------------------------------
// Parsing and rendering
// ---------------------------------------------------------------------------

fn heading_of(line: &str) -> Option<&str> {
    HEADING_RE
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim_end_matches('#').trim())
}

fn entry_url(line: &str) -> Option<&str> {
    LINK_ENTRY_RE
        .captures(line)
        .or_else(|| BARE_ENTRY_RE.captures(line))
        .and_then(|c| c.name("url"))
        .map(|m| m.as_str())
}

/// Parse ledger text into records. Entries that appear before any heading
/// are grouped under an empty topic.
pub fn parse_records(text: &str) -> Vec<SourceRecord> {
    let mut records: Vec<SourceRecord> = Vec::new();
    let mut current: Option<SourceRecord> = None;

    for line in text.lines() {
        if let Some(topic) = heading_of(line) {
            records.extend(current.take().filter(|r| !r.entries.is_empty()));
            current = Some(SourceRecord {
                topic: topic.to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        if let Some(url) = entry_url(line) {
            let record = current.get_or_insert_with(|| SourceRecord {
                topic: String::new(),
                entries: Vec::new(),
            });
            record.entries.push(SourceEntry::new(url));
            continue;
        }

        let indented = line.starts_with(' ') || line.starts_with('\t');
        let text = line.trim();
        if indented && !text.is_empty() {
            if let Some(entry) = current.as_mut().and_then(|r| r.entries.last_mut()) {
                match &mut entry.summary {
                    Some(summary) => {
                        summary.push('\n');
                        summary.push_str(text);
                    }
                    None => entry.summary = Some(text.to_string()),
                }
            }
        }
    }
    records.extend(current.filter(|r| !r.entries.is_empty()));
    records
}

fn render_entry(entry: &SourceEntry, out: &mut Vec<String>) {
    out.push(format!("- {}", entry.url.trim()));
    if let Some(summary) = &entry.summary {
        out.extend(
            summary
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(|l| format!("  {l}")),
        );
    }
}

/// Insert `entries` under `topic` in `text`. Returns the new text and counts.
fn insert_entries(text: &str, topic: &str, entries: &[SourceEntry]) -> (String, AppendOutcome) {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();

    let heading_idx = lines
        .iter()
        .position(|l| heading_of(l).is_some_and(|h| h.eq_ignore_ascii_case(topic)));
    let section_end = heading_idx.map(|start| {
        lines[start + 1..]
            .iter()
            .position(|l| heading_of(l).is_some())
            .map_or(lines.len(), |offset| start + 1 + offset)
    });

    let mut seen: HashSet<String> = match (heading_idx, section_end) {
        (Some(start), Some(end)) => lines[start + 1..end]
            .iter()
            .filter_map(|l| entry_url(l))
            .filter_map(normalize_url)
            .collect(),
        _ => HashSet::new(),
    };

    let mut outcome = AppendOutcome::default();
    let mut rendered = Vec::new();
    for entry in entries {
        match normalize_url(entry.url.trim()) {
            Some(key) if !seen.contains(&key) => {
                seen.insert(key);
                render_entry(entry, &mut rendered);
                outcome.added += 1;
            }
            _ => outcome.skipped += 1,
        }
    }
    if outcome.added == 0 {
        return (text.to_string(), outcome);
    }

    match (heading_idx, section_end) {
        (Some(start), Some(end)) => {
            let insert_at = lines[start + 1..end]
                .iter()
                .rposition(|l| !l.trim().is_empty())
                .map_or(start + 1, |offset| start + 2 + offset);
            lines.splice(insert_at..insert_at, rendered);
        }
        _ => {
            while lines.last().is_some_and(|l| l.trim().is_empty()) {
                lines.pop();
            }
            if !lines.is_empty() {
                lines.push(String::new());
            }
            lines.push(format!("## {topic}"));
            lines.push(String::new());
            lines.extend(rendered);
        }
    }

    let mut out = lines.join("\n");
    out.push('\n');
    (out, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_in(dir: &Path) -> SourcesLedger {
        SourcesLedger::new(dir.join("sources.md"), dir.join("backups"))
    }

    fn entries(urls: &[&str]) -> Vec<SourceEntry> {
        urls.iter().map(|u| SourceEntry::new(*u)).collect()
    }

    #[tokio::test]
    async fn missing_ledger_reads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path());
        assert_eq!(ledger.get().await.expect("get"), "");
        assert!(ledger.records().await.expect("records").is_empty());
        assert!(ledger.backups().await.expect("backups").is_empty());
    }

    #[tokio::test]
    async fn append_creates_heading_then_dedupes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path());

        let first = ledger
            .append(
                "Quantum computing",
                &entries(&["https://a.example/qubits", "https://b.example/"]),
            )
            .await
            .expect("append");
        assert_eq!(first, AppendOutcome { added: 2, skipped: 0 });

        let second = ledger
            .append(
                "quantum COMPUTING",
                &entries(&[
                    "https://a.example/qubits/",
                    "https://a.example/qubits?utm_source=x",
                    "https://c.example/gates",
                    "https://c.example/gates",
                ]),
            )
            .await
            .expect("append again");
        assert_eq!(second, AppendOutcome { added: 1, skipped: 3 });

        let records = ledger.records().await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "Quantum computing");
        let urls: Vec<&str> = records[0].urls().collect();
        assert_eq!(
            urls,
            vec![
                "https://a.example/qubits",
                "https://b.example/",
                "https://c.example/gates"
            ]
        );
    }

    #[tokio::test]
    async fn append_inserts_inside_existing_section() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path());
        ledger
            .replace("## Rust\n\n- [The book](https://doc.rust-lang.org/book/)\n\n## Go\n\n- https://go.dev/\n")
            .await
            .expect("replace");

        let outcome = ledger
            .append(
                "rust",
                &entries(&["https://doc.rust-lang.org/book", "https://crates.io/"]),
            )
            .await
            .expect("append");
        assert_eq!(outcome, AppendOutcome { added: 1, skipped: 1 });

        let text = ledger.get().await.expect("get");
        assert_eq!(
            text,
            "## Rust\n\n- [The book](https://doc.rust-lang.org/book/)\n- https://crates.io/\n\n## Go\n\n- https://go.dev/\n"
        );
    }

    #[tokio::test]
    async fn fully_duplicate_append_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path());
        ledger
            .append("t", &entries(&["https://a.example/"]))
            .await
            .expect("append");
        let outcome = ledger
            .append("t", &entries(&["https://a.example"]))
            .await
            .expect("append");
        assert_eq!(outcome.added, 0);
        // Only the first append found no prior file, so no backups at all.
        assert!(ledger.backups().await.expect("backups").is_empty());
    }

    #[tokio::test]
    async fn clear_keeps_a_backup_of_prior_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path());
        ledger.replace("## Topic\n\n- https://a.example/\n").await.expect("replace");

        ledger.clear().await.expect("clear");

        assert_eq!(ledger.get().await.expect("get"), "");
        let backups = ledger.backups().await.expect("backups");
        assert_eq!(backups.len(), 1);
        let saved = std::fs::read_to_string(&backups[0].path).expect("read backup");
        assert_eq!(saved, "## Topic\n\n- https://a.example/\n");
    }

    #[tokio::test]
    async fn backups_are_pruned_to_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path()).with_max_backups(3);
        for i in 0..8 {
            ledger.replace(&format!("version {i}")).await.expect("replace");
        }

        let backups = ledger.backups().await.expect("backups");
        assert_eq!(backups.len(), 3);
        let newest = std::fs::read_to_string(&backups[0].path).expect("read");
        assert_eq!(newest, "version 6");
        let oldest = std::fs::read_to_string(&backups[2].path).expect("read");
        assert_eq!(oldest, "version 4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_replaces_never_tear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = Arc::new(ledger_in(dir.path()));

        let writes: Vec<String> = (0..12)
            .map(|i| char::from(b'a' + i as u8).to_string().repeat(1000 + i * 500))
            .collect();

        let mut handles = Vec::new();
        for text in writes.clone() {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move { ledger.replace(&text).await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("replace");
        }

        let final_text = ledger.get().await.expect("get");
        assert!(
            writes.contains(&final_text),
            "final content must equal one complete write"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_handles_serialize_through_file_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = Arc::new(ledger_in(dir.path()));
        let second = Arc::new(ledger_in(dir.path()));

        let mut handles = Vec::new();
        for i in 0..10 {
            for (name, ledger) in [("a", &first), ("b", &second)] {
                let ledger = Arc::clone(ledger);
                let url = format!("https://{name}{i}.example/");
                handles.push(tokio::spawn(async move {
                    ledger.append("shared", &[SourceEntry::new(url)]).await
                }));
            }
        }
        for handle in handles {
            handle.await.expect("join").expect("append");
        }

        let records = first.records().await.expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].entries.len(), 20);
    }

    #[tokio::test]
    async fn held_lock_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path()).with_lock_timeout(Duration::from_millis(100));

        let holder = File::create(ledger.lock_path()).expect("create lock file");
        FileExt::try_lock_exclusive(&holder).expect("hold lock");

        let err = ledger.replace("blocked").await.unwrap_err();
        assert!(matches!(err, VarnikaError::LockTimeout { .. }));
        assert_eq!(ledger.get().await.expect("get"), "");

        FileExt::unlock(&holder).expect("unlock");
        ledger.replace("unblocked").await.expect("replace after unlock");
        assert_eq!(ledger.get().await.expect("get"), "unblocked");
    }

    #[tokio::test]
    async fn busy_in_process_guard_times_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger_in(dir.path()).with_lock_timeout(Duration::from_millis(100));

        let held = Arc::clone(&ledger.guard).lock_owned().await;
        let err = ledger
            .append("t", &entries(&["https://a.example/"]))
            .await
            .unwrap_err();
        assert!(matches!(err, VarnikaError::LockTimeout { .. }));

        drop(held);
        let outcome = ledger
            .append("t", &entries(&["https://a.example/"]))
            .await
            .expect("append after release");
        assert_eq!(outcome.added, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mixed_mutations_leave_whole_documents() {
        const BASE: &str = "## Base\n\n- https://base.example/\n";
        let dir = tempfile::tempdir().expect("tempdir");
        let first = Arc::new(ledger_in(dir.path()).with_max_backups(100));
        let second = Arc::new(ledger_in(dir.path()).with_max_backups(100));

        let mut handles = Vec::new();
        for i in 0..24 {
            let ledger = Arc::clone(if i % 2 == 0 { &first } else { &second });
            handles.push(tokio::spawn(async move {
                match i % 4 {
                    0 => ledger.replace(BASE).await,
                    1 => ledger.clear().await,
                    _ => ledger
                        .append("Mixed", &[SourceEntry::new(format!("https://m{i}.example/"))])
                        .await
                        .map(|_| ()),
                }
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("mutation");
        }

        let mut snapshots = vec![first.get().await.expect("get")];
        for backup in first.backups().await.expect("backups") {
            snapshots.push(std::fs::read_to_string(&backup.path).expect("read backup"));
        }
        assert!(snapshots.len() > 1, "mutations over existing content keep backups");
        for text in &snapshots {
            assert!(text.is_empty() || text.ends_with('\n'), "truncated document {text:?}");
            for line in text.lines() {
                let whole = line.is_empty()
                    || heading_of(line).is_some()
                    || entry_url(line).is_some_and(|u| u.ends_with(".example/"));
                assert!(whole, "torn line {line:?} in {text:?}");
            }
            let records = parse_records(text);
            let topics: HashSet<&str> = records.iter().map(|r| r.topic.as_str()).collect();
            assert_eq!(topics.len(), records.len(), "topic repeated in {text:?}");
        }
    }

    #[test]
    fn normalized_duplicates_in_one_batch_are_skipped() {
        let (text, outcome) = insert_entries(
            "",
            "t",
            &entries(&[
                "https://a.example/x",
                "https://A.example/x/",
                "not a url",
                "https://b.example/",
            ]),
        );
        assert_eq!(outcome, AppendOutcome { added: 2, skipped: 2 });
        assert_eq!(text, "## t\n\n- https://a.example/x\n- https://b.example/\n");
    }

    #[test]
    fn parses_links_bare_urls_and_summaries() {
        let text = "\
- https://orphan.example/

# Qubits

- [Intro](https://a.example/intro)
  Explains superposition.
  Mentions entanglement.
- https://b.example/
Not an entry.

## Empty topic

## Gates ##
* https://c.example/gates
";
        let records = parse_records(text);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].topic, "");
        assert_eq!(records[1].topic, "Qubits");
        assert_eq!(
            records[1].entries[0].summary.as_deref(),
            Some("Explains superposition.\nMentions entanglement.")
        );
        assert_eq!(records[1].entries[1].summary, None);
        assert_eq!(records[2].topic, "Gates");
        assert_eq!(records[2].urls().collect::<Vec<_>>(), vec!["https://c.example/gates"]);
    }

    #[test]
    fn new_section_renders_summaries() {
        let (text, outcome) = insert_entries(
            "# Existing\n\n- https://x.example/\n\n\n",
            "New topic",
            &[SourceEntry::new("https://y.example/").with_summary("line one\nline two")],
        );
        assert_eq!(outcome.added, 1);
        assert_eq!(
            text,
            "# Existing\n\n- https://x.example/\n\n## New topic\n\n- https://y.example/\n  line one\n  line two\n"
        );
    }
}
