//! Named pipeline artifacts on disk.
//!
//! Each artifact is its own file so stages can resume from whatever an earlier
//! run left behind:
//! - extracted context (`context.json`): per-URL fetch results
//! - condensed context (`context.txt`): the summary the writer consumes
//! - writing-style sample
//! - articles, one Markdown file each under the articles directory

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};
use varnika_shared::{AppConfig, FetchResult, PathsConfig, Result, VarnikaError};
use varnika_storage::write_atomic;

/// Style sample used when no writing-style artifact exists.
pub const DEFAULT_WRITING_STYLE: &str = "Write in a clear, concise, and informative style.";

const ARTICLE_EXT: &str = "md";

/// Metadata for one saved article.
#[derive(Debug, Clone, Serialize)]
pub struct ArticleMeta {
    /// File stem, without the `.md` extension.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
    pub sha256: String,
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    context_json: PathBuf,
    context_txt: PathBuf,
    writing_style: PathBuf,
    articles_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            context_json: paths.context_json_path(),
            context_txt: paths.context_txt_path(),
            writing_style: paths.writing_style_path(),
            articles_dir: paths.articles_path(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(&config.paths)
    }

    pub fn articles_dir(&self) -> &Path {
        &self.articles_dir
    }

    // -- extracted context ---------------------------------------------------

    #[instrument(skip_all, fields(results = results.len()))]
    pub fn write_context(&self, results: &[FetchResult]) -> Result<()> {
        let json = to_json(results)?;
        write_atomic(&self.context_json, &json)?;
        debug!(path = %self.context_json.display(), "wrote extracted context");
        Ok(())
    }

    /// Read extracted context. Missing artifact is `NotFound`.
    pub fn read_context(&self) -> Result<Vec<FetchResult>> {
        let text = read_required(&self.context_json, "extracted context")?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|e| {
            VarnikaError::validation(format!(
                "invalid {}: {e}",
                self.context_json.display()
            ))
        })
    }

    // -- condensed context ---------------------------------------------------

    pub fn write_summary(&self, text: &str) -> Result<()> {
        write_atomic(&self.context_txt, text)?;
        debug!(path = %self.context_txt.display(), chars = text.len(), "wrote condensed context");
        Ok(())
    }

    /// Read condensed context. Missing artifact is `NotFound`.
    pub fn read_summary(&self) -> Result<String> {
        read_required(&self.context_txt, "condensed context")
    }

    /// Reset both context artifacts to empty.
    pub fn clear_context(&self) -> Result<()> {
        write_atomic(&self.context_json, "[]")?;
        write_atomic(&self.context_txt, "")?;
        info!("context cleared");
        Ok(())
    }

    // -- writing style -------------------------------------------------------

    /// The style sample, or [`DEFAULT_WRITING_STYLE`] when none is stored.
    pub fn writing_style(&self) -> Result<String> {
        match std::fs::read_to_string(&self.writing_style) {
            Ok(text) if !text.trim().is_empty() => Ok(text),
            Ok(_) => Ok(DEFAULT_WRITING_STYLE.to_string()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(DEFAULT_WRITING_STYLE.to_string()),
            Err(e) => Err(VarnikaError::io(&self.writing_style, e)),
        }
    }

    pub fn set_writing_style(&self, text: &str) -> Result<()> {
        write_atomic(&self.writing_style, text)
    }

    // -- articles ------------------------------------------------------------

    fn article_path(&self, name: &str) -> PathBuf {
        self.articles_dir
            .join(format!("{}.{ARTICLE_EXT}", sanitize_stem(name)))
    }

    #[instrument(skip_all, fields(name = %name))]
    pub fn write_article(&self, name: &str, text: &str) -> Result<ArticleMeta> {
        let path = self.article_path(name);
        write_atomic(&path, text)?;
        let meta = article_meta(&path, text.as_bytes())?;
        info!(path = %path.display(), size = meta.size_bytes, "article saved");
        Ok(meta)
    }

    pub fn read_article(&self, name: &str) -> Result<String> {
        read_required(&self.article_path(name), "article")
    }

    pub fn delete_article(&self, name: &str) -> Result<()> {
        let path = self.article_path(name);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(path = %path.display(), "article deleted");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VarnikaError::not_found(
                format!("article '{}'", sanitize_stem(name)),
            )),
            Err(e) => Err(VarnikaError::io(&path, e)),
        }
    }

    /// Saved articles, sorted by name.
    pub fn list_articles(&self) -> Result<Vec<ArticleMeta>> {
        let dir = match std::fs::read_dir(&self.articles_dir) {
            Ok(dir) => dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(VarnikaError::io(&self.articles_dir, e)),
        };

        let mut articles = Vec::new();
        for entry in dir {
            let path = entry.map_err(|e| VarnikaError::io(&self.articles_dir, e))?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(ARTICLE_EXT) {
                continue;
            }
            let bytes = std::fs::read(&path).map_err(|e| VarnikaError::io(&path, e))?;
            articles.push(article_meta(&path, &bytes)?);
        }
        articles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(articles)
    }
}

fn read_required(path: &Path, what: &str) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(text),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(VarnikaError::not_found(format!(
            "{what} ({})",
            path.display()
        ))),
        Err(e) => Err(VarnikaError::io(path, e)),
    }
}

fn article_meta(path: &Path, bytes: &[u8]) -> Result<ArticleMeta> {
    let meta = std::fs::metadata(path).map_err(|e| VarnikaError::io(path, e))?;
    let modified = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(bytes);

    Ok(ArticleMeta {
        name,
        path: path.to_path_buf(),
        size_bytes: meta.len(),
        modified,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

// ---------------------------------------------------------------------------
// Naming
// ---------------------------------------------------------------------------

/// Reduce `raw` to a safe file stem: ASCII letters, digits, `-`, `_` and `.`,
/// with whitespace turned into underscores. Never empty.
pub fn sanitize_stem(raw: &str) -> String {
    let raw = raw.trim();
    let raw = raw.strip_suffix(".md").unwrap_or(raw);
    let stem: String = raw
        .chars()
        .filter_map(|c| match c {
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => Some(c),
            c if c.is_whitespace() => Some('_'),
            _ => None,
        })
        .collect();
    let stem = stem.trim_matches(|c| c == '.' || c == '_');
    if stem.is_empty() {
        "article".to_string()
    } else {
        stem.to_string()
    }
}

/// Article file stem for a run: the explicit `name` if given, otherwise
/// `article_<query>_<YYYYMMDD>`.
pub fn article_file_name(query: &str, name: Option<&str>, today: NaiveDate) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => sanitize_stem(name),
        None => {
            let topic = query.split_whitespace().collect::<Vec<_>>().join("_");
            sanitize_stem(&format!("article_{topic}_{}", today.format("%Y%m%d")))
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value)
        .map_err(|e| VarnikaError::Storage(format!("JSON serialization failed: {e}")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use varnika_shared::ErrorKind;

    use super::*;

    fn store_in(dir: &Path) -> ArtifactStore {
        let paths = PathsConfig {
            data_dir: dir.join("data").display().to_string(),
            articles_dir: dir.join("articles").display().to_string(),
            ..PathsConfig::default()
        };
        ArtifactStore::new(&paths)
    }

    #[test]
    fn context_round_trip_and_clear() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path());

        assert!(matches!(
            store.read_context().unwrap_err(),
            VarnikaError::NotFound { .. }
        ));
        assert!(matches!(
            store.read_summary().unwrap_err(),
            VarnikaError::NotFound { .. }
        ));

        let results = vec![
            FetchResult::success("https://a.example/", Some("A".into()), "qubits", 12),
            FetchResult::failure("https://b.example/", "timed out", 30),
        ];
        store.write_context(&results).expect("write context");
        store.write_summary("condensed").expect("write summary");
        assert_eq!(store.read_context().expect("read"), results);
        assert_eq!(store.read_summary().expect("read"), "condensed");

        store.clear_context().expect("clear");
        assert!(store.read_context().expect("read").is_empty());
        assert_eq!(store.read_summary().expect("read"), "");
    }

    #[test]
    fn unserializable_context_is_a_storage_error() {
        let mut bad = HashMap::new();
        bad.insert((1u8, 2u8), "tuple keys are not JSON object keys");
        let err = to_json(&bad).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[test]
    fn writing_style_falls_back_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert_eq!(store.writing_style().expect("style"), DEFAULT_WRITING_STYLE);

        store.set_writing_style("Terse and dry.").expect("set");
        assert_eq!(store.writing_style().expect("style"), "Terse and dry.");

        store.set_writing_style("  \n").expect("set blank");
        assert_eq!(store.writing_style().expect("style"), DEFAULT_WRITING_STYLE);
    }

    #[test]
    fn articles_list_read_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(dir.path());
        assert!(store.list_articles().expect("list").is_empty());

        let meta = store.write_article("quantum intro", "# Quantum").expect("write");
        assert_eq!(meta.name, "quantum_intro");
        assert_eq!(meta.size_bytes, 9);
        assert_eq!(meta.sha256.len(), 64);
        store.write_article("alpha.md", "a").expect("write");
        std::fs::write(store.articles_dir().join("notes.txt"), "ignored").expect("write txt");

        let names: Vec<String> = store
            .list_articles()
            .expect("list")
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["alpha", "quantum_intro"]);

        assert_eq!(store.read_article("quantum_intro").expect("read"), "# Quantum");
        store.delete_article("quantum_intro").expect("delete");
        assert!(matches!(
            store.delete_article("quantum_intro").unwrap_err(),
            VarnikaError::NotFound { .. }
        ));
        assert!(matches!(
            store.read_article("quantum_intro").unwrap_err(),
            VarnikaError::NotFound { .. }
        ));
    }

    #[test]
    fn names_cannot_escape_articles_dir() {
        assert_eq!(sanitize_stem("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_stem("  "), "article");
        assert_eq!(sanitize_stem("My Post: v2!"), "My_Post_v2");
    }

    #[test]
    fn default_article_name_uses_query_and_date() {
        let day = NaiveDate::from_ymd_opt(2025, 3, 7).expect("date");
        assert_eq!(
            article_file_name("quantum  computing", None, day),
            "article_quantum_computing_20250307"
        );
        assert_eq!(article_file_name("q", Some("custom name"), day), "custom_name");
        assert_eq!(article_file_name("q", Some(" "), day), "article_q_20250307");
    }
}
