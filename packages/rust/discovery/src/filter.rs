//! Link filtering, relevance ranking and de-duplication of search hits.

use std::collections::HashSet;

use regex::Regex;
use varnika_shared::{Result, VarnikaError, normalize_url};

use crate::SearchHit;

/// Rejects links that never carry article content (video hosts and the like).
#[derive(Debug, Clone, Default)]
pub struct LinkFilter {
    blocked: Vec<Regex>,
}

impl LinkFilter {
    /// Compile the configured patterns. Patterns match against `host/path?query`.
    pub fn from_patterns(patterns: &[String]) -> Result<Self> {
        let blocked = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    VarnikaError::config(format!("invalid blocked pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { blocked })
    }

    /// Whether `url` should be dropped. Non-http(s) links are always dropped.
    pub fn is_blocked(&self, url: &str) -> bool {
        let Some(normalized) = normalize_url(url) else {
            return true;
        };
        let target = normalized
            .split_once("://")
            .map_or(normalized.as_str(), |(_, rest)| rest);
        // Patterns expect a path separator after the host.
        let target = if target.contains('/') {
            target.to_string()
        } else {
            format!("{target}/")
        };
        self.blocked.iter().any(|re| re.is_match(&target))
    }
}

/// Relevance of a hit: +2 when the query appears in the title, +1 in the snippet.
pub fn relevance(query: &str, hit: &SearchHit) -> u8 {
    let q = query.to_lowercase();
    let mut score = 0;
    if hit.title.to_lowercase().contains(&q) {
        score += 2;
    }
    if hit.snippet.to_lowercase().contains(&q) {
        score += 1;
    }
    score
}

/// Stable sort by descending relevance. Zero-score hits are kept at the end.
pub fn rank_hits(query: &str, mut hits: Vec<SearchHit>) -> Vec<SearchHit> {
    hits.sort_by_key(|hit| std::cmp::Reverse(relevance(query, hit)));
    hits
}

/// Drop blocked links and duplicates (by normalized URL), keep order, truncate.
pub fn dedupe_urls(hits: &[SearchHit], filter: &LinkFilter, max_results: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for hit in hits {
        if urls.len() >= max_results {
            break;
        }
        if filter.is_blocked(&hit.url) {
            continue;
        }
        if let Some(normalized) = normalize_url(&hit.url) {
            if seen.insert(normalized.clone()) {
                urls.push(normalized);
            }
        }
    }
    urls
}
