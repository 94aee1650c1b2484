//! Small in-memory cache for search results.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use varnika_shared::CacheConfig;

use crate::SearchHit;

#[derive(Debug)]
struct CacheEntry {
    inserted: Instant,
    hits: Vec<SearchHit>,
}

/// TTL-bounded cache keyed by provider, query and result count.
/// When full, the oldest entry is evicted.
#[derive(Debug)]
pub struct SearchCache {
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SearchCache {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size: max_size.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Build from config, or `None` when caching is disabled.
    pub fn from_config(config: &CacheConfig) -> Option<Self> {
        config
            .enabled
            .then(|| Self::new(Duration::from_secs(config.ttl_secs), config.max_size))
    }

    pub fn key(provider: &str, query: &str, max_results: usize) -> String {
        format!("{provider}:{max_results}:{}", query.trim().to_lowercase())
    }

    pub fn get(&self, key: &str) -> Option<Vec<SearchHit>> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => Some(entry.hits.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: String, hits: Vec<SearchHit>) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            CacheEntry {
                inserted: Instant::now(),
                hits,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
