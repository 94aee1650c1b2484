//! Search capabilities backed by real services.
//!
//! - [`DuckDuckGoSearch`] scrapes the DuckDuckGo HTML endpoint (no key needed)
//! - [`SerperSearch`] calls the Serper Google-search JSON API

use std::sync::LazyLock;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;
use varnika_gate::http::{check_status, classify_send_error};
use varnika_shared::UpstreamError;

use crate::{SearchHit, SearchProvider};

// ---------------------------------------------------------------------------
// DuckDuckGo
// ---------------------------------------------------------------------------

/// Primary search capability: DuckDuckGo's JavaScript-free results page.
#[derive(Debug, Clone)]
pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
    region: String,
}

impl DuckDuckGoSearch {
    pub fn new(client: Client, endpoint: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            region: region.into(),
        }
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoSearch {
    fn name(&self) -> &str {
        "duckduckgo"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, UpstreamError> {
        let region = format!("{}-en", self.region);
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query), ("kl", region.as_str())])
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        // DuckDuckGo answers throttled clients with 202 and a challenge page.
        if response.status() == StatusCode::ACCEPTED {
            return Err(UpstreamError::RateLimited { retry_after: None });
        }
        let body = check_status(response)?
            .text()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let hits = parse_duckduckgo_html(&body, max_results);
        debug!(count = hits.len(), "duckduckgo results parsed");
        Ok(hits)
    }
}

static RESULT_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result").expect("valid selector"));
static LINK_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a.result__a").expect("valid selector"));
static SNIPPET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(".result__snippet").expect("valid selector"));

/// Extract organic results from a DuckDuckGo HTML page. Ads are skipped.
fn parse_duckduckgo_html(body: &str, max_results: usize) -> Vec<SearchHit> {
    let doc = Html::parse_document(body);
    let mut hits = Vec::new();

    for result in doc.select(&RESULT_SEL) {
        if hits.len() >= max_results {
            break;
        }
        if result.value().classes().any(|c| c == "result--ad") {
            continue;
        }
        let Some(link) = result.select(&LINK_SEL).next() else {
            continue;
        };
        let Some(url) = link.value().attr("href").and_then(decode_result_href) else {
            continue;
        };
        let title = link.text().collect::<String>().trim().to_string();
        let snippet = result
            .select(&SNIPPET_SEL)
            .next()
            .map(|s| s.text().collect::<String>().trim().to_string())
            .unwrap_or_default();
        hits.push(SearchHit {
            url,
            title,
            snippet,
        });
    }

    hits
}

/// Result links are usually `//duckduckgo.com/l/?uddg=<target>`; unwrap them.
fn decode_result_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;
    let is_redirect = url
        .host_str()
        .is_some_and(|h| h.ends_with("duckduckgo.com"))
        && url.path().starts_with("/l/");
    if is_redirect {
        return url
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned());
    }
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

// ---------------------------------------------------------------------------
// Serper
// ---------------------------------------------------------------------------

/// Secondary search capability: Serper's Google search API.
#[derive(Debug, Clone)]
pub struct SerperSearch {
    client: Client,
    endpoint: String,
    api_key: String,
    region: String,
}

impl SerperSearch {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            region: region.into(),
        }
    }
}

#[derive(Serialize)]
struct SerperRequest<'a> {
    q: &'a str,
    num: usize,
    gl: &'a str,
}

#[derive(Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SerperOrganic>,
}

#[derive(Deserialize)]
struct SerperOrganic {
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

#[async_trait]
impl SearchProvider for SerperSearch {
    fn name(&self) -> &str {
        "serper"
    }

    async fn search(
        &self,
        query: &str,
        max_results: usize,
    ) -> Result<Vec<SearchHit>, UpstreamError> {
        let request = SerperRequest {
            q: query,
            // Ask for extra results: some are filtered out downstream.
            num: (max_results * 2).max(10),
            gl: &self.region,
        };
        let response = self
            .client
            .post(&self.endpoint)
            .header("X-API-KEY", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let parsed: SerperResponse = check_status(response)?
            .json()
            .await
            .map_err(|e| UpstreamError::Failed(format!("invalid serper response: {e}")))?;

        let hits: Vec<SearchHit> = parsed
            .organic
            .into_iter()
            .map(|o| SearchHit {
                url: o.link,
                title: o.title,
                snippet: o.snippet,
            })
            .collect();
        debug!(count = hits.len(), "serper results parsed");
        Ok(hits)
    }
}
