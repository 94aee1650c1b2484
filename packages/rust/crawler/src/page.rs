//! HTTP page fetcher: download a page and reduce it to readable Markdown.

use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use reqwest::redirect::Policy;
use scraper::{Html, Selector};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;
use varnika_gate::http::{MAX_REDIRECTS, build_client_with_redirects, check_status, classify_send_error};
use varnika_shared::UpstreamError;

use crate::{PageFetcher, RawPage};

/// Content containers tried in order before falling back to `<body>`.
const CONTENT_SELECTORS: &[&str] = &["article", "main", "[role=\"main\"]", "#content", ".content"];

/// Tags whose text never belongs in extracted content.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "form", "iframe", "noscript", "svg",
];

// ---------------------------------------------------------------------------
// HttpPageFetcher
// ---------------------------------------------------------------------------

/// Build the client used for page downloads.
///
/// Every redirect hop is checked against the same private-target rules as the
/// first request, unless `allow_private` is set.
pub fn page_client(
    user_agent: &str,
    timeout: Duration,
    allow_private: bool,
) -> varnika_shared::Result<Client> {
    let redirects = Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if !allow_private && is_ssrf_target(attempt.url()) {
            let target = attempt.url().to_string();
            attempt.error(format!("redirect to private or non-http target {target}"))
        } else {
            attempt.follow()
        }
    });
    build_client_with_redirects(user_agent, timeout, redirects)
}

/// Page-fetch capability over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    client: Client,
    max_chars: usize,
    /// Allow localhost/private IPs (for integration tests with mock servers).
    allow_private: bool,
}

impl HttpPageFetcher {
    pub fn new(client: Client, max_chars: usize) -> Self {
        Self {
            client,
            max_chars,
            allow_private: false,
        }
    }

    /// Allow fetching localhost/private IPs.
    pub fn allow_private(mut self) -> Self {
        self.allow_private = true;
        self
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<RawPage, UpstreamError> {
        if !self.allow_private && is_ssrf_target(url) {
            return Err(UpstreamError::NotReachable(format!(
                "{url}: refusing to fetch private or non-http target"
            )));
        }

        let response = self.client.get(url.as_str()).send().await.map_err(|e| {
            if e.is_redirect() {
                UpstreamError::NotReachable(format!("{url}: refused redirect: {e}"))
            } else {
                classify_send_error(&e)
            }
        })?;
        let response = check_status(response)?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_ascii_lowercase();
        if !(content_type.contains("html") || content_type.starts_with("text/")) {
            return Err(UpstreamError::Failed(format!(
                "{url}: unsupported content type {content_type}"
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| classify_send_error(&e))?;

        let page = if content_type.contains("html") {
            html_to_page(url, &body, self.max_chars)?
        } else {
            RawPage {
                url: url.to_string(),
                title: None,
                content_hash: compute_hash(&body),
                text: truncate_chars(body.trim(), self.max_chars),
            }
        };
        debug!(%url, chars = page.text.len(), "page fetched");
        Ok(page)
    }
}

/// Convert an HTML document into a [`RawPage`].
pub fn html_to_page(url: &Url, html: &str, max_chars: usize) -> Result<RawPage, UpstreamError> {
    let doc = Html::parse_document(html);
    let title = extract_title(&doc);
    let content_html = extract_content_html(&doc);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIP_TAGS.to_vec())
        .build();
    let markdown = converter
        .convert(&content_html)
        .map_err(|e| UpstreamError::Failed(format!("{url}: html conversion failed: {e}")))?;

    let text = collapse_blank_lines(markdown.trim());
    if text.is_empty() {
        return Err(UpstreamError::Failed(format!("{url}: page has no readable content")));
    }

    Ok(RawPage {
        url: url.to_string(),
        title,
        content_hash: compute_hash(&text),
        text: truncate_chars(&text, max_chars),
    })
}

fn extract_title(doc: &Html) -> Option<String> {
    static TITLE_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("title").expect("valid selector"));
    static H1_SEL: LazyLock<Selector> =
        LazyLock::new(|| Selector::parse("h1").expect("valid selector"));

    [&*TITLE_SEL, &*H1_SEL].into_iter().find_map(|sel| {
        doc.select(sel)
            .next()
            .map(|el| el.text().collect::<String>().trim().to_string())
            .filter(|t| !t.is_empty())
    })
}

fn extract_content_html(doc: &Html) -> String {
    for sel_str in CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(sel_str) {
            if let Some(el) = doc.select(&selector).next() {
                return el.inner_html();
            }
        }
    }
    if let Ok(body_sel) = Selector::parse("body") {
        if let Some(body) = doc.select(&body_sel).next() {
            return body.inner_html();
        }
    }
    doc.root_element().inner_html()
}

fn collapse_blank_lines(text: &str) -> String {
    static MULTI_BLANK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));
    MULTI_BLANK_RE.replace_all(text, "\n\n").into_owned()
}

/// Cut `text` to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// SHA-256 hex digest of page content.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    match url.host() {
        Some(url::Host::Ipv4(v4)) => is_private_ip(&IpAddr::V4(v4)),
        Some(url::Host::Ipv6(v6)) => is_private_ip(&IpAddr::V6(v6)),
        Some(url::Host::Domain(host)) => {
            host == "localhost" || host.ends_with(".local") || host.ends_with(".internal")
        }
        None => true,
    }
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
