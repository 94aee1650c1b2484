//! URL helpers shared by discovery and the sources ledger.

use url::Url;

/// Query parameters that only track clicks and never change the page.
const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "msclkid", "yclid", "mc_cid", "mc_eid", "_ga", "ref_src",
];

fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key)
}

/// Whether `raw` is an absolute `http://` or `https://` URL with a host.
pub fn is_http_url(raw: &str) -> bool {
    Url::parse(raw.trim())
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

/// Canonical form used to compare URLs.
///
/// Scheme and host are lower-cased (the URL parser does this), the fragment
/// and tracking parameters are dropped and a trailing slash is removed.
/// Returns `None` for anything that is not an http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return None;
    }
    url.set_fragment(None);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(&kept);
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    let mut s = url.to_string();
    if url.query().is_none() && s.ends_with('/') {
        s.pop();
    }
    Some(s)
}
