//! HTTP plumbing shared by every capability that talks to the network.
//!
//! Responses and transport errors are classified into [`UpstreamError`] so
//! the gate can tell a 429 apart from everything else.

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::redirect::Policy;
use reqwest::{Client, Response};
use varnika_shared::{Result, UpstreamError, VarnikaError};

/// Maximum number of redirects followed by Varnika clients.
pub const MAX_REDIRECTS: usize = 5;

/// Build a reqwest client with the given user agent and request timeout.
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client> {
    build_client_with_redirects(user_agent, timeout, Policy::limited(MAX_REDIRECTS))
}

/// Like [`build_client`], with a caller-supplied redirect policy.
pub fn build_client_with_redirects(
    user_agent: &str,
    timeout: Duration,
    redirects: Policy,
) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .redirect(redirects)
        .timeout(timeout)
        .build()
        .map_err(|e| VarnikaError::config(format!("failed to build HTTP client: {e}")))
}

/// Pass successful responses through; turn everything else into an [`UpstreamError`].
pub fn check_status(response: Response) -> std::result::Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    Err(classify_status(status.as_u16(), retry_after))
}

/// Map a non-success HTTP status to an [`UpstreamError`].
pub fn classify_status(status: u16, retry_after: Option<Duration>) -> UpstreamError {
    match status {
        429 => UpstreamError::RateLimited { retry_after },
        408 | 504 => UpstreamError::Timeout,
        500..=599 => UpstreamError::Unavailable(format!("HTTP {status}")),
        _ => UpstreamError::Failed(format!("HTTP {status}")),
    }
}

/// Map a transport-level reqwest failure.
pub fn classify_send_error(err: &reqwest::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout
    } else if err.is_connect() {
        UpstreamError::NotReachable(err.to_string())
    } else if let Some(status) = err.status() {
        classify_status(status.as_u16(), None)
    } else {
        UpstreamError::Failed(err.to_string())
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}
