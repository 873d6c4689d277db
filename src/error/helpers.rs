//! Error classification and user-facing summaries.
//!
//! `classify_http_error` turns a raw provider response into the transient /
//! permanent split the failover controller acts on. `summarize_error` gives
//! the host a flat, serializable view of any error for per-item display.

use reqwest::header::HeaderMap;
use serde::Serialize;

use super::types::BatchboxError;

/// Statuses that are transient regardless of configuration
const ALWAYS_TRANSIENT: [u16; 2] = [408, 429];

/// Request/trace identifiers worth keeping for diagnostics
const REQUEST_ID_HEADERS: [&str; 6] = [
    "x-request-id",
    "x-response-id",
    "x-openai-request-id",
    "x-trace-id",
    "x-correlation-id",
    "x-goog-request-id",
];

/// Classify an HTTP failure into a transient or permanent provider error.
///
/// 408, 429, any 5xx and any status listed in `retry_on` are transient;
/// everything else is permanent.
pub fn classify_http_error(
    provider: &str,
    endpoint: &str,
    status: u16,
    body_text: &str,
    headers: &HeaderMap,
    retry_on: &[u16],
) -> BatchboxError {
    let request_ids: Vec<String> = REQUEST_ID_HEADERS
        .iter()
        .filter_map(|k| {
            headers
                .get(*k)
                .and_then(|v| v.to_str().ok())
                .map(|v| format!("{k}={v}"))
        })
        .collect();

    // Limit body sample size to avoid noisy logs
    let body_sample: String = body_text.chars().take(200).collect();
    let mut message = format!("http={status} body_sample={body_sample}");
    if status == 429
        && let Some(retry_after) = headers.get("retry-after").and_then(|v| v.to_str().ok())
    {
        message.push_str(&format!(" retry_after={retry_after}"));
    }

    let transient =
        status >= 500 || ALWAYS_TRANSIENT.contains(&status) || retry_on.contains(&status);

    if transient {
        BatchboxError::TransientProvider {
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            status: Some(status),
            message,
            request_ids,
            attempts: 1,
        }
    } else {
        BatchboxError::PermanentProvider {
            provider: provider.to_string(),
            endpoint: endpoint.to_string(),
            status: Some(status),
            message,
            request_ids,
            attempts: 1,
        }
    }
}

/// Error kind for presentation (coarse-grained)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Template,
    Auth,
    RateLimit,
    Client,
    Server,
    Network,
    Timeout,
    Exhausted,
    Internal,
}

/// Structured error summary for host/UI consumption
#[derive(Debug, Clone, Serialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub status: Option<u16>,
    pub message: String,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    pub attempts: Option<u32>,
    pub suggestions: Vec<String>,
}

/// Summarize an error with friendly suggestions.
pub fn summarize_error(err: &BatchboxError) -> ErrorSummary {
    let kind = map_error_kind(err);
    ErrorSummary {
        kind,
        code: err.code(),
        status: err.status_code(),
        message: err.to_string(),
        provider: err.provider().map(str::to_string),
        endpoint: err.endpoint().map(str::to_string),
        attempts: err.attempts(),
        suggestions: suggest_fixes(kind),
    }
}

fn map_error_kind(err: &BatchboxError) -> ErrorKind {
    match err {
        BatchboxError::Config { .. } => ErrorKind::Config,
        BatchboxError::Template { .. } => ErrorKind::Template,
        BatchboxError::AllEndpointsExhausted { .. } => ErrorKind::Exhausted,
        BatchboxError::PollTimeout { .. } | BatchboxError::TaskTimeout { .. } => {
            ErrorKind::Timeout
        }
        BatchboxError::Internal { .. } => ErrorKind::Internal,
        BatchboxError::TransientProvider { status, .. }
        | BatchboxError::PermanentProvider { status, .. } => match status {
            Some(401) | Some(403) => ErrorKind::Auth,
            Some(429) => ErrorKind::RateLimit,
            Some(408) => ErrorKind::Timeout,
            Some(s) if *s >= 500 => ErrorKind::Server,
            Some(_) => ErrorKind::Client,
            None => ErrorKind::Network,
        },
    }
}

fn suggest_fixes(kind: ErrorKind) -> Vec<String> {
    let hints: &[&str] = match kind {
        ErrorKind::Config => &[
            "Check the providers/models/api_endpoints sections of the configuration",
            "Run config validation to list structural problems",
        ],
        ErrorKind::Template => &["Bind the missing parameter or give the placeholder a default"],
        ErrorKind::Auth => &["Verify the provider api_key (secrets file overrides the main config)"],
        ErrorKind::RateLimit => &["Lower the batch size or add another endpoint for this model"],
        ErrorKind::Client => &["Check the request parameters against the provider's API"],
        ErrorKind::Server | ErrorKind::Network => {
            &["The provider is unavailable; a lower-priority endpoint may help"]
        }
        ErrorKind::Timeout => &["Increase default_timeout or the polling budget"],
        ErrorKind::Exhausted => &["Every endpoint failed; inspect the per-endpoint trail"],
        ErrorKind::Internal => &[],
    };
    hints.iter().map(|s| s.to_string()).collect()
}
