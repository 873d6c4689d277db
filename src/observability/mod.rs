//! Logging and tracing instrumentation
//!
//! [`DispatchTracer`] emits the structured events of one provider call;
//! [`subscriber`] installs a `tracing-subscriber` for hosts that want one.

pub mod subscriber;

use std::time::Instant;

use reqwest::header::HeaderMap;
use tracing::{debug, error, info, warn};

pub use subscriber::{OutputFormat, SubscriberConfig, init_from_env, init_subscriber};

/// Mask a secret for logging, keeping a short prefix and suffix
pub fn mask_sensitive_value(value: &str) -> String {
    if let Some(token) = value.strip_prefix("Bearer ") {
        return format!("Bearer {}", mask_sensitive_value(token));
    }
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}

/// Headers as a JSON object, with credentials masked
pub fn format_headers_for_logging(headers: &HeaderMap) -> String {
    let map: std::collections::BTreeMap<&str, String> = headers
        .iter()
        .map(|(k, v)| {
            let value = v.to_str().unwrap_or("<invalid>");
            let name = k.as_str();
            let masked = if name.contains("authorization")
                || name.contains("key")
                || name.contains("token")
            {
                mask_sensitive_value(value)
            } else {
                value.to_string()
            };
            (name, masked)
        })
        .collect();
    serde_json::to_string(&map).unwrap_or_else(|_| format!("{map:?}"))
}

/// Structured events for one call against one endpoint
#[derive(Debug, Clone)]
pub struct DispatchTracer {
    provider: String,
    endpoint: String,
    model: String,
    batch_index: usize,
}

impl DispatchTracer {
    pub fn new(
        provider: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        batch_index: usize,
    ) -> Self {
        Self {
            provider: provider.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            batch_index,
        }
    }

    pub fn trace_request_start(&self, method: &str, url: &str, attempt: u32) {
        info!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            model = %self.model,
            batch_index = self.batch_index,
            attempt,
            method = %method,
            url = %url,
            "Request started"
        );
    }

    pub fn trace_request_details(&self, headers: &HeaderMap, body: Option<&serde_json::Value>) {
        debug!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            request_headers = %format_headers_for_logging(headers),
            request_body = %body.map(truncated_json).unwrap_or_default(),
            "Request details"
        );
    }

    pub fn trace_response_success(&self, status: u16, started: Instant, response_length: usize) {
        info!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            model = %self.model,
            batch_index = self.batch_index,
            status,
            duration_ms = started.elapsed().as_millis() as u64,
            response_length,
            "Request completed"
        );
    }

    pub fn trace_request_error(&self, status: Option<u16>, error_text: &str, started: Instant) {
        error!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            model = %self.model,
            batch_index = self.batch_index,
            status = ?status,
            error_text = %error_text,
            duration_ms = started.elapsed().as_millis() as u64,
            "Request failed"
        );
    }

    pub fn trace_poll(&self, task_id: &str, poll: u32, status: Option<&str>) {
        debug!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            task_id = %task_id,
            poll,
            status = ?status,
            "Polled task"
        );
    }

    pub fn trace_download_failure(&self, url: &str, error_text: &str) {
        warn!(
            provider = %self.provider,
            endpoint = %self.endpoint,
            url = %url,
            error_text = %error_text,
            "Result download failed"
        );
    }
}

/// Compact JSON for logs; long strings (base64 payloads) are shortened
fn truncated_json(value: &serde_json::Value) -> String {
    const LIMIT: usize = 2048;
    let text = value.to_string();
    if text.len() <= LIMIT {
        return text;
    }
    let cut: String = text.chars().take(LIMIT).collect();
    format!("{cut}...({} bytes)", text.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn masks_bearer_tokens_and_keys() {
        assert_eq!(mask_sensitive_value("Bearer sk-1234567890"), "Bearer sk-1...7890");
        assert_eq!(mask_sensitive_value("short"), "*****");
    }

    #[test]
    fn header_logging_masks_credentials_only() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-abcdefghijkl"));
        headers.insert("x-goog-api-key", HeaderValue::from_static("AIzaSyExampleKey"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        let logged = format_headers_for_logging(&headers);
        assert!(!logged.contains("abcdefghijkl"));
        assert!(!logged.contains("AIzaSyExampleKey"));
        assert!(logged.contains("application/json"));
    }

    #[test]
    fn truncates_large_bodies() {
        let body = serde_json::json!({"data": "x".repeat(10_000)});
        let text = truncated_json(&body);
        assert!(text.len() < 2200);
        assert!(text.ends_with("bytes)"));
    }
}
