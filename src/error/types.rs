//! Core error types

use serde::Serialize;
use thiserror::Error;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, BatchboxError>;

/// Coarse error category used by retry and failover decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    Template,
    Transient,
    Permanent,
    Exhausted,
    Timeout,
    Internal,
}

/// One endpoint's contribution to an exhausted failover run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointFailure {
    /// Endpoint label (display name, or provider name when unnamed)
    pub endpoint: String,
    pub provider: String,
    /// Number of attempts made against this endpoint
    pub attempts: u32,
    /// Last error observed on this endpoint
    pub error: Box<BatchboxError>,
}

/// Error taxonomy of the dispatch engine.
///
/// Every variant is cloneable and serializable so that a per-item breakdown
/// can be handed to the host as-is.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BatchboxError {
    /// Invalid or missing configuration. Never retried.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A required placeholder had no bound value and no default.
    #[error("Template error: {message}")]
    Template {
        message: String,
        placeholder: Option<String>,
    },

    /// Network failure, timeout, 408, 429 or 5xx.
    #[error("Transient provider error from {provider} ({endpoint}): {message}")]
    TransientProvider {
        provider: String,
        endpoint: String,
        status: Option<u16>,
        message: String,
        request_ids: Vec<String>,
        /// Attempts made against this endpoint, retries included
        attempts: u32,
    },

    /// Non-retryable provider response (4xx other than rate limiting, unusable body).
    #[error("Provider error from {provider} ({endpoint}): {message}")]
    PermanentProvider {
        provider: String,
        endpoint: String,
        status: Option<u16>,
        message: String,
        request_ids: Vec<String>,
        /// Attempts made against this endpoint, retries included
        attempts: u32,
    },

    /// Every candidate endpoint failed.
    #[error("All endpoints exhausted for model '{model}' ({} endpoints tried)", .trail.len())]
    AllEndpointsExhausted {
        model: String,
        trail: Vec<EndpointFailure>,
    },

    /// An async task did not reach its success status within the poll budget.
    #[error("Task {task_id} on {provider} did not complete after {polls} polls")]
    PollTimeout {
        provider: String,
        endpoint: String,
        task_id: String,
        polls: u32,
        attempts: u32,
    },

    /// The caller-level timeout aborted a batch item.
    #[error("Batch item {index} timed out after {timeout_ms}ms")]
    TaskTimeout { index: usize, timeout_ms: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl BatchboxError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn template(message: impl Into<String>, placeholder: Option<&str>) -> Self {
        Self::Template {
            message: message.into(),
            placeholder: placeholder.map(str::to_string),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether a retry against the same endpoint may succeed
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientProvider { .. })
    }

    /// Whether the failover controller should move on to another endpoint
    pub const fn allows_failover(&self) -> bool {
        matches!(
            self,
            Self::TransientProvider { .. } | Self::PermanentProvider { .. } | Self::PollTimeout { .. }
        )
    }

    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Config { .. } => ErrorCategory::Configuration,
            Self::Template { .. } => ErrorCategory::Template,
            Self::TransientProvider { .. } => ErrorCategory::Transient,
            Self::PermanentProvider { .. } => ErrorCategory::Permanent,
            Self::AllEndpointsExhausted { .. } => ErrorCategory::Exhausted,
            Self::PollTimeout { .. } | Self::TaskTimeout { .. } => ErrorCategory::Timeout,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config_error",
            Self::Template { .. } => "template_error",
            Self::TransientProvider { .. } => "transient_provider_error",
            Self::PermanentProvider { .. } => "permanent_provider_error",
            Self::AllEndpointsExhausted { .. } => "all_endpoints_exhausted",
            Self::PollTimeout { .. } => "poll_timeout",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status carried by provider errors
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::TransientProvider { status, .. } | Self::PermanentProvider { status, .. } => {
                *status
            }
            Self::AllEndpointsExhausted { trail, .. } => {
                trail.last().and_then(|f| f.error.status_code())
            }
            _ => None,
        }
    }

    /// Provider name when the error is attributable to one
    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::TransientProvider { provider, .. }
            | Self::PermanentProvider { provider, .. }
            | Self::PollTimeout { provider, .. } => Some(provider),
            Self::AllEndpointsExhausted { trail, .. } => trail.last().map(|f| f.provider.as_str()),
            _ => None,
        }
    }

    /// Endpoint label when the error is attributable to one
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::TransientProvider { endpoint, .. }
            | Self::PermanentProvider { endpoint, .. }
            | Self::PollTimeout { endpoint, .. } => Some(endpoint),
            Self::AllEndpointsExhausted { trail, .. } => trail.last().map(|f| f.endpoint.as_str()),
            _ => None,
        }
    }

    /// Attempts spent before this error surfaced; summed over the trail
    /// when every endpoint failed
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::TransientProvider { attempts, .. }
            | Self::PermanentProvider { attempts, .. }
            | Self::PollTimeout { attempts, .. } => Some(*attempts),
            Self::AllEndpointsExhausted { trail, .. } => Some(trail.iter().map(|f| f.attempts).sum()),
            _ => None,
        }
    }

    /// Record how many attempts an endpoint received before this error
    pub fn with_attempts(mut self, count: u32) -> Self {
        if let Self::TransientProvider { attempts, .. }
        | Self::PermanentProvider { attempts, .. }
        | Self::PollTimeout { attempts, .. } = &mut self
        {
            *attempts = count;
        }
        self
    }
}

impl From<serde_json::Error> for BatchboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(format!("JSON error: {err}"))
    }
}

impl From<serde_yaml::Error> for BatchboxError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::config(format!("YAML error: {err}"))
    }
}

impl From<std::io::Error> for BatchboxError {
    fn from(err: std::io::Error) -> Self {
        Self::internal(format!("IO error: {err}"))
    }
}
