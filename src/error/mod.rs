//! Error handling
//!
//! The error taxonomy, HTTP failure classification and host-facing summaries.

pub mod helpers;
mod types;

pub use helpers::{ErrorKind, ErrorSummary, classify_http_error, summarize_error};
pub use types::{BatchboxError, EndpointFailure, ErrorCategory, Result};
