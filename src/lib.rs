//! # batchbox
//!
//! Request resolution and dispatch for hosted AI generation providers.
//!
#![deny(unsafe_code)]

//! A request names a model, a mode and a bag of parameters. batchbox turns
//! it into correctly shaped HTTP calls against the model's configured
//! endpoints, fails over between them and retries transient errors. A batch
//! of N runs concurrently under mode-aware limits, and identical inputs are
//! served from a content-addressed cache.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use batchbox::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(ConfigStore::open("api_config.yaml", None)?);
//!     let generator = Generator::builder(store).build()?;
//!
//!     let request = GenerationRequest::new("flux-pro", "a lighthouse at dusk")
//!         .with_batch_count(4)
//!         .with_seed(42);
//!     let result = generator.generate(request).await;
//!     for outcome in &result.outcomes {
//!         match &outcome.error {
//!             None => println!("#{}: {} images", outcome.index, outcome.binary_outputs.len()),
//!             Some(e) => println!("#{}: {}", outcome.index, summarize_error(e).message),
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Layout
//!
//! - [`config`]: typed schema, layered setting resolver, hot-reload store
//! - [`template`]: placeholder rendering and multipart assembly
//! - [`adapter`]: openai and gemini dialects, async polling, URL download
//! - [`failover`]: endpoint selection, retry and failover
//! - [`orchestrator`]: batch fan-out under concurrency limits
//! - [`cache`]: fingerprints and the cache gate
//! - [`generator`]: the `generate` entry point

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod failover;
pub mod generator;
pub mod http;
pub mod observability;
pub mod orchestrator;
pub mod retry;
pub mod template;
pub mod types;

pub use error::{BatchboxError, Result};
pub use generator::{Generator, GeneratorBuilder};

pub mod prelude {
    pub use crate::cache::{CacheGate, InMemoryResultCache, ResultCache};
    pub use crate::config::{Category, ConfigDocument, ConfigStore};
    pub use crate::error::{BatchboxError, ErrorSummary, Result, summarize_error};
    pub use crate::generator::{Generator, GeneratorBuilder};
    pub use crate::http::{HttpTransport, ReqwestTransport};
    pub use crate::orchestrator::{BatchObserver, ConcurrencyPolicy};
    pub use crate::types::{
        AttachmentSource, BatchOutcome, BatchResult, GenerationRequest, Mode, NormalizedResult,
    };
}
