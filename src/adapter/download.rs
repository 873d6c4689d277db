//! Fetching URL references into binary outputs

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use reqwest::header::HeaderMap;

use crate::http::{HttpRequest, HttpTransport};
use crate::observability::DispatchTracer;
use crate::types::{BinaryOutput, NormalizedResult};

/// Attempts per URL
pub const DOWNLOAD_ATTEMPTS: u32 = 3;

fn download_backoff() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(5))
        .with_multiplier(2.0)
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .build()
}

/// Download one URL with bounded retries
pub async fn download(transport: &dyn HttpTransport, url: &str) -> Result<Vec<u8>, String> {
    let attempts = AtomicU32::new(0);
    backoff::future::retry(download_backoff(), || async {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match transport
            .send(HttpRequest::get(url, HeaderMap::new()))
            .await
        {
            Ok(response) if response.is_success() && !response.body.is_empty() => {
                return Ok(response.body);
            }
            Ok(response) if response.is_success() => "empty body".to_string(),
            Ok(response) => format!("http {}", response.status),
            Err(e) => e.to_string(),
        };
        if attempt >= DOWNLOAD_ATTEMPTS {
            Err(backoff::Error::permanent(outcome))
        } else {
            Err(backoff::Error::transient(outcome))
        }
    })
    .await
}

/// Replace downloadable URL references of `result` with their bytes.
///
/// URLs that fail every attempt stay in `image_urls`.
pub(crate) async fn resolve_urls(
    transport: &dyn HttpTransport,
    result: &mut NormalizedResult,
    tracer: &DispatchTracer,
) {
    let urls = std::mem::take(&mut result.image_urls);
    let fetched = futures::future::join_all(urls.iter().map(|url| download(transport, url))).await;
    for (url, outcome) in urls.into_iter().zip(fetched) {
        match outcome {
            Ok(bytes) => {
                let mut output = BinaryOutput::new(bytes);
                output.source_url = Some(url);
                result.binary_outputs.push(output);
            }
            Err(e) => {
                tracer.trace_download_failure(&url, &e);
                result.image_urls.push(url);
            }
        }
    }
}
