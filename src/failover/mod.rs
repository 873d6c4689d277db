//! Endpoint failover controller
//!
//! One logical call walks the model's candidate endpoints in order. Each
//! endpoint gets a [`RetryExecutor`] run: transient errors are retried with
//! backoff, anything else that allows failover moves straight on. A pinned
//! endpoint is tried alone and its error is returned unchanged. Running out
//! of candidates yields [`BatchboxError::AllEndpointsExhausted`] with one
//! [`EndpointFailure`] per endpoint tried.

pub mod selector;

use std::borrow::Cow;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{info, warn};

use crate::adapter::{DispatchTarget, GenericAdapter};
use crate::config::ConfigDocument;
use crate::error::{BatchboxError, EndpointFailure, Result};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::types::{Mode, NormalizedResult, RequestContext};

pub use selector::{Candidate, RoundRobin, Selection, select};

/// A successful call and where it landed
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub result: NormalizedResult,
    /// Label of the endpoint that succeeded
    pub endpoint: String,
    pub provider: String,
    /// Attempts on the successful endpoint
    pub attempts: u32,
    /// Endpoints that failed before this one
    pub trail: Vec<EndpointFailure>,
}

impl Dispatched {
    /// Attempts across every endpoint tried
    pub fn total_attempts(&self) -> u32 {
        self.attempts + self.trail.iter().map(|f| f.attempts).sum::<u32>()
    }
}

pub struct FailoverController {
    adapter: GenericAdapter,
    rotation: RoundRobin,
}

impl FailoverController {
    pub fn new(adapter: GenericAdapter) -> Self {
        Self {
            adapter,
            rotation: RoundRobin::new(),
        }
    }

    pub fn adapter(&self) -> &GenericAdapter {
        &self.adapter
    }

    /// Dispatch one call for `ctx.model`, failing over as configured
    pub async fn dispatch(
        &self,
        doc: &ConfigDocument,
        ctx: &RequestContext,
        pin: Option<&str>,
    ) -> Result<Dispatched> {
        let selection = select(doc, &ctx.model, &ctx.mode, pin, &self.rotation)?;
        let executor = RetryExecutor::new(RetryPolicy::from_settings(&doc.settings)?);
        let mut trail = Vec::new();

        for (position, candidate) in selection.candidates.iter().enumerate() {
            let call_ctx = context_for(ctx, candidate.mode_name);
            let target = DispatchTarget {
                provider_name: candidate.provider_name,
                provider: candidate.provider,
                endpoint: candidate.endpoint,
                mode: candidate.mode,
                retry_on: &doc.settings.retry_on,
            };
            let attempts = AtomicU32::new(0);

            let outcome = executor
                .execute_with_handler(
                    || {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        self.adapter.execute(target, &call_ctx, attempt)
                    },
                    |error, attempt| {
                        warn!(
                            model = %ctx.model,
                            endpoint = candidate.label(),
                            attempt = attempt + 1,
                            error = %error,
                            "endpoint attempt failed"
                        );
                        true
                    },
                )
                .await;
            let attempts = attempts.load(Ordering::SeqCst);

            match outcome {
                Ok(result) => {
                    if position > 0 {
                        info!(
                            model = %ctx.model,
                            endpoint = candidate.label(),
                            failed_endpoints = trail.len(),
                            "succeeded after failover"
                        );
                    }
                    return Ok(Dispatched {
                        result,
                        endpoint: candidate.label().to_string(),
                        provider: candidate.provider_name.to_string(),
                        attempts,
                        trail,
                    });
                }
                Err(error) if selection.pinned || !error.allows_failover() => {
                    return Err(error.with_attempts(attempts));
                }
                Err(error) => {
                    trail.push(EndpointFailure {
                        endpoint: candidate.label().to_string(),
                        provider: candidate.provider_name.to_string(),
                        attempts,
                        error: Box::new(error.with_attempts(attempts)),
                    });
                }
            }
        }

        Err(BatchboxError::AllEndpointsExhausted {
            model: ctx.model.clone(),
            trail,
        })
    }
}

/// The request context for a candidate, switched to its fallback mode if needed
fn context_for<'c>(ctx: &'c RequestContext, mode_name: &str) -> Cow<'c, RequestContext> {
    if ctx.mode.as_str() == mode_name {
        Cow::Borrowed(ctx)
    } else {
        let mut switched = ctx.clone();
        switched.mode = Mode::from(mode_name);
        Cow::Owned(switched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HttpRequest, HttpResponse, HttpTransport, TransportError};
    use async_trait::async_trait;
    use reqwest::header::HeaderMap;
    use std::sync::{Arc, Mutex};

    /// Replies by URL substring; records every URL hit
    struct Scripted {
        routes: Vec<(&'static str, u16, &'static str)>,
        hits: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl HttpTransport for Scripted {
        async fn send(&self, request: HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
            self.hits.lock().unwrap().push(request.url.clone());
            let (_, status, body) = self
                .routes
                .iter()
                .find(|(needle, _, _)| request.url.contains(needle))
                .copied()
                .unwrap_or(("", 404, "{}"));
            Ok(HttpResponse {
                status,
                headers: HeaderMap::new(),
                body: body.as_bytes().to_vec(),
            })
        }
    }

    const DOC: &str = r#"
settings: {max_retries: 2, retry_delay: 0.001}
providers:
  one: {base_url: "https://one.example.com", api_key: "k"}
  two: {base_url: "https://two.example.com", api_key: "k"}
models:
  flux:
    api_endpoints:
      - {provider: one, priority: 1, modes: {text2img: {path: /gen, response_path: "data[0]"}}}
      - {provider: two, priority: 2, modes: {text2img: {path: /gen, response_path: "data[0]"}}}
"#;

    fn controller(routes: Vec<(&'static str, u16, &'static str)>) -> (FailoverController, Arc<Scripted>) {
        let transport = Arc::new(Scripted {
            routes,
            hits: Mutex::new(Vec::new()),
        });
        let adapter = GenericAdapter::new(transport.clone());
        (FailoverController::new(adapter), transport)
    }

    fn ctx() -> RequestContext {
        RequestContext::new("flux", Mode::TextToImage, "a cat")
    }

    const OK_BODY: &str = r#"{"data": [{"b64_json": "AQID"}]}"#;

    #[tokio::test]
    async fn transient_is_retried_then_fails_over() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let (controller, transport) =
            controller(vec![("one.", 503, "{}"), ("two.", 200, OK_BODY)]);
        let dispatched = controller.dispatch(&doc, &ctx(), None).await.unwrap();
        assert_eq!(dispatched.provider, "two");
        assert_eq!(dispatched.attempts, 1);
        assert_eq!(dispatched.trail.len(), 1);
        assert_eq!(dispatched.trail[0].attempts, 3);
        assert_eq!(dispatched.total_attempts(), 4);
        assert_eq!(transport.hits.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn permanent_fails_over_without_retry() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let (controller, _) = controller(vec![("one.", 400, "{}"), ("two.", 200, OK_BODY)]);
        let dispatched = controller.dispatch(&doc, &ctx(), None).await.unwrap();
        assert_eq!(dispatched.trail[0].attempts, 1);
        assert_eq!(dispatched.trail[0].error.code(), "permanent_provider_error");
    }

    #[tokio::test]
    async fn exhaustion_carries_trail() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let (controller, _) = controller(vec![("one.", 401, "{}"), ("two.", 500, "{}")]);
        let err = controller.dispatch(&doc, &ctx(), None).await.unwrap_err();
        match err {
            BatchboxError::AllEndpointsExhausted { model, trail } => {
                assert_eq!(model, "flux");
                assert_eq!(trail.len(), 2);
                assert_eq!(trail[0].attempts, 1);
                assert_eq!(trail[1].attempts, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pinned_error_propagates_directly() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let (controller, transport) =
            controller(vec![("one.", 400, "{}"), ("two.", 200, OK_BODY)]);
        let err = controller.dispatch(&doc, &ctx(), Some("one")).await.unwrap_err();
        assert_eq!(err.code(), "permanent_provider_error");
        assert_eq!(err.attempts(), Some(1));
        assert_eq!(transport.hits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pinned_transient_error_reports_every_attempt() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let (controller, transport) = controller(vec![("one.", 503, "{}")]);
        let err = controller.dispatch(&doc, &ctx(), Some("one")).await.unwrap_err();
        assert_eq!(err.code(), "transient_provider_error");
        assert_eq!(err.attempts(), Some(3));
        assert_eq!(transport.hits.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn template_error_does_not_fail_over() {
        let doc = ConfigDocument::from_yaml_str(
            r#"
providers:
  one: {base_url: "https://one.example.com", api_key: "k"}
  two: {base_url: "https://two.example.com", api_key: "k"}
models:
  flux:
    api_endpoints:
      - {provider: one, priority: 1, modes: {text2img: {path: /gen, payload_template: {size: "{{size}}"}}}}
      - {provider: two, priority: 2, modes: {text2img: {path: /gen, response_path: "data[0]"}}}
"#,
        )
        .unwrap();
        let (controller, transport) = controller(vec![("two.", 200, OK_BODY)]);
        let err = controller.dispatch(&doc, &ctx(), None).await.unwrap_err();
        assert_eq!(err.code(), "template_error");
        assert!(transport.hits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_mode_falls_back_to_the_other_image_mode() {
        let doc = ConfigDocument::from_yaml_str(
            r#"
providers:
  one: {base_url: "https://one.example.com", api_key: "k"}
models:
  flux:
    api_endpoints:
      - {provider: one, modes: {img2img: {path: /edit, response_path: "data[0]"}}}
"#,
        )
        .unwrap();
        let (controller, transport) = controller(vec![("/edit", 200, OK_BODY)]);
        let dispatched = controller.dispatch(&doc, &ctx(), None).await.unwrap();
        assert_eq!(dispatched.provider, "one");
        assert_eq!(
            transport.hits.lock().unwrap().as_slice(),
            ["https://one.example.com/edit".to_string()]
        );
    }
}
