//! Provider adapter
//!
//! Turns one resolved (mode, endpoint, provider) triple plus a
//! [`RequestContext`] into a single HTTP call and normalizes whatever comes
//! back into a [`NormalizedResult`]. Two wire dialects are supported:
//!
//! - [`openai`]: template-driven JSON, multipart or form bodies; sync results
//!   are extracted with a `response_path`, async ones are polled
//! - [`gemini`]: `contents` / `generationConfig` requests and `candidates`
//!   responses
//!
//! Retries and endpoint switching live one level up, in
//! [`crate::failover`]; an adapter call is exactly one attempt.

pub mod download;
pub mod gemini;
pub mod openai;
mod polling;

use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::config::{
    ApiFormat, Category, EndpointConfig, ModeConfig, ProviderConfig, ResolvedMode, ResponseType,
};
use crate::error::{BatchboxError, Result, classify_http_error};
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::observability::DispatchTracer;
use crate::types::{NormalizedResult, RequestContext};

use polling::PollJob;

/// Error text for media models that returned nothing usable
pub const NO_IMAGES: &str = "No images found in response";
const NO_OUTPUT: &str = "No output found in response";

/// Behaviour switches of [`GenericAdapter`]
#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// Fetch URL references into binary outputs
    pub download_urls: bool,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            download_urls: true,
        }
    }
}

/// One concrete place to send a request
#[derive(Debug, Clone, Copy)]
pub struct DispatchTarget<'a> {
    pub provider_name: &'a str,
    pub provider: &'a ProviderConfig,
    pub endpoint: &'a EndpointConfig,
    pub mode: &'a ModeConfig,
    /// Extra statuses treated as transient
    pub retry_on: &'a [u16],
}

/// Model identifier sent on the wire: the endpoint's `model_name`, else the
/// requested model
pub(crate) fn wire_model<'a>(ctx: &'a RequestContext, endpoint: &'a EndpointConfig) -> &'a str {
    if endpoint.model_name.is_empty() {
        &ctx.model
    } else {
        &endpoint.model_name
    }
}

/// Variables a payload template is rendered against.
///
/// Request parameters first, then the reserved names, which win.
pub(crate) fn template_vars(
    ctx: &RequestContext,
    endpoint: &EndpointConfig,
    prompt: &str,
) -> Map<String, Value> {
    let mut vars = ctx.parameters.clone();
    vars.insert("prompt".into(), Value::String(prompt.to_string()));
    match ctx.seed {
        Some(seed) => vars.insert("seed".into(), Value::from(seed)),
        None => vars.remove("seed"),
    };
    vars.insert("model".into(), Value::String(wire_model(ctx, endpoint).to_string()));
    vars.insert("batch_index".into(), Value::from(ctx.batch_index));
    vars.insert("mode".into(), Value::String(ctx.mode.as_str().to_string()));
    vars
}

fn effective_prompt(resolved: &ResolvedMode, ctx: &RequestContext) -> String {
    if resolved.prompt_prefix.is_empty() {
        ctx.prompt.clone()
    } else {
        format!("{}{}", resolved.prompt_prefix, ctx.prompt)
    }
}

fn build_resolved(
    resolved: &ResolvedMode,
    mode: &ModeConfig,
    endpoint: &EndpointConfig,
    provider: &ProviderConfig,
    ctx: &RequestContext,
) -> Result<HttpRequest> {
    let prompt = effective_prompt(resolved, ctx);
    match resolved.api_format {
        ApiFormat::Gemini => gemini::build_request(resolved, mode, endpoint, provider, ctx, &prompt),
        ApiFormat::OpenAi => openai::build_request(resolved, mode, endpoint, provider, ctx, &prompt),
    }
}

/// Build the HTTP request for one call
pub fn build_request(
    mode: &ModeConfig,
    endpoint: &EndpointConfig,
    provider: &ProviderConfig,
    ctx: &RequestContext,
) -> Result<HttpRequest> {
    let resolved = ResolvedMode::resolve(mode, endpoint, provider)?;
    build_resolved(&resolved, mode, endpoint, provider, ctx)
}

/// Parse a 2xx response into a normalized result.
///
/// A body carrying `candidates` is read as Gemini whatever the configured
/// format. Media categories must yield media to count as a success.
pub fn parse_response(
    api_format: ApiFormat,
    resolved: &ResolvedMode,
    category: Category,
    response: &HttpResponse,
) -> NormalizedResult {
    match response.json() {
        Ok(data) => settle(parse_json(api_format, resolved, category, data), category),
        Err(e) => NormalizedResult::failure(
            format!("Response is not valid JSON: {e}"),
            Some(Value::String(response.text().chars().take(500).collect())),
        ),
    }
}

fn parse_json(
    api_format: ApiFormat,
    resolved: &ResolvedMode,
    category: Category,
    data: Value,
) -> NormalizedResult {
    if api_format == ApiFormat::Gemini || data.get("candidates").is_some() {
        gemini::parse_response(data)
    } else {
        openai::parse_response(resolved, category, data)
    }
}

/// Apply the category success rule to a parsed result
fn settle(mut result: NormalizedResult, category: Category) -> NormalizedResult {
    if result.task_id.is_some() {
        return result;
    }
    let usable = match category {
        Category::Text => result.has_media() || result.text_output.is_some(),
        _ => result.has_media(),
    };
    if !usable {
        result.success = false;
        if result.error.is_none() {
            let message = match category {
                Category::Text => NO_OUTPUT,
                _ => NO_IMAGES,
            };
            result.error = Some(message.to_string());
        }
    }
    result
}

/// Single-attempt adapter over an injectable transport
#[derive(Clone)]
pub struct GenericAdapter {
    transport: Arc<dyn HttpTransport>,
    options: AdapterOptions,
}

impl GenericAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            options: AdapterOptions::default(),
        }
    }

    pub fn with_options(mut self, options: AdapterOptions) -> Self {
        self.options = options;
        self
    }

    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }

    /// Run one attempt: build, send, classify, parse, poll and download.
    pub async fn execute(
        &self,
        target: DispatchTarget<'_>,
        ctx: &RequestContext,
        attempt: u32,
    ) -> Result<NormalizedResult> {
        let label = target.endpoint.label();
        let tracer = DispatchTracer::new(target.provider_name, label, &ctx.model, ctx.batch_index);

        let resolved = ResolvedMode::resolve(target.mode, target.endpoint, target.provider)?;
        let request = build_resolved(&resolved, target.mode, target.endpoint, target.provider, ctx)?;

        tracer.trace_request_start(request.method.as_str(), &request.url, attempt);
        tracer.trace_request_details(&request.headers, request.json_body());
        let started = Instant::now();

        let response = match self.transport.send(request).await {
            Ok(response) => response,
            Err(e) => {
                tracer.trace_request_error(None, &e.to_string(), started);
                return Err(BatchboxError::TransientProvider {
                    provider: target.provider_name.to_string(),
                    endpoint: label.to_string(),
                    status: None,
                    message: e.to_string(),
                    request_ids: Vec::new(),
                    attempts: 1,
                });
            }
        };

        if !response.is_success() {
            let text = response.text();
            tracer.trace_request_error(Some(response.status), &text, started);
            return Err(classify_http_error(
                target.provider_name,
                label,
                response.status,
                &text,
                &response.headers,
                target.retry_on,
            ));
        }
        tracer.trace_response_success(response.status, started, response.body.len());

        let mut result = parse_response(resolved.api_format, &resolved, ctx.category, &response);

        if resolved.response_type == ResponseType::Async
            && result.success
            && let Some(task_id) = result.task_id.take()
        {
            let job = PollJob {
                transport: self.transport.as_ref(),
                provider_name: target.provider_name,
                provider: target.provider,
                endpoint: label,
                polling: &resolved.polling,
                response_path: &resolved.response_path,
                category: ctx.category,
                tracer: &tracer,
            };
            result = settle(job.run(&task_id).await?, ctx.category);
            result.task_id = Some(task_id);
        }

        if !result.success {
            return Err(BatchboxError::PermanentProvider {
                provider: target.provider_name.to_string(),
                endpoint: label.to_string(),
                status: Some(response.status),
                message: result.error.unwrap_or_else(|| NO_IMAGES.to_string()),
                request_ids: Vec::new(),
                attempts: 1,
            });
        }

        if self.options.download_urls && !result.image_urls.is_empty() {
            download::resolve_urls(self.transport.as_ref(), &mut result, &tracer).await;
        }
        Ok(result)
    }
}
