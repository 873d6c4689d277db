//! OpenAI-style dialect (and the generic sync/async dialect built on it)

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::{template_vars, wire_model};
use crate::config::{
    Category, EndpointConfig, ModeConfig, ProviderConfig, ResolvedMode, ResponseType,
};
use crate::error::{BatchboxError, Result};
use crate::http::{HttpHeaderBuilder, HttpRequest, RequestBody};
use crate::template::{
    TemplateContext, TemplateEngine, get_all, get_string, multipart_body, text_fields,
};
use crate::types::{BinaryOutput, NormalizedResult, RequestContext};

/// Parameters copied into the body when the template does not place them
pub const AUTO_PARAMS: [&str; 11] = [
    "prompt",
    "n",
    "size",
    "quality",
    "style",
    "resolution",
    "aspect_ratio",
    "seed",
    "response_format",
    "upscale",
    "image_size",
];

/// Strings longer than this that decode as base64 are treated as binary
const BASE64_MIN_LEN: usize = 100;

static MARKDOWN_IMAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(([^)\s]+)(?:\s+"[^"]*")?\)"#).expect("markdown pattern is valid")
});

pub(crate) fn build_request(
    resolved: &ResolvedMode,
    mode: &ModeConfig,
    endpoint: &EndpointConfig,
    provider: &ProviderConfig,
    ctx: &RequestContext,
    prompt: &str,
) -> Result<HttpRequest> {
    let vars = template_vars(ctx, endpoint, prompt);
    let engine = TemplateEngine::new(&mode.value_mappings);
    let template_ctx = TemplateContext::new(vars, &ctx.attachments);

    let template = mode
        .payload_template
        .clone()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let rendered = engine.render(&template, &template_ctx)?;
    let mut payload = match rendered.body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        _ => {
            return Err(BatchboxError::config(
                "payload_template must render to a JSON object",
            ));
        }
    };

    if !endpoint.model_name.is_empty() && !payload.contains_key("model") {
        payload.insert("model".into(), Value::String(endpoint.model_name.clone()));
    }
    for key in AUTO_PARAMS {
        if payload.contains_key(key) {
            continue;
        }
        if let Some(value) = template_ctx.vars().get(key)
            && !is_blank(value)
        {
            payload.insert(key.to_string(), value.clone());
        }
    }
    for (key, value) in &endpoint.extra_params {
        payload.entry(key.clone()).or_insert_with(|| value.clone());
    }

    let path = resolved.path.replace("{{model}}", wire_model(ctx, endpoint));
    let url = format!("{}{}", provider.base_url(), path);

    let mut headers = HttpHeaderBuilder::new()
        .with_provider_auth(provider)?
        .with_custom_headers(&provider.headers)?;
    for (name, template) in &mode.headers {
        let value = engine
            .render_value(&Value::String(template.clone()), &template_ctx)?
            .map(|v| crate::template::engine::stringify(&v))
            .unwrap_or_default();
        if !value.is_empty() {
            headers = headers.with_header(name, &value)?;
        }
    }

    let body = if resolved.is_multipart() {
        multipart_body(
            &payload,
            &rendered.attachments,
            resolved.file_format,
            &resolved.file_field,
        )
    } else if resolved.content_type.contains("json") {
        headers = headers.with_content_type(&resolved.content_type)?;
        RequestBody::Json(Value::Object(payload))
    } else {
        headers = headers.with_content_type(&resolved.content_type)?;
        RequestBody::Form(text_fields(&payload, None))
    };

    Ok(HttpRequest {
        method: resolved.method.clone(),
        url,
        headers: headers.build(),
        body,
    })
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Parse a 2xx response body of the OpenAI-style dialect
pub(crate) fn parse_response(
    resolved: &ResolvedMode,
    category: Category,
    data: Value,
) -> NormalizedResult {
    if resolved.response_type == ResponseType::Async {
        return match get_string(&data, &resolved.polling.task_id_path) {
            Some(task_id) if !task_id.is_empty() => NormalizedResult {
                success: true,
                task_id: Some(task_id),
                raw_response: Some(data),
                ..Default::default()
            },
            _ => NormalizedResult::failure(
                format!(
                    "No task id at '{}' in async response",
                    resolved.polling.task_id_path
                ),
                Some(data),
            ),
        };
    }
    extract_result(&data, &resolved.response_path, category)
}

/// Extract media/text found at `response_path` into a result.
///
/// Text models never have their output sniffed for base64.
pub(crate) fn extract_result(data: &Value, response_path: &str, category: Category) -> NormalizedResult {
    let mut result = NormalizedResult::default();
    let mut texts = Vec::new();
    let sniff_base64 = category != Category::Text;
    for value in get_all(data, response_path) {
        collect_value(value, sniff_base64, &mut result, &mut texts);
    }
    if !texts.is_empty() {
        result.text_output = Some(texts.join("\n"));
    }
    result.success = result.has_media() || result.text_output.is_some();
    if !result.success {
        tracing::debug!(response_path, "nothing extracted from response");
    }
    result.raw_response = Some(data.clone());
    result
}

fn collect_value(
    value: &Value,
    sniff_base64: bool,
    result: &mut NormalizedResult,
    texts: &mut Vec<String>,
) {
    match value {
        Value::String(s) => collect_string(s, sniff_base64, result, texts),
        Value::Array(items) => items
            .iter()
            .for_each(|v| collect_value(v, sniff_base64, result, texts)),
        Value::Object(map) => {
            if let Some(url) = map.get("url").and_then(Value::as_str) {
                result.image_urls.push(url.to_string());
            } else if let Some(b64) = map.get("b64_json").and_then(Value::as_str) {
                match STANDARD.decode(b64.as_bytes()) {
                    Ok(bytes) => result.binary_outputs.push(BinaryOutput::new(bytes)),
                    Err(e) => tracing::warn!(error = %e, "failed to decode b64_json"),
                }
            }
        }
        _ => {}
    }
}

fn collect_string(
    s: &str,
    sniff_base64: bool,
    result: &mut NormalizedResult,
    texts: &mut Vec<String>,
) {
    let markdown: Vec<&str> = MARKDOWN_IMAGE
        .captures_iter(s)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
        .collect();
    if !markdown.is_empty() {
        result.image_urls.extend(
            markdown
                .into_iter()
                .filter(|u| is_http_url(u))
                .map(str::to_string),
        );
        return;
    }
    if is_http_url(s) {
        result.image_urls.push(s.to_string());
        return;
    }
    if sniff_base64
        && s.len() > BASE64_MIN_LEN
        && let Ok(bytes) = STANDARD.decode(strip_data_url(s).as_bytes())
    {
        result.binary_outputs.push(BinaryOutput::new(bytes));
        return;
    }
    if !s.is_empty() {
        texts.push(s.to_string());
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Drop a `data:<mime>;base64,` prefix if present
pub(crate) fn strip_data_url(s: &str) -> &str {
    match s.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or(rest),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileFormat;
    use crate::types::{Attachment, Mode};
    use serde_json::json;
    use std::sync::Arc;

    fn fixture(template: Option<Value>) -> (ModeConfig, EndpointConfig, ProviderConfig) {
        let provider = ProviderConfig::new("https://relay.example.com", "sk-test");
        let endpoint = EndpointConfig {
            provider: "relay".into(),
            model_name: "flux-dev".into(),
            extra_params: json!({"response_format": "url", "watermark": false})
                .as_object()
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        };
        let mode = ModeConfig {
            path: "/v1/images/generations".into(),
            payload_template: template,
            ..Default::default()
        };
        (mode, endpoint, provider)
    }

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new("flux", Mode::TextToImage, "a cat");
        ctx.parameters.insert("size".into(), json!("1024x1024"));
        ctx.parameters.insert("quality".into(), json!(""));
        ctx
    }

    #[test]
    fn adds_model_auto_params_and_extra_params() {
        let (mode, endpoint, provider) = fixture(None);
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        let mut ctx = ctx();
        ctx.seed = Some(11);
        let req = build_request(&resolved, &mode, &endpoint, &provider, &ctx, "a cat").unwrap();
        assert_eq!(req.url, "https://relay.example.com/v1/images/generations");
        assert_eq!(
            req.json_body().unwrap(),
            &json!({
                "model": "flux-dev",
                "prompt": "a cat",
                "size": "1024x1024",
                "seed": 11,
                "response_format": "url",
                "watermark": false
            })
        );
        assert_eq!(req.headers["authorization"], "Bearer sk-test");
    }

    #[test]
    fn model_in_path_uses_endpoint_model_then_requested_model() {
        let (mut mode, mut endpoint, provider) = fixture(None);
        mode.path = "/v1/models/{{model}}/generate".into();
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        let req = build_request(&resolved, &mode, &endpoint, &provider, &ctx(), "a cat").unwrap();
        assert_eq!(req.url, "https://relay.example.com/v1/models/flux-dev/generate");

        endpoint.model_name.clear();
        let req = build_request(&resolved, &mode, &endpoint, &provider, &ctx(), "a cat").unwrap();
        assert_eq!(req.url, "https://relay.example.com/v1/models/flux/generate");
    }

    #[test]
    fn template_values_are_not_overridden() {
        let (mode, endpoint, provider) = fixture(Some(json!({
            "model": "custom",
            "input": {"text": "{{prompt}}"},
            "response_format": "b64_json"
        })));
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        let req = build_request(&resolved, &mode, &endpoint, &provider, &ctx(), "a cat").unwrap();
        let body = req.json_body().unwrap();
        assert_eq!(body["model"], "custom");
        assert_eq!(body["input"]["text"], "a cat");
        assert_eq!(body["response_format"], "b64_json");
    }

    #[test]
    fn multipart_request_names_files() {
        let (mut mode, endpoint, provider) = fixture(None);
        mode.layered.content_type = Some("multipart/form-data".into());
        mode.layered.file_format = Some("indexed".into());
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        assert_eq!(resolved.file_format, FileFormat::Indexed);
        let mut ctx = ctx();
        ctx.attachments = Arc::from(vec![
            Attachment::new("a.png", "image/png", vec![1]),
            Attachment::new("b.png", "image/png", vec![2]),
        ]);
        let req = build_request(&resolved, &mode, &endpoint, &provider, &ctx, "a cat").unwrap();
        match req.body {
            RequestBody::Multipart { fields, files } => {
                assert!(fields.contains(&("prompt".to_string(), "a cat".to_string())));
                let names: Vec<&str> = files.iter().map(|f| f.field.as_str()).collect();
                assert_eq!(names, vec!["image[0]", "image[1]"]);
            }
            other => panic!("expected multipart, got {other:?}"),
        }
    }

    #[test]
    fn missing_placeholder_is_template_error() {
        let (mode, endpoint, provider) = fixture(Some(json!({"style": "{{style}}"})));
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        let err = build_request(&resolved, &mode, &endpoint, &provider, &ctx(), "a cat").unwrap_err();
        assert_eq!(err.code(), "template_error");
    }

    #[test]
    fn extracts_urls_markdown_and_base64() {
        let long_b64 = STANDARD.encode(vec![7u8; 120]);
        let data = json!({
            "data": [
                {"url": "https://cdn.example.com/1.png"},
                {"b64_json": "AQID"},
            ],
            "choices": [{"message": {"content": "done ![img](https://cdn.example.com/2.png \"t\")"}}],
            "raw": long_b64,
        });
        let r = extract_result(&data, "data[*]", Category::Image);
        assert_eq!(r.image_urls, vec!["https://cdn.example.com/1.png".to_string()]);
        assert_eq!(r.binary_outputs[0].data, vec![1, 2, 3]);

        let r = extract_result(&data, "choices[0].message.content", Category::Image);
        assert_eq!(r.image_urls, vec!["https://cdn.example.com/2.png".to_string()]);

        let r = extract_result(&data, "raw", Category::Image);
        assert_eq!(r.binary_outputs[0].data, vec![7u8; 120]);

        let r = extract_result(&data, "raw", Category::Text);
        assert!(r.binary_outputs.is_empty());
        assert!(r.text_output.is_some());
    }

    #[test]
    fn plain_text_becomes_text_output() {
        let data = json!({"choices": [{"message": {"content": "a haiku"}}]});
        let r = extract_result(&data, "choices[0].message.content", Category::Text);
        assert!(r.success);
        assert_eq!(r.text_output.as_deref(), Some("a haiku"));
        assert!(!r.has_media());
    }

    #[test]
    fn empty_path_is_failure() {
        let data = json!({"data": []});
        let r = extract_result(&data, "data[0].url", Category::Image);
        assert!(!r.success);
        assert!(!r.has_media());
    }

    #[test]
    fn async_submit_yields_task_id() {
        let (mut mode, endpoint, provider) = fixture(None);
        mode.layered.response_type = Some("async".into());
        mode.polling.task_id_path = Some("data.task_id".into());
        let resolved = ResolvedMode::resolve(&mode, &endpoint, &provider).unwrap();
        let r = parse_response(&resolved, Category::Image, json!({"data": {"task_id": "t-9"}}));
        assert!(r.success);
        assert_eq!(r.task_id.as_deref(), Some("t-9"));
    }

    #[test]
    fn strips_data_url_prefix() {
        assert_eq!(strip_data_url("data:image/png;base64,AQID"), "AQID");
        assert_eq!(strip_data_url("AQID"), "AQID");
    }
}
