//! Gemini `generateContent` dialect
//!
//! Request: `contents[0].parts` = text part followed by one inline-data part
//! per attachment, plus a `generationConfig`. Response: inline-data parts are
//! decoded into binary outputs, file-data parts become URL references.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::wire_model;
use crate::config::{EndpointConfig, ModeConfig, ProviderConfig, ResolvedMode};
use crate::error::{BatchboxError, Result};
use crate::http::{HttpHeaderBuilder, HttpRequest, RequestBody};
use crate::types::{BinaryOutput, NormalizedResult, RequestContext};

/// Default `maxOutputTokens` when the mode does not set one
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 4096;

/// `imageSize` values Gemini does not accept
const SKIPPED_IMAGE_SIZES: [&str; 4] = ["auto", "1k", "2k", "4k"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        rename = "inlineData",
        alias = "inline_data"
    )]
    pub inline_data: Option<Blob>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        rename = "fileData",
        alias = "file_data"
    )]
    pub file_data: Option<FileData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileData {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "mimeType",
        alias = "mime_type"
    )]
    pub mime_type: Option<String>,
    #[serde(rename = "fileUri", alias = "file_uri")]
    pub file_uri: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none", rename = "responseModalities")]
    pub response_modalities: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "maxOutputTokens")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "imageConfig")]
    pub image_config: Option<ImageConfig>,
    /// Any other configured generation settings, passed through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image generation configuration for Gemini image models
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none", rename = "aspectRatio")]
    pub aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "imageSize")]
    pub image_size: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default, rename = "finishReason")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    pub block_reason: Option<String>,
}

/// Build the typed generation config from the mode's seed values, endpoint
/// `extra_params` and request parameters
fn generation_config(mode: &ModeConfig, endpoint: &EndpointConfig, ctx: &RequestContext) -> Result<GenerationConfig> {
    let mut config: GenerationConfig =
        serde_json::from_value(Value::Object(mode.generation_config.clone())).map_err(|e| {
            BatchboxError::config(format!("invalid generation_config: {e}"))
        })?;

    if config.response_modalities.is_none() {
        config.response_modalities = endpoint.extra_params.get("responseModalities").cloned();
    }
    if config.seed.is_none() {
        config.seed = ctx.seed.filter(|s| *s > 0);
    }

    let param = |key: &str| {
        ctx.parameters
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let mut image_config = config.image_config.take().unwrap_or_default();
    if image_config.image_size.is_none() {
        image_config.image_size = param("image_size")
            .filter(|s| !SKIPPED_IMAGE_SIZES.contains(&s.to_ascii_lowercase().as_str()));
    }
    if image_config.aspect_ratio.is_none() {
        image_config.aspect_ratio = param("aspect_ratio").filter(|s| !s.eq_ignore_ascii_case("auto"));
    }
    if image_config.image_size.is_some() || image_config.aspect_ratio.is_some() {
        config.image_config = Some(image_config);
    }

    if config.max_output_tokens.is_none() {
        config.max_output_tokens = Some(DEFAULT_MAX_OUTPUT_TOKENS);
    }
    Ok(config)
}

pub(crate) fn build_request(
    resolved: &ResolvedMode,
    mode: &ModeConfig,
    endpoint: &EndpointConfig,
    provider: &ProviderConfig,
    ctx: &RequestContext,
    prompt: &str,
) -> Result<HttpRequest> {
    let path = resolved.path.replace("{{model}}", wire_model(ctx, endpoint));
    let url = format!("{}{}", provider.base_url(), path);

    let mut parts = vec![Part {
        text: Some(prompt.to_string()),
        ..Default::default()
    }];
    parts.extend(ctx.attachments.iter().map(|attachment| Part {
        inline_data: Some(Blob {
            mime_type: attachment.mime_type.clone(),
            data: attachment.base64().to_string(),
        }),
        ..Default::default()
    }));

    let body = GenerateContentRequest {
        contents: vec![Content { role: None, parts }],
        generation_config: generation_config(mode, endpoint, ctx)?,
    };

    let headers = HttpHeaderBuilder::new()
        .with_provider_auth(provider)?
        .with_json_content_type()
        .with_custom_headers(&provider.headers)?
        .build();

    Ok(HttpRequest {
        method: resolved.method.clone(),
        url,
        headers,
        body: RequestBody::Json(serde_json::to_value(&body)?),
    })
}

/// Parse a Gemini response body
pub(crate) fn parse_response(data: Value) -> NormalizedResult {
    let response: GenerateContentResponse = match serde_json::from_value(data.clone()) {
        Ok(r) => r,
        Err(e) => {
            return NormalizedResult::failure(format!("Malformed Gemini response: {e}"), Some(data));
        }
    };

    let Some(candidate) = response.candidates.first() else {
        let reason = response
            .prompt_feedback
            .and_then(|f| f.block_reason)
            .map(|r| format!(" (blocked: {r})"))
            .unwrap_or_default();
        return NormalizedResult::failure(format!("No candidates in Gemini response{reason}"), Some(data));
    };

    if candidate.finish_reason.as_deref() == Some("OTHER") {
        return NormalizedResult::failure(
            "Gemini could not generate an image for this prompt (try a more descriptive image prompt)",
            Some(data),
        );
    }

    let mut result = NormalizedResult::default();
    let mut texts = Vec::new();
    let parts = candidate.content.as_ref().map(|c| c.parts.as_slice()).unwrap_or_default();
    for part in parts {
        if let Some(blob) = &part.inline_data
            && !blob.data.is_empty()
        {
            match STANDARD.decode(blob.data.as_bytes()) {
                Ok(bytes) => {
                    let mut output = BinaryOutput::new(bytes);
                    if !blob.mime_type.is_empty() {
                        output.mime_type = Some(blob.mime_type.clone());
                    }
                    result.binary_outputs.push(output);
                }
                Err(e) => tracing::warn!(error = %e, "failed to decode Gemini inline data"),
            }
        }
        if let Some(file) = &part.file_data
            && !file.file_uri.is_empty()
        {
            result.image_urls.push(file.file_uri.clone());
        }
        if let Some(text) = &part.text
            && !text.is_empty()
        {
            texts.push(text.clone());
        }
    }

    if !texts.is_empty() {
        result.text_output = Some(texts.join("\n"));
    }
    result.success = result.has_media() || result.text_output.is_some();
    if !result.success {
        result.error = Some("No images found in Gemini response".to_string());
    }
    result.raw_response = Some(data);
    result
}
