//! Layered setting resolution
//!
//! A setting is looked up on the mode, then the endpoint, then the provider,
//! and finally falls back to a system default. Empty strings count as unset.
//! Resolution is total: a value missing everywhere yields the default.

use std::time::Duration;

use reqwest::Method;

use super::schema::{EndpointConfig, LayeredSettings, ModeConfig, PollingConfig, ProviderConfig};
use crate::error::{BatchboxError, Result};

/// Names of the settings that participate in layered resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    FileFormat,
    FileField,
    ContentType,
    ResponsePath,
    ApiFormat,
    PromptPrefix,
    Method,
    ResponseType,
}

impl Setting {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::FileFormat => "file_format",
            Self::FileField => "file_field",
            Self::ContentType => "content_type",
            Self::ResponsePath => "response_path",
            Self::ApiFormat => "api_format",
            Self::PromptPrefix => "prompt_prefix",
            Self::Method => "method",
            Self::ResponseType => "response_type",
        }
    }

    /// Hard-coded system default
    pub const fn system_default(&self) -> &'static str {
        match self {
            Self::FileFormat => "same_name",
            Self::FileField => "image",
            Self::ContentType => "application/json",
            Self::ResponsePath => "data[0].url",
            Self::ApiFormat => "openai",
            Self::PromptPrefix => "",
            Self::Method => "POST",
            Self::ResponseType => "sync",
        }
    }

    fn read<'a>(&self, layer: &'a LayeredSettings) -> Option<&'a str> {
        let value = match self {
            Self::FileFormat => &layer.file_format,
            Self::FileField => &layer.file_field,
            Self::ContentType => &layer.content_type,
            Self::ResponsePath => &layer.response_path,
            Self::ApiFormat => &layer.api_format,
            Self::PromptPrefix => &layer.prompt_prefix,
            Self::Method => &layer.method,
            Self::ResponseType => &layer.response_type,
        };
        value.as_deref().filter(|v| !v.is_empty())
    }
}

/// Anything that carries a [`LayeredSettings`] block
pub trait LayeredSource {
    fn layered(&self) -> &LayeredSettings;
}

impl LayeredSource for ModeConfig {
    fn layered(&self) -> &LayeredSettings {
        &self.layered
    }
}

impl LayeredSource for EndpointConfig {
    fn layered(&self) -> &LayeredSettings {
        &self.layered
    }
}

impl LayeredSource for ProviderConfig {
    fn layered(&self) -> &LayeredSettings {
        &self.layered
    }
}

/// Resolve one setting with Mode > Endpoint > Provider > `system_default` precedence.
pub fn resolve<'a>(
    setting: Setting,
    mode: Option<&'a dyn LayeredSource>,
    endpoint: Option<&'a dyn LayeredSource>,
    provider: Option<&'a dyn LayeredSource>,
    system_default: &'a str,
) -> &'a str {
    [mode, endpoint, provider]
        .into_iter()
        .flatten()
        .find_map(|layer| setting.read(layer.layered()))
        .unwrap_or(system_default)
}

/// Wire dialect of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    OpenAi,
    Gemini,
}

impl std::str::FromStr for ApiFormat {
    type Err = BatchboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "openai_compatible" | "generic" => Ok(Self::OpenAi),
            "gemini" | "google" => Ok(Self::Gemini),
            other => Err(BatchboxError::config(format!("unsupported api_format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    Sync,
    Async,
}

/// Multipart naming of attached files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// `image`, `image`, ...
    SameName,
    /// `image[0]`, `image[1]`, ...
    Indexed,
    /// `image[]`, `image[]`, ...
    Array,
    /// `image1`, `image2`, ...
    Numbered,
}

impl FileFormat {
    /// Unknown names fall back to `same_name`
    pub fn parse(s: &str) -> Self {
        match s {
            "indexed" => Self::Indexed,
            "array" => Self::Array,
            "numbered" => Self::Numbered,
            _ => Self::SameName,
        }
    }

    /// Field name of the `index`-th (0-based) file
    pub fn field_name(&self, field: &str, index: usize) -> String {
        match self {
            Self::SameName => field.to_string(),
            Self::Indexed => format!("{field}[{index}]"),
            Self::Array => format!("{field}[]"),
            Self::Numbered => format!("{field}{}", index + 1),
        }
    }
}

/// A seconds setting as a [`Duration`]. Negative, non-finite and
/// out-of-range values are configuration errors.
pub fn seconds_setting(name: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|e| {
        BatchboxError::config(format!("'{name}' of {secs} seconds is not a usable duration: {e}"))
    })
}

/// Fully resolved polling parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPolling {
    pub polling_endpoint: String,
    pub status_path: String,
    pub success_value: String,
    pub interval: Duration,
    pub max_polls: u32,
    pub task_id_path: String,
}

impl ResolvedPolling {
    const DEFAULT_ENDPOINT: &'static str = "/v1/tasks/{task_id}";
    const DEFAULT_STATUS_PATH: &'static str = "data.status";
    const DEFAULT_SUCCESS: &'static str = "SUCCESS";
    const DEFAULT_INTERVAL_SECS: f64 = 2.0;
    const DEFAULT_MAX_POLLS: u32 = 300;
    const DEFAULT_TASK_ID_PATH: &'static str = "task_id";

    fn resolve(mode: &PollingConfig, endpoint: Option<&PollingConfig>) -> Result<Self> {
        fn pick<'a>(
            mode: &'a Option<String>,
            endpoint: Option<&'a Option<String>>,
            default: &'a str,
        ) -> String {
            mode.as_deref()
                .filter(|v| !v.is_empty())
                .or_else(|| endpoint.and_then(|e| e.as_deref()).filter(|v| !v.is_empty()))
                .unwrap_or(default)
                .to_string()
        }
        let interval = mode
            .poll_interval
            .or_else(|| endpoint.and_then(|e| e.poll_interval))
            .unwrap_or(Self::DEFAULT_INTERVAL_SECS);
        Ok(Self {
            polling_endpoint: pick(
                &mode.polling_endpoint,
                endpoint.map(|e| &e.polling_endpoint),
                Self::DEFAULT_ENDPOINT,
            ),
            status_path: pick(
                &mode.status_path,
                endpoint.map(|e| &e.status_path),
                Self::DEFAULT_STATUS_PATH,
            ),
            success_value: pick(
                &mode.success_value,
                endpoint.map(|e| &e.success_value),
                Self::DEFAULT_SUCCESS,
            ),
            interval: seconds_setting("poll_interval", interval)?,
            max_polls: mode
                .max_polls
                .or_else(|| endpoint.and_then(|e| e.max_polls))
                .unwrap_or(Self::DEFAULT_MAX_POLLS),
            task_id_path: pick(
                &mode.task_id_path,
                endpoint.map(|e| &e.task_id_path),
                Self::DEFAULT_TASK_ID_PATH,
            ),
        })
    }
}

/// Every layered setting of one (mode, endpoint, provider) triple, typed
#[derive(Debug, Clone)]
pub struct ResolvedMode {
    pub path: String,
    pub method: Method,
    pub content_type: String,
    pub api_format: ApiFormat,
    pub response_type: ResponseType,
    pub response_path: String,
    pub file_format: FileFormat,
    pub file_field: String,
    pub prompt_prefix: String,
    pub polling: ResolvedPolling,
}

/// Result path used for async tasks when none is configured
pub const ASYNC_RESPONSE_PATH: &str = "data.data.data[*].url";

impl ResolvedMode {
    pub fn resolve(
        mode: &ModeConfig,
        endpoint: &EndpointConfig,
        provider: &ProviderConfig,
    ) -> Result<Self> {
        let get = |setting: Setting, default: &'static str| -> String {
            resolve(
                setting,
                Some(mode as &dyn LayeredSource),
                Some(endpoint as &dyn LayeredSource),
                Some(provider as &dyn LayeredSource),
                default,
            )
            .to_string()
        };

        let response_type = match get(Setting::ResponseType, Setting::ResponseType.system_default())
            .to_ascii_lowercase()
            .as_str()
        {
            "async" => ResponseType::Async,
            _ => ResponseType::Sync,
        };
        let response_path_default = match response_type {
            ResponseType::Async => ASYNC_RESPONSE_PATH,
            ResponseType::Sync => Setting::ResponsePath.system_default(),
        };
        let method_name = get(Setting::Method, Setting::Method.system_default()).to_ascii_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| BatchboxError::config(format!("invalid http method '{method_name}'")))?;

        Ok(Self {
            path: mode.path.clone(),
            method,
            content_type: get(Setting::ContentType, Setting::ContentType.system_default()),
            api_format: get(Setting::ApiFormat, Setting::ApiFormat.system_default()).parse()?,
            response_type,
            response_path: get(Setting::ResponsePath, response_path_default),
            file_format: FileFormat::parse(&get(
                Setting::FileFormat,
                Setting::FileFormat.system_default(),
            )),
            file_field: get(Setting::FileField, Setting::FileField.system_default()),
            prompt_prefix: get(Setting::PromptPrefix, Setting::PromptPrefix.system_default()),
            polling: ResolvedPolling::resolve(&mode.polling, endpoint.polling.as_ref())?,
        })
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type.starts_with("multipart/form-data")
    }
}
