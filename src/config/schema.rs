//! Typed configuration schema
//!
//! Mirrors the configuration document: `providers`, `models` (each with
//! `api_endpoints` and per-endpoint `modes`), `model_order`, `settings` and
//! `node_settings`. Settings that may appear at several levels live in a
//! flattened [`LayeredSettings`] block so the resolver can walk the chain.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{BatchboxError, Result};

/// Settings that may be declared on a provider, an endpoint or a mode
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LayeredSettings {
    #[serde(default, alias = "default_file_format")]
    pub file_format: Option<String>,
    #[serde(default, alias = "default_file_field")]
    pub file_field: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub response_path: Option<String>,
    #[serde(default)]
    pub api_format: Option<String>,
    #[serde(default)]
    pub prompt_prefix: Option<String>,
    #[serde(default, alias = "http_method")]
    pub method: Option<String>,
    #[serde(default)]
    pub response_type: Option<String>,
}

/// How the API key is presented to the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// `x-goog-api-key: <key>`
    GoogApiKey,
    /// No authentication header
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "empty_secret", deserialize_with = "deserialize_secret")]
    pub api_key: SecretString,
    #[serde(default)]
    pub auth: AuthScheme,
    /// Static headers sent with every request to this provider
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(flatten)]
    pub layered: LayeredSettings,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            display_name: None,
            base_url: base_url.into(),
            api_key: SecretString::from(api_key.into()),
            auth: AuthScheme::default(),
            headers: BTreeMap::new(),
            layered: LayeredSettings::default(),
        }
    }

    /// Providers without a key are never dispatched to
    pub fn has_api_key(&self) -> bool {
        !self.api_key.expose_secret().trim().is_empty()
    }

    pub fn base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }
}

/// Model category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    #[default]
    Image,
    Text,
    Video,
    Audio,
}

impl Category {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Text => "text",
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Category,
    /// Declarative description of the node's dynamic inputs (opaque to the core)
    #[serde(default)]
    pub dynamic_inputs: Option<Value>,
    /// group -> parameter -> definition
    #[serde(default)]
    pub parameter_schema: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    pub api_endpoints: Vec<EndpointConfig>,
    /// Include the seed in this model's fingerprint
    #[serde(default)]
    pub seed_sensitive: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointConfig {
    pub provider: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: i64,
    /// Model identifier sent on the wire
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub modes: BTreeMap<String, ModeConfig>,
    #[serde(default)]
    pub extra_params: Map<String, Value>,
    #[serde(default)]
    pub polling: Option<PollingConfig>,
    #[serde(flatten)]
    pub layered: LayeredSettings,
}

impl EndpointConfig {
    /// Label used in logs, pins and failure trails
    pub fn label(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => &self.provider,
        }
    }
}

/// Async polling settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollingConfig {
    #[serde(default, alias = "poll_endpoint")]
    pub polling_endpoint: Option<String>,
    #[serde(default)]
    pub status_path: Option<String>,
    #[serde(default)]
    pub success_value: Option<String>,
    /// Seconds between polls
    #[serde(default)]
    pub poll_interval: Option<f64>,
    #[serde(default)]
    pub max_polls: Option<u32>,
    #[serde(default)]
    pub task_id_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModeConfig {
    /// Request path relative to the provider base URL
    #[serde(default, alias = "endpoint")]
    pub path: String,
    #[serde(default)]
    pub payload_template: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub value_mappings: BTreeMap<String, BTreeMap<String, Value>>,
    /// Gemini `generationConfig` seed values
    #[serde(default)]
    pub generation_config: Map<String, Value>,
    #[serde(flatten)]
    pub polling: PollingConfig,
    #[serde(flatten)]
    pub layered: LayeredSettings,
}

/// How endpoints are ordered when no pin is given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStrategy {
    #[default]
    Priority,
    RoundRobin,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Per-request HTTP timeout in seconds
    pub default_timeout: u64,
    /// Retries against one endpoint after the first attempt
    pub max_retries: u32,
    /// Initial backoff delay in seconds
    pub retry_delay: f64,
    pub retry_on: Vec<u16>,
    pub auto_failover: bool,
    pub log_level: String,
    pub auto_endpoint_mode: EndpointStrategy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout: 600,
            max_retries: 3,
            retry_delay: 1.0,
            retry_on: vec![429, 502, 503, 504],
            auto_failover: true,
            log_level: "INFO".to_string(),
            auto_endpoint_mode: EndpointStrategy::Priority,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// When false, the cache gate ignores parameter changes
    pub smart_cache_hash_check: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            smart_cache_hash_check: true,
        }
    }
}

/// A flattened parameter-schema entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterDescriptor {
    pub name: String,
    pub group: String,
    pub definition: Value,
}

/// Summary of a model for catalog listings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub name: String,
    pub display_name: String,
    pub description: String,
}

/// Replacement `providers` section loaded from a secrets file
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretsDocument {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// Root of the configuration document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    #[serde(default)]
    pub model_order: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub node_settings: NodeSettings,
}

impl ConfigDocument {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Load from disk; `.json` files are parsed as JSON, everything else as YAML
    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BatchboxError::config(format!("cannot read config {}: {e}", path.display()))
        })?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    /// Replace the providers section with the secrets document's, if it has one
    pub fn merge_secrets(&mut self, secrets: SecretsDocument) {
        if !secrets.providers.is_empty() {
            self.providers = secrets.providers;
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn model(&self, name: &str) -> Result<&ModelConfig> {
        self.models
            .get(name)
            .ok_or_else(|| BatchboxError::config(format!("unknown model '{name}'")))
    }

    /// Endpoints of a model, lowest priority value first (stable for ties)
    pub fn endpoints_by_priority(&self, model: &str) -> Result<Vec<&EndpointConfig>> {
        let mut endpoints: Vec<&EndpointConfig> = self.model(model)?.api_endpoints.iter().collect();
        endpoints.sort_by_key(|ep| ep.priority);
        Ok(endpoints)
    }

    /// Model names of a category: ordered ones first per `model_order`, the rest alphabetically
    pub fn models_in_category(&self, category: Category) -> Vec<&str> {
        let order = self.model_order.get(category.as_str());
        let rank = |name: &str| -> usize {
            order
                .and_then(|o| o.iter().position(|n| n == name))
                .unwrap_or(usize::MAX)
        };
        let mut names: Vec<&str> = self
            .models
            .iter()
            .filter(|(_, m)| m.category == category)
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
        names
    }

    pub fn model_summaries(&self, category: Category) -> Vec<ModelSummary> {
        self.models_in_category(category)
            .into_iter()
            .filter_map(|name| {
                let model = self.models.get(name)?;
                Some(ModelSummary {
                    name: name.to_string(),
                    display_name: model.display_name.clone().unwrap_or_else(|| name.to_string()),
                    description: model.description.clone().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Parameter schema as a flat list with group information
    pub fn parameter_schema_flat(&self, model: &str) -> Result<Vec<ParameterDescriptor>> {
        let schema = &self.model(model)?.parameter_schema;
        Ok(schema
            .iter()
            .flat_map(|(group, params)| {
                params.iter().map(move |(name, definition)| ParameterDescriptor {
                    name: name.clone(),
                    group: group.clone(),
                    definition: definition.clone(),
                })
            })
            .collect())
    }
}

const fn default_priority() -> i64 {
    999
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn deserialize_secret<'de, D>(deserializer: D) -> std::result::Result<SecretString, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(SecretString::from(raw.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"
providers:
  relay:
    base_url: https://relay.example.com/
    api_key: sk-relay
    default_file_format: indexed
  empty:
    base_url: https://empty.example.com
models:
  flux:
    category: image
    parameter_schema:
      basic:
        size: { type: select, default: "1024x1024" }
      advanced:
        steps: { type: int, default: 20 }
    api_endpoints:
      - provider: relay
        priority: 2
        model_name: flux-dev
        modes:
          text2img:
            endpoint: /v1/images/generations
      - provider: relay
        display_name: Relay Fast
        priority: 1
        modes:
          text2img:
            endpoint: /v1/fast
  banana:
    category: image
    api_endpoints: []
  chat:
    category: text
model_order:
  image: [flux]
settings:
  max_retries: 5
"#;

    #[test]
    fn parses_document_with_aliases_and_defaults() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let relay = doc.provider("relay").unwrap();
        assert_eq!(relay.base_url(), "https://relay.example.com");
        assert_eq!(relay.layered.file_format.as_deref(), Some("indexed"));
        assert!(relay.has_api_key());
        assert!(!doc.provider("empty").unwrap().has_api_key());
        assert_eq!(doc.settings.max_retries, 5);
        assert_eq!(doc.settings.retry_on, vec![429, 502, 503, 504]);
        assert!(doc.node_settings.smart_cache_hash_check);
        let flux = doc.model("flux").unwrap();
        assert_eq!(flux.api_endpoints[0].modes["text2img"].path, "/v1/images/generations");
    }

    #[test]
    fn unenforced_provider_keys_are_ignored() {
        let doc = ConfigDocument::from_yaml_str(
            r#"providers: {relay: {base_url: "https://relay.example.com", api_key: k, rate_limit: 60}}"#,
        )
        .unwrap();
        assert!(doc.provider("relay").unwrap().has_api_key());
    }

    #[test]
    fn endpoints_sorted_by_priority() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let labels: Vec<&str> = doc
            .endpoints_by_priority("flux")
            .unwrap()
            .iter()
            .map(|e| e.label())
            .collect();
        assert_eq!(labels, vec!["Relay Fast", "relay"]);
    }

    #[test]
    fn unknown_model_is_config_error() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let err = doc.model("missing").unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn category_listing_honours_model_order() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        assert_eq!(doc.models_in_category(Category::Image), vec!["flux", "banana"]);
        assert_eq!(doc.models_in_category(Category::Text), vec!["chat"]);
        assert_eq!(doc.model_summaries(Category::Text)[0].display_name, "chat");
    }

    #[test]
    fn flattens_parameter_schema() {
        let doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let flat = doc.parameter_schema_flat("flux").unwrap();
        assert_eq!(flat.len(), 2);
        let steps = flat.iter().find(|p| p.name == "steps").unwrap();
        assert_eq!(steps.group, "advanced");
        assert_eq!(steps.definition["default"], 20);
    }

    #[test]
    fn secrets_replace_providers() {
        let mut doc = ConfigDocument::from_yaml_str(DOC).unwrap();
        let secrets: SecretsDocument = serde_yaml::from_str(
            "providers:\n  other:\n    base_url: https://other.example.com\n    api_key: k\n",
        )
        .unwrap();
        doc.merge_secrets(secrets);
        assert!(doc.provider("relay").is_none());
        assert!(doc.provider("other").is_some());
    }
}
