//! Request and result types shared across the dispatch pipeline

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::config::Category;
use crate::error::BatchboxError;

/// Generation mode, keyed into an endpoint's `modes` table
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    TextToImage,
    ImageToImage,
    Other(String),
}

impl Mode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::TextToImage => "text2img",
            Self::ImageToImage => "img2img",
            Self::Other(name) => name,
        }
    }

    /// The other image mode, used when an endpoint lacks the requested one
    pub fn fallback(&self) -> Option<Mode> {
        match self {
            Self::TextToImage => Some(Self::ImageToImage),
            Self::ImageToImage => Some(Self::TextToImage),
            Self::Other(_) => None,
        }
    }
}

impl From<String> for Mode {
    fn from(value: String) -> Self {
        match value.as_str() {
            "text2img" => Self::TextToImage,
            "img2img" => Self::ImageToImage,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Mode {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded binary attachment, shared read-only by all batch items
#[derive(Clone)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    data: Arc<[u8]>,
    encoded: OnceCell<String>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

impl Attachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
            encoded: OnceCell::new(),
        }
    }

    /// Keep the original base64 text so it is never re-encoded
    pub(crate) fn with_encoded(mut self, encoded: String) -> Self {
        self.encoded = OnceCell::with_value(encoded);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Standard base64 of the bytes, computed at most once
    pub fn base64(&self) -> &str {
        self.encoded.get_or_init(|| STANDARD.encode(&self.data))
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

/// Inbound attachment reference
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttachmentSource {
    /// Base64 text, optionally with a `data:<mime>;base64,` prefix
    Base64 {
        data: String,
        #[serde(default)]
        file_name: Option<String>,
    },
    /// A file on local disk
    FileRef { path: PathBuf },
}

impl AttachmentSource {
    pub fn base64(data: impl Into<String>) -> Self {
        Self::Base64 {
            data: data.into(),
            file_name: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::FileRef { path: path.into() }
    }
}

/// Everything one in-flight call needs; each batch item owns its own copy
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub model: String,
    pub category: Category,
    pub mode: Mode,
    pub prompt: String,
    pub seed: Option<u64>,
    pub batch_index: usize,
    pub parameters: Map<String, Value>,
    pub attachments: Arc<[Attachment]>,
}

impl RequestContext {
    pub fn new(model: impl Into<String>, mode: Mode, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            category: Category::Image,
            mode,
            prompt: prompt.into(),
            seed: None,
            batch_index: 0,
            parameters: Map::new(),
            attachments: Arc::from(Vec::new()),
        }
    }
}

/// Generated binary payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BinaryOutput {
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
    pub mime_type: Option<String>,
    /// Set when the bytes were downloaded from a URL reference
    pub source_url: Option<String>,
}

impl BinaryOutput {
    pub fn new(data: Vec<u8>) -> Self {
        let mime_type = infer::get(&data).map(|t| t.mime_type().to_string());
        Self {
            data,
            mime_type,
            source_url: None,
        }
    }
}

fn serialize_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

/// The only result shape seen above the adapter boundary
#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizedResult {
    pub success: bool,
    pub binary_outputs: Vec<BinaryOutput>,
    /// URL references that were not (or could not be) downloaded
    pub image_urls: Vec<String>,
    pub text_output: Option<String>,
    pub raw_response: Option<Value>,
    pub error: Option<String>,
    pub task_id: Option<String>,
}

impl NormalizedResult {
    pub fn failure(message: impl Into<String>, raw_response: Option<Value>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            raw_response,
            ..Default::default()
        }
    }

    pub fn has_media(&self) -> bool {
        !self.binary_outputs.is_empty() || !self.image_urls.is_empty()
    }
}

/// Host-level generation request
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    pub model: String,
    /// Defaults to img2img when attachments are present, text2img otherwise
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub prompt: String,
    /// Base seed; 0 leaves the seed unset
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_batch_count")]
    pub batch_count: usize,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentSource>,
    /// Manual endpoint pin (display name or provider name)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Explicit re-trigger: skip the cache lookup
    #[serde(default)]
    pub force_regenerate: bool,
    /// Host-side identity (e.g. a node id) the cache gate keys the last result on
    #[serde(default)]
    pub cache_slot: Option<String>,
}

const fn default_batch_count() -> usize {
    1
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            batch_count: 1,
            ..Default::default()
        }
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_batch_count(mut self, batch_count: usize) -> Self {
        self.batch_count = batch_count;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_attachment(mut self, source: AttachmentSource) -> Self {
        self.attachments.push(source);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_cache_slot(mut self, slot: impl Into<String>) -> Self {
        self.cache_slot = Some(slot.into());
        self
    }

    pub fn force_regenerate(mut self) -> Self {
        self.force_regenerate = true;
        self
    }

    pub fn effective_mode(&self) -> Mode {
        match &self.mode {
            Some(mode) => mode.clone(),
            None if self.attachments.is_empty() => Mode::TextToImage,
            None => Mode::ImageToImage,
        }
    }
}

/// Per-item outcome of a batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub success: bool,
    pub seed: Option<u64>,
    pub binary_outputs: Vec<BinaryOutput>,
    pub image_urls: Vec<String>,
    pub text_output: Option<String>,
    pub endpoint: Option<String>,
    pub provider: Option<String>,
    pub attempts: u32,
    pub error: Option<BatchboxError>,
}

impl BatchOutcome {
    pub fn failed(index: usize, seed: Option<u64>, error: BatchboxError) -> Self {
        Self {
            index,
            success: false,
            seed,
            binary_outputs: Vec::new(),
            image_urls: Vec::new(),
            text_output: None,
            endpoint: error.endpoint().map(str::to_string),
            provider: error.provider().map(str::to_string),
            attempts: error.attempts().unwrap_or(0),
            error: Some(error),
        }
    }
}

/// Aggregate result of one generate call
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub outcomes: Vec<BatchOutcome>,
    pub fingerprint: String,
    /// True when served by the cache gate without dispatching
    pub cached: bool,
    pub config_version: u64,
}

impl BatchResult {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.success).count()
    }

    pub fn is_partial(&self) -> bool {
        let ok = self.success_count();
        ok > 0 && ok < self.outcomes.len()
    }

    pub fn all_failed(&self) -> bool {
        self.success_count() == 0
    }
}
