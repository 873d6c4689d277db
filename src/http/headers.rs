//! Request header construction

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use secrecy::ExposeSecret;

use crate::config::{AuthScheme, ProviderConfig};
use crate::error::{BatchboxError, Result};

/// Gemini API key header
pub const GOOG_API_KEY: &str = "x-goog-api-key";

/// HTTP header builder for provider requests
#[derive(Debug, Default)]
pub struct HttpHeaderBuilder {
    headers: HeaderMap,
}

impl HttpHeaderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add Bearer token authorization
    pub fn with_bearer_auth(mut self, token: &str) -> Result<Self> {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| BatchboxError::config(format!("Invalid API key format: {e}")))?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(self)
    }

    /// Add the provider's configured authentication
    pub fn with_provider_auth(self, provider: &ProviderConfig) -> Result<Self> {
        let key = provider.api_key.expose_secret();
        match provider.auth {
            AuthScheme::Bearer => self.with_bearer_auth(key),
            // An explicit Authorization header wins over the key header
            AuthScheme::GoogApiKey if provider.headers.keys().any(|k| k.eq_ignore_ascii_case("authorization")) => {
                Ok(self)
            }
            AuthScheme::GoogApiKey => self.with_header(GOOG_API_KEY, key),
            AuthScheme::None => Ok(self),
        }
    }

    pub fn with_json_content_type(mut self) -> Self {
        self.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        self
    }

    pub fn with_content_type(self, content_type: &str) -> Result<Self> {
        self.with_header(CONTENT_TYPE.as_str(), content_type)
    }

    /// Add a custom header
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| BatchboxError::config(format!("Invalid header name '{name}': {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| BatchboxError::config(format!("Invalid header value for '{name}': {e}")))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Add several custom headers
    pub fn with_custom_headers<'a, I>(mut self, headers: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (name, value) in headers {
            self = self.with_header(name, value)?;
        }
        Ok(self)
    }

    pub fn build(self) -> HeaderMap {
        self.headers
    }
}
