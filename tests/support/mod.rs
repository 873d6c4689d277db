//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use batchbox::prelude::*;

pub const PNG_BYTES: [u8; 12] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 13];
pub const JPEG_BYTES: [u8; 8] = [0xFF, 0xD8, 0xFF, 0xE0, 0, 16, b'J', b'F'];

/// Config store over a YAML document, `{uri}` replaced by the mock server address
pub fn store(yaml: &str, uri: &str) -> Arc<ConfigStore> {
    Arc::new(ConfigStore::from_yaml_str(&yaml.replace("{uri}", uri)).expect("fixture config parses"))
}

pub fn generator(store: Arc<ConfigStore>) -> Generator {
    Generator::builder(store).build().expect("generator builds")
}

pub fn data_url(mime: &str, bytes: &[u8]) -> AttachmentSource {
    AttachmentSource::base64(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

pub fn body_text(request: &wiremock::Request) -> String {
    String::from_utf8_lossy(&request.body).into_owned()
}
