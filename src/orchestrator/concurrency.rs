//! Adaptive concurrency limits

use serde_json::{Map, Value};

use crate::types::Mode;

/// Parameters inspected for the resolution heuristic, in order
const RESOLUTION_KEYS: [&str; 3] = ["resolution", "image_size", "size"];

/// Maximum in-flight tasks per batch, by mode and requested resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyPolicy {
    pub uhd_limit: usize,
    pub hd_limit: usize,
    pub default_limit: usize,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            uhd_limit: 3,
            hd_limit: 5,
            default_limit: 6,
        }
    }
}

impl ConcurrencyPolicy {
    /// Text-to-image runs the whole batch at once; image-to-image is bounded
    /// by how heavy the requested output is.
    pub fn limit(&self, mode: &Mode, parameters: &Map<String, Value>, batch_count: usize) -> usize {
        let limit = match mode {
            Mode::ImageToImage => {
                let resolution = RESOLUTION_KEYS
                    .iter()
                    .find_map(|key| parameters.get(*key).and_then(Value::as_str))
                    .unwrap_or_default()
                    .to_ascii_uppercase();
                if resolution.contains("4K") {
                    self.uhd_limit
                } else if resolution.contains("HD") {
                    self.hd_limit
                } else {
                    self.default_limit
                }
            }
            _ => batch_count,
        };
        limit.clamp(1, batch_count.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn text_to_image_runs_everything() {
        let p = ConcurrencyPolicy::default();
        assert_eq!(p.limit(&Mode::TextToImage, &params(json!({"resolution": "4K"})), 10), 10);
    }

    #[test]
    fn image_to_image_by_resolution() {
        let p = ConcurrencyPolicy::default();
        assert_eq!(p.limit(&Mode::ImageToImage, &params(json!({"resolution": "4k"})), 10), 3);
        assert_eq!(p.limit(&Mode::ImageToImage, &params(json!({"image_size": "HD"})), 10), 5);
        assert_eq!(p.limit(&Mode::ImageToImage, &params(json!({"size": "1024x1024"})), 10), 6);
        assert_eq!(p.limit(&Mode::ImageToImage, &params(json!({})), 2), 2);
    }

    #[test]
    fn never_zero() {
        let p = ConcurrencyPolicy::default();
        assert_eq!(p.limit(&Mode::TextToImage, &Map::new(), 0), 1);
    }
}
