//! Candidate endpoint selection

use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{ConfigDocument, EndpointConfig, EndpointStrategy, ModeConfig, ProviderConfig};
use crate::error::{BatchboxError, Result};
use crate::types::Mode;

/// One endpoint the controller may dispatch to, with the mode it will use
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub provider_name: &'a str,
    pub provider: &'a ProviderConfig,
    pub endpoint: &'a EndpointConfig,
    pub mode: &'a ModeConfig,
    /// Differs from the requested mode when the endpoint only offers the
    /// fallback mode
    pub mode_name: &'a str,
}

impl Candidate<'_> {
    pub fn label(&self) -> &str {
        self.endpoint.label()
    }
}

/// Ordered candidates for one call
#[derive(Debug, Clone)]
pub struct Selection<'a> {
    pub candidates: Vec<Candidate<'a>>,
    /// A manual pin disables rotation and failover
    pub pinned: bool,
}

/// Per-model rotation counters for [`EndpointStrategy::RoundRobin`]
#[derive(Debug, Default)]
pub struct RoundRobin {
    counters: Mutex<HashMap<String, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counter for `model`, then advance it
    fn next(&self, model: &str) -> usize {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let counter = counters.entry(model.to_string()).or_insert(0);
        let current = *counter;
        *counter = counter.wrapping_add(1);
        current
    }
}

/// Why an endpoint cannot serve a call, if it cannot
fn ineligibility(
    doc: &ConfigDocument,
    endpoint: &EndpointConfig,
    mode: &Mode,
) -> std::result::Result<(), String> {
    let Some(provider) = doc.provider(&endpoint.provider) else {
        return Err(format!("provider '{}' is not configured", endpoint.provider));
    };
    if !provider.has_api_key() {
        return Err(format!("provider '{}' has no api_key", endpoint.provider));
    }
    if mode_config(endpoint, mode).is_none() {
        return Err(format!("endpoint does not support mode '{mode}'"));
    }
    Ok(())
}

/// The endpoint's config for `mode`, or for its fallback mode
fn mode_config<'a>(endpoint: &'a EndpointConfig, mode: &Mode) -> Option<(&'a str, &'a ModeConfig)> {
    let lookup = |m: &Mode| {
        endpoint
            .modes
            .get_key_value(m.as_str())
            .map(|(name, cfg)| (name.as_str(), cfg))
    };
    lookup(mode).or_else(|| mode.fallback().as_ref().and_then(lookup))
}

fn candidate<'a>(doc: &'a ConfigDocument, endpoint: &'a EndpointConfig, mode: &Mode) -> Option<Candidate<'a>> {
    let provider = doc.provider(&endpoint.provider)?;
    let (mode_name, mode_cfg) = mode_config(endpoint, mode)?;
    Some(Candidate {
        provider_name: &endpoint.provider,
        provider,
        endpoint,
        mode: mode_cfg,
        mode_name,
    })
}

/// Rotate each run of equal-priority endpoints by `offset`
fn rotate_peers(candidates: &mut [Candidate<'_>], offset: usize) {
    let mut start = 0;
    while start < candidates.len() {
        let priority = candidates[start].endpoint.priority;
        let len = candidates[start..]
            .iter()
            .take_while(|c| c.endpoint.priority == priority)
            .count();
        candidates[start..start + len].rotate_left(offset % len);
        start += len;
    }
}

/// Choose the ordered candidates for `model` in `mode`.
///
/// A pin matching an endpoint's display name or provider name selects that
/// endpoint alone. An unknown pin is ignored with a warning.
pub fn select<'a>(
    doc: &'a ConfigDocument,
    model: &str,
    mode: &Mode,
    pin: Option<&str>,
    rotation: &RoundRobin,
) -> Result<Selection<'a>> {
    let endpoints = doc.endpoints_by_priority(model)?;

    if let Some(pin) = pin.filter(|p| !p.is_empty()) {
        let pinned = endpoints
            .iter()
            .find(|e| e.display_name.as_deref() == Some(pin))
            .or_else(|| endpoints.iter().find(|e| e.provider == pin));
        match pinned {
            Some(endpoint) => {
                ineligibility(doc, endpoint, mode).map_err(|reason| {
                    BatchboxError::config(format!("pinned endpoint '{pin}' is unusable: {reason}"))
                })?;
                let candidates = candidate(doc, endpoint, mode).into_iter().collect();
                return Ok(Selection {
                    candidates,
                    pinned: true,
                });
            }
            None => tracing::warn!(
                model,
                endpoint = pin,
                "pinned endpoint not found, using automatic selection"
            ),
        }
    }

    let mut candidates: Vec<Candidate<'a>> = Vec::with_capacity(endpoints.len());
    for endpoint in endpoints {
        match ineligibility(doc, endpoint, mode) {
            Ok(()) => candidates.extend(candidate(doc, endpoint, mode)),
            Err(reason) => tracing::debug!(
                model,
                endpoint = endpoint.label(),
                reason = %reason,
                "skipping endpoint"
            ),
        }
    }
    if candidates.is_empty() {
        return Err(BatchboxError::config(format!(
            "model '{model}' has no usable endpoint for mode '{mode}'"
        )));
    }

    if doc.settings.auto_endpoint_mode == EndpointStrategy::RoundRobin {
        rotate_peers(&mut candidates, rotation.next(model));
    }
    if !doc.settings.auto_failover {
        candidates.truncate(1);
    }
    Ok(Selection {
        candidates,
        pinned: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const DOC: &str = r#"
providers:
  alpha: {base_url: "https://alpha.example.com", api_key: "a"}
  beta: {base_url: "https://beta.example.com", api_key: "b"}
  gamma: {base_url: "https://gamma.example.com", api_key: "c"}
  nokey: {base_url: "https://nokey.example.com"}
models:
  flux:
    api_endpoints:
      - provider: gamma
        priority: 2
        modes: {text2img: {path: /g}}
      - provider: alpha
        display_name: Alpha Fast
        priority: 1
        modes: {text2img: {path: /a}}
      - provider: beta
        priority: 1
        modes: {img2img: {path: /b}}
      - provider: nokey
        priority: 0
        modes: {text2img: {path: /n}}
      - provider: missing
        priority: 0
        modes: {text2img: {path: /m}}
"#;

    fn doc() -> ConfigDocument {
        ConfigDocument::from_yaml_str(DOC).unwrap()
    }

    fn labels(selection: &Selection<'_>) -> Vec<String> {
        selection
            .candidates
            .iter()
            .map(|c| c.label().to_string())
            .collect()
    }

    #[test]
    fn orders_by_priority_and_skips_unusable() {
        let doc = doc();
        let s = select(&doc, "flux", &Mode::TextToImage, None, &RoundRobin::new()).unwrap();
        assert_eq!(labels(&s), vec!["Alpha Fast", "beta", "gamma"]);
        assert!(!s.pinned);
        // beta only offers img2img
        assert_eq!(s.candidates[1].mode_name, "img2img");
        assert_eq!(s.candidates[0].mode_name, "text2img");
    }

    #[test]
    fn pin_by_display_or_provider_name() {
        let doc = doc();
        let rr = RoundRobin::new();
        let s = select(&doc, "flux", &Mode::TextToImage, Some("Alpha Fast"), &rr).unwrap();
        assert!(s.pinned);
        assert_eq!(labels(&s), vec!["Alpha Fast"]);
        let s = select(&doc, "flux", &Mode::TextToImage, Some("gamma"), &rr).unwrap();
        assert_eq!(labels(&s), vec!["gamma"]);
    }

    #[traced_test]
    #[test]
    fn unknown_pin_falls_back_to_automatic() {
        let doc = doc();
        let s = select(&doc, "flux", &Mode::TextToImage, Some("nope"), &RoundRobin::new()).unwrap();
        assert!(!s.pinned);
        assert_eq!(s.candidates.len(), 3);
        assert!(logs_contain("pinned endpoint not found"));
    }

    #[test]
    fn pinned_but_unusable_is_config_error() {
        let doc = doc();
        let err = select(&doc, "flux", &Mode::TextToImage, Some("nokey"), &RoundRobin::new())
            .unwrap_err();
        assert_eq!(err.code(), "config_error");
    }

    #[test]
    fn round_robin_rotates_within_priority() {
        let mut doc = doc();
        doc.settings.auto_endpoint_mode = EndpointStrategy::RoundRobin;
        let rr = RoundRobin::new();
        let first = select(&doc, "flux", &Mode::TextToImage, None, &rr).unwrap();
        let second = select(&doc, "flux", &Mode::TextToImage, None, &rr).unwrap();
        assert_eq!(labels(&first), vec!["Alpha Fast", "beta", "gamma"]);
        assert_eq!(labels(&second), vec!["beta", "Alpha Fast", "gamma"]);
    }

    #[test]
    fn failover_disabled_keeps_first() {
        let mut doc = doc();
        doc.settings.auto_failover = false;
        let s = select(&doc, "flux", &Mode::TextToImage, None, &RoundRobin::new()).unwrap();
        assert_eq!(labels(&s), vec!["Alpha Fast"]);
    }

    #[test]
    fn unknown_model_is_config_error() {
        let doc = doc();
        let err = select(&doc, "nope", &Mode::TextToImage, None, &RoundRobin::new()).unwrap_err();
        assert_eq!(err.code(), "config_error");
    }
}
