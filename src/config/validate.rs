//! Structural validation of a configuration document

use reqwest::Url;

use super::resolver::seconds_setting;
use super::schema::{ConfigDocument, PollingConfig};
use crate::error::{BatchboxError, Result};

/// List every structural problem of the document (empty when valid)
pub fn validate(document: &ConfigDocument) -> Vec<String> {
    let mut problems = Vec::new();

    if document.providers.is_empty() {
        problems.push("no providers configured".to_string());
    }
    if let Err(e) = seconds_setting("retry_delay", document.settings.retry_delay) {
        problems.push(format!("settings: {}", config_message(&e)));
    }

    for (name, provider) in &document.providers {
        if provider.base_url.is_empty() {
            problems.push(format!("provider '{name}': missing 'base_url'"));
        } else if !is_http_url(&provider.base_url) {
            problems.push(format!(
                "provider '{name}': invalid URL format '{}'",
                provider.base_url
            ));
        }
    }

    for (model_name, model) in &document.models {
        if model.api_endpoints.is_empty() {
            problems.push(format!("model '{model_name}': no api_endpoints configured"));
            continue;
        }
        for (idx, endpoint) in model.api_endpoints.iter().enumerate() {
            if endpoint.provider.is_empty() {
                problems.push(format!("model '{model_name}' endpoint {idx}: missing 'provider'"));
            } else if !document.providers.contains_key(&endpoint.provider) {
                problems.push(format!(
                    "model '{model_name}' endpoint {idx}: provider '{}' not found",
                    endpoint.provider
                ));
            }
            if let Some(problem) = endpoint.polling.as_ref().and_then(poll_interval_problem) {
                problems.push(format!("model '{model_name}' endpoint {idx}: {problem}"));
            }
            if endpoint.modes.is_empty() {
                problems.push(format!("model '{model_name}' endpoint {idx}: no modes configured"));
            }
            for (mode_name, mode) in &endpoint.modes {
                if mode.path.is_empty() {
                    problems.push(format!(
                        "model '{model_name}' endpoint {idx} mode '{mode_name}': missing path"
                    ));
                }
                if let Some(problem) = poll_interval_problem(&mode.polling) {
                    problems.push(format!(
                        "model '{model_name}' endpoint {idx} mode '{mode_name}': {problem}"
                    ));
                }
            }
        }
    }

    problems
}

/// Fail with a single `Config` error listing all problems
pub fn ensure_valid(document: &ConfigDocument) -> Result<()> {
    let problems = validate(document);
    if problems.is_empty() {
        Ok(())
    } else {
        Err(BatchboxError::config(format!(
            "configuration validation failed: {}",
            problems.join("; ")
        )))
    }
}

fn poll_interval_problem(polling: &PollingConfig) -> Option<String> {
    let secs = polling.poll_interval?;
    seconds_setting("poll_interval", secs)
        .err()
        .map(|e| config_message(&e))
}

fn config_message(err: &BatchboxError) -> String {
    match err {
        BatchboxError::Config { message } => message.clone(),
        other => other.to_string(),
    }
}

fn is_http_url(raw: &str) -> bool {
    Url::parse(raw)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_reports_missing_providers() {
        let problems = validate(&ConfigDocument::default());
        assert_eq!(problems, vec!["no providers configured".to_string()]);
    }

    #[test]
    fn reports_every_structural_problem() {
        let doc = ConfigDocument::from_yaml_str(
            r#"
providers:
  good: { base_url: "https://api.example.com", api_key: k }
  nourl: { api_key: k }
  badurl: { base_url: "ftp:/nowhere", api_key: k }
models:
  empty: { category: image }
  broken:
    api_endpoints:
      - provider: ghost
        modes:
          text2img: { payload_template: {} }
      - provider: good
"#,
        )
        .unwrap();
        let problems = validate(&doc);
        assert!(problems.iter().any(|p| p.contains("'nourl': missing 'base_url'")));
        assert!(problems.iter().any(|p| p.contains("'badurl': invalid URL")));
        assert!(problems.iter().any(|p| p.contains("'empty': no api_endpoints")));
        assert!(problems.iter().any(|p| p.contains("provider 'ghost' not found")));
        assert!(problems.iter().any(|p| p.contains("missing path")));
        assert!(problems.iter().any(|p| p.contains("endpoint 1: no modes")));
        assert!(ensure_valid(&doc).is_err());
    }

    #[test]
    fn reports_unusable_durations() {
        let doc = ConfigDocument::from_yaml_str(
            r#"
settings: { retry_delay: 1.0e30 }
providers:
  good: { base_url: "https://api.example.com", api_key: k }
models:
  m:
    api_endpoints:
      - provider: good
        polling: { poll_interval: -2 }
        modes:
          video: { path: /v1/video, poll_interval: 1.0e30 }
"#,
        )
        .unwrap();
        let problems = validate(&doc);
        assert_eq!(problems.len(), 3, "{problems:?}");
        assert!(problems[0].starts_with("settings: 'retry_delay'"));
        assert!(problems[1].starts_with("model 'm' endpoint 0: 'poll_interval'"));
        assert!(problems[2].starts_with("model 'm' endpoint 0 mode 'video': 'poll_interval'"));
    }

    #[test]
    fn valid_document_passes() {
        let doc = ConfigDocument::from_yaml_str(
            r#"
providers:
  good: { base_url: "http://localhost:8080", api_key: k }
models:
  m:
    api_endpoints:
      - provider: good
        modes:
          text2img: { endpoint: /v1/images/generations }
"#,
        )
        .unwrap();
        assert!(ensure_valid(&doc).is_ok());
    }
}
