//! Async task polling

use serde_json::Value;

use super::openai::extract_result;
use crate::config::{Category, ProviderConfig, ResolvedPolling};
use crate::error::{BatchboxError, Result};
use crate::http::{HttpHeaderBuilder, HttpRequest, HttpTransport};
use crate::observability::DispatchTracer;
use crate::template::get_string;
use crate::types::NormalizedResult;

/// Statuses that end a task unsuccessfully
const FAILURE_STATUSES: [&str; 3] = ["FAILURE", "FAILED", "ERROR"];

/// Everything one poll loop needs
pub(crate) struct PollJob<'a> {
    pub transport: &'a dyn HttpTransport,
    pub provider_name: &'a str,
    pub provider: &'a ProviderConfig,
    pub endpoint: &'a str,
    pub polling: &'a ResolvedPolling,
    pub response_path: &'a str,
    pub category: Category,
    pub tracer: &'a DispatchTracer,
}

impl PollJob<'_> {
    fn url(&self, task_id: &str) -> String {
        let path = self.polling.polling_endpoint.replace("{task_id}", task_id);
        if path.starts_with("http://") || path.starts_with("https://") {
            path
        } else {
            format!("{}{}", self.provider.base_url(), path)
        }
    }

    /// Poll until the task reaches its success value, fails, or the poll
    /// budget runs out.
    ///
    /// Non-2xx responses, transport errors and unparsable bodies are treated
    /// as "not ready yet".
    pub(crate) async fn run(&self, task_id: &str) -> Result<NormalizedResult> {
        let url = self.url(task_id);
        let headers = HttpHeaderBuilder::new()
            .with_provider_auth(self.provider)?
            .with_custom_headers(&self.provider.headers)?
            .build();

        for poll in 1..=self.polling.max_polls {
            tokio::time::sleep(self.polling.interval).await;

            let response = match self
                .transport
                .send(HttpRequest::get(url.clone(), headers.clone()))
                .await
            {
                Ok(response) if response.is_success() => response,
                Ok(response) => {
                    self.tracer
                        .trace_poll(task_id, poll, Some(&format!("http {}", response.status)));
                    continue;
                }
                Err(e) => {
                    self.tracer.trace_poll(task_id, poll, Some(&e.to_string()));
                    continue;
                }
            };
            let Ok(data) = response.json() else {
                self.tracer.trace_poll(task_id, poll, None);
                continue;
            };

            let status = get_string(&data, &self.polling.status_path);
            self.tracer.trace_poll(task_id, poll, status.as_deref());
            match status {
                Some(s) if s == self.polling.success_value => {
                    return Ok(extract_result(&data, self.response_path, self.category));
                }
                Some(s) if FAILURE_STATUSES.contains(&s.to_ascii_uppercase().as_str()) => {
                    return Err(self.task_failed(task_id, &s, &data));
                }
                _ => {}
            }
        }

        Err(BatchboxError::PollTimeout {
            provider: self.provider_name.to_string(),
            endpoint: self.endpoint.to_string(),
            task_id: task_id.to_string(),
            polls: self.polling.max_polls,
            attempts: 1,
        })
    }

    fn task_failed(&self, task_id: &str, status: &str, data: &Value) -> BatchboxError {
        let reason = ["data.fail_reason", "data.error", "error.message", "message"]
            .iter()
            .find_map(|path| get_string(data, path))
            .map(|r| format!(": {r}"))
            .unwrap_or_default();
        BatchboxError::PermanentProvider {
            provider: self.provider_name.to_string(),
            endpoint: self.endpoint.to_string(),
            status: None,
            message: format!("Task failed ({task_id} status {status}){reason}"),
            request_ids: Vec::new(),
            attempts: 1,
        }
    }
}
