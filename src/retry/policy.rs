//! Exponential backoff with jitter

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

use crate::config::{Settings, seconds_setting};
use crate::error::{BatchboxError, Result};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    /// Maximum jitter percentage (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Overrides [`BatchboxError::is_retryable`] when set
    pub retry_condition: Option<fn(&BatchboxError) -> bool>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            use_jitter: true,
            jitter_factor: 0.1,
            retry_condition: None,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `max_retries` retries after the first attempt, starting at
    /// `retry_delay` seconds
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let initial = seconds_setting("retry_delay", settings.retry_delay)?;
        Ok(Self::default()
            .with_max_attempts(settings.max_retries.saturating_add(1))
            .with_initial_delay(initial))
    }

    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub const fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub const fn with_jitter(mut self, use_jitter: bool) -> Self {
        self.use_jitter = use_jitter;
        self
    }

    pub const fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_retry_condition(mut self, condition: fn(&BatchboxError) -> bool) -> Self {
        self.retry_condition = Some(condition);
        self
    }

    pub fn should_retry(&self, error: &BatchboxError) -> bool {
        match self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retryable(),
        }
    }

    /// Delay after the given zero-based attempt
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let delay = Duration::from_millis(base_delay as u64).min(self.max_delay);

        if self.use_jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.as_millis() as f64 * self.jitter_factor;
        if jitter_range <= 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        let new_delay = delay.as_millis() as f64 + jitter;
        Duration::from_millis(new_delay.max(0.0) as u64)
    }
}

/// Drives an operation through a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_handler(operation, |_, _| true).await
    }

    /// Execute with a per-failure hook.
    ///
    /// `error_handler` sees every failed attempt (zero-based) and returns
    /// false to stop retrying.
    pub async fn execute_with_handler<F, Fut, T, H>(
        &self,
        mut operation: F,
        mut error_handler: H,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        H: FnMut(&BatchboxError, u32) -> bool,
    {
        let mut last_error = None;
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 0..max_attempts {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(error) => {
                    if !error_handler(&error, attempt) || !self.policy.should_retry(&error) {
                        return Err(error);
                    }
                    if attempt + 1 == max_attempts {
                        last_error = Some(error);
                        break;
                    }
                    sleep(self.policy.calculate_delay(attempt)).await;
                    last_error = Some(error);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BatchboxError::internal("Retry executor failed without error")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> BatchboxError {
        BatchboxError::TransientProvider {
            provider: "p".into(),
            endpoint: "e".into(),
            status: Some(503),
            message: "Server error".into(),
            request_ids: Vec::new(),
            attempts: 1,
        }
    }

    fn fast(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(
            RetryPolicy::new()
                .with_max_attempts(max_attempts)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result = fast(3)
            .execute(|| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(transient())
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "success");
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_after_max_attempts() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = fast(2)
            .execute(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let result: Result<()> = fast(5)
            .execute(|| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(BatchboxError::PermanentProvider {
                        provider: "p".into(),
                        endpoint: "e".into(),
                        status: Some(400),
                        message: "bad request".into(),
                        request_ids: Vec::new(),
                        attempts: 1,
                    })
                }
            })
            .await;
        assert_eq!(result.unwrap_err().code(), "permanent_provider_error");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn handler_sees_each_failure_and_can_stop() {
        let mut seen = Vec::new();
        let result: Result<()> = fast(5)
            .execute_with_handler(
                || async { Err(transient()) },
                |_, attempt| {
                    seen.push(attempt);
                    attempt < 1
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(seen, vec![0, 1]);
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);
        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn from_settings_counts_first_attempt() {
        let settings = Settings {
            max_retries: 2,
            retry_delay: 0.5,
            ..Default::default()
        };
        let policy = RetryPolicy::from_settings(&settings).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
    }

    #[test]
    fn unusable_retry_delay_is_config_error() {
        for retry_delay in [1.0e30, -1.0, f64::NAN] {
            let settings = Settings {
                retry_delay,
                ..Default::default()
            };
            let err = RetryPolicy::from_settings(&settings).unwrap_err();
            assert_eq!(err.code(), "config_error");
            assert!(err.to_string().contains("retry_delay"));
        }
    }
}
