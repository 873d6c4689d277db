//! Batch orchestrator
//!
//! Fans one request into `batch_count` independent calls. Tasks are admitted
//! through a semaphore sized by [`ConcurrencyPolicy`], so a finished task
//! immediately frees a slot for the next queued one. Each task writes its
//! outcome into its own slot; failures never cancel siblings.

pub mod attachments;
pub mod concurrency;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{Category, ConfigSnapshot};
use crate::error::{BatchboxError, Result};
use crate::failover::{Dispatched, FailoverController};
use crate::types::{Attachment, BatchOutcome, Mode, RequestContext};

pub use attachments::{BlockingPool, decode_attachments};
pub use concurrency::ConcurrencyPolicy;

/// Progress callback, invoked once per finished task
pub trait BatchObserver: Send + Sync {
    fn on_item_complete(&self, index: usize, total: usize, outcome: &BatchOutcome);
}

/// One batch, fully resolved and ready to fan out
#[derive(Debug, Clone)]
pub struct BatchPlan {
    pub model: String,
    pub category: Category,
    pub mode: Mode,
    pub prompt: String,
    /// 0 leaves every task's seed unset
    pub base_seed: u64,
    pub batch_count: usize,
    pub parameters: Map<String, Value>,
    pub attachments: Arc<[Attachment]>,
    pub pin: Option<String>,
}

impl BatchPlan {
    /// `base_seed + index`, or unset when no base seed was given
    pub fn seed_for(&self, index: usize) -> Option<u64> {
        (self.base_seed > 0).then(|| self.base_seed.wrapping_add(index as u64))
    }

    fn context(&self, index: usize) -> RequestContext {
        RequestContext {
            model: self.model.clone(),
            category: self.category,
            mode: self.mode.clone(),
            prompt: self.prompt.clone(),
            seed: self.seed_for(index),
            batch_index: index,
            parameters: self.parameters.clone(),
            attachments: Arc::clone(&self.attachments),
        }
    }
}

fn outcome_of(index: usize, seed: Option<u64>, result: Result<Dispatched>) -> BatchOutcome {
    match result {
        Ok(dispatched) => {
            let attempts = dispatched.total_attempts();
            BatchOutcome {
                index,
                success: true,
                seed,
                binary_outputs: dispatched.result.binary_outputs,
                image_urls: dispatched.result.image_urls,
                text_output: dispatched.result.text_output,
                endpoint: Some(dispatched.endpoint),
                provider: Some(dispatched.provider),
                attempts,
                error: None,
            }
        }
        Err(error) => BatchOutcome::failed(index, seed, error),
    }
}

/// Order-stable outcome slots shared by the tasks of one batch
struct Slots(Mutex<Vec<Option<BatchOutcome>>>);

impl Slots {
    fn new(len: usize) -> Self {
        Self(Mutex::new(vec![None; len]))
    }

    fn put(&self, outcome: BatchOutcome) {
        let mut slots = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = outcome.index;
        if let Some(slot) = slots.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    /// Drain the slots; an empty slot means its task never reported
    fn take_outcomes(&self) -> Vec<BatchOutcome> {
        let slots = std::mem::take(&mut *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    BatchOutcome::failed(
                        index,
                        None,
                        BatchboxError::internal("batch task ended without an outcome"),
                    )
                })
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct BatchOrchestrator {
    controller: Arc<FailoverController>,
    policy: ConcurrencyPolicy,
    task_timeout: Option<Duration>,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl BatchOrchestrator {
    pub fn new(controller: Arc<FailoverController>) -> Self {
        Self {
            controller,
            policy: ConcurrencyPolicy::default(),
            task_timeout: None,
            observer: None,
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Abort any single task whose call outlives `timeout`
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run every task of `plan`; outcomes are indexed by batch position
    pub async fn run(&self, snapshot: Arc<ConfigSnapshot>, plan: BatchPlan) -> Vec<BatchOutcome> {
        let total = plan.batch_count;
        if total == 0 {
            return Vec::new();
        }
        let limit = self.policy.limit(&plan.mode, &plan.parameters, total);
        let batch_id = Uuid::new_v4();
        info!(
            %batch_id,
            model = %plan.model,
            mode = %plan.mode,
            batch_count = total,
            max_concurrent = limit,
            "starting batch"
        );

        let gate = Arc::new(Semaphore::new(limit));
        let slots = Arc::new(Slots::new(total));
        let plan = Arc::new(plan);
        let mut tasks = JoinSet::new();

        for index in 0..total {
            let gate = Arc::clone(&gate);
            let slots = Arc::clone(&slots);
            let plan = Arc::clone(&plan);
            let snapshot = Arc::clone(&snapshot);
            let controller = Arc::clone(&self.controller);
            let observer = self.observer.clone();
            let task_timeout = self.task_timeout;

            tasks.spawn(async move {
                let seed = plan.seed_for(index);
                let outcome = match gate.acquire_owned().await {
                    Ok(_permit) => {
                        let ctx = plan.context(index);
                        let call = controller.dispatch(&snapshot.document, &ctx, plan.pin.as_deref());
                        let result = match task_timeout {
                            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                                Err(BatchboxError::TaskTimeout {
                                    index,
                                    timeout_ms: limit.as_millis() as u64,
                                })
                            }),
                            None => call.await,
                        };
                        outcome_of(index, seed, result)
                    }
                    Err(_) => BatchOutcome::failed(
                        index,
                        seed,
                        BatchboxError::internal("admission gate closed"),
                    ),
                };
                debug!(%batch_id, index, success = outcome.success, "batch item finished");
                if let Some(observer) = &observer {
                    observer.on_item_complete(index, total, &outcome);
                }
                slots.put(outcome);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "batch task aborted");
            }
        }

        let outcomes = slots.take_outcomes();
        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(
            %batch_id,
            model = %plan.model,
            succeeded,
            failed = total - succeeded,
            "batch finished"
        );
        outcomes
    }

    /// Every outcome fails with the same error (e.g. undecodable attachments)
    pub fn fail_all(plan: &BatchPlan, error: &BatchboxError) -> Vec<BatchOutcome> {
        (0..plan.batch_count)
            .map(|index| BatchOutcome::failed(index, plan.seed_for(index), error.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(base_seed: u64) -> BatchPlan {
        BatchPlan {
            model: "m".into(),
            category: Category::Image,
            mode: Mode::TextToImage,
            prompt: "p".into(),
            base_seed,
            batch_count: 3,
            parameters: Map::new(),
            attachments: Arc::from(Vec::new()),
            pin: None,
        }
    }

    #[test]
    fn seeds_offset_by_index() {
        let p = plan(100);
        assert_eq!(p.seed_for(0), Some(100));
        assert_eq!(p.seed_for(2), Some(102));
        assert_eq!(plan(0).seed_for(1), None);
        assert_eq!(p.context(1).seed, Some(101));
        assert_eq!(p.context(1).batch_index, 1);
    }

    #[test]
    fn missing_slots_become_internal_errors() {
        let slots = Slots::new(2);
        slots.put(BatchOutcome::failed(1, None, BatchboxError::config("x")));
        let outcomes = slots.take_outcomes();
        assert_eq!(outcomes[0].error.as_ref().unwrap().code(), "internal_error");
        assert_eq!(outcomes[1].error.as_ref().unwrap().code(), "config_error");
    }

    #[test]
    fn fail_all_covers_every_index() {
        let outcomes = BatchOrchestrator::fail_all(&plan(5), &BatchboxError::config("bad"));
        assert_eq!(outcomes.len(), 3);
        assert_eq!(outcomes[2].seed, Some(7));
        assert!(outcomes.iter().all(|o| !o.success));
    }
}
