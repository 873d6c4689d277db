//! The `generate` entry point
//!
//! [`Generator`] ties the pieces together: it pins a configuration snapshot,
//! computes the request fingerprint, consults the cache gate, decodes the
//! attachments once and hands the batch to the orchestrator. Every failure is
//! reported per item; `generate` itself never fails.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::adapter::{AdapterOptions, GenericAdapter};
use crate::cache::{CacheGate, FingerprintInput, GateQuery, ResultCache, fingerprint};
use crate::config::{ConfigSnapshot, ConfigStore};
use crate::error::{BatchboxError, Result};
use crate::failover::FailoverController;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::orchestrator::{
    BatchObserver, BatchOrchestrator, BatchPlan, BlockingPool, ConcurrencyPolicy, decode_attachments,
};
use crate::types::{BatchOutcome, BatchResult, GenerationRequest};

pub struct Generator {
    store: Arc<ConfigStore>,
    orchestrator: BatchOrchestrator,
    gate: CacheGate,
    pool: BlockingPool,
}

impl Generator {
    pub fn builder(store: Arc<ConfigStore>) -> GeneratorBuilder {
        GeneratorBuilder::new(store)
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn cache(&self) -> &CacheGate {
        &self.gate
    }

    /// Run one request end to end
    pub async fn generate(&self, request: GenerationRequest) -> BatchResult {
        let snapshot = self.pin_snapshot().await;
        let include_seed = snapshot
            .document
            .models
            .get(&request.model)
            .is_some_and(|m| m.seed_sensitive);
        let fingerprint = fingerprint(&FingerprintInput {
            model: &request.model,
            prompt: &request.prompt,
            batch_count: request.batch_count,
            seed: request.seed,
            include_seed,
            parameters: &request.parameters,
        });

        let query = GateQuery {
            fingerprint: &fingerprint,
            slot: request.cache_slot.as_deref(),
            force_regenerate: request.force_regenerate,
            check_params: snapshot.document.node_settings.smart_cache_hash_check,
        };
        if let Some(entry) = self.gate.lookup(query).await {
            info!(model = %request.model, fingerprint = %fingerprint, "serving cached result");
            return BatchResult {
                outcomes: entry.outcomes,
                fingerprint,
                cached: true,
                config_version: snapshot.version,
            };
        }

        let outcomes = self.dispatch(Arc::clone(&snapshot), &request).await;
        self.gate
            .remember(request.cache_slot.as_deref(), &fingerprint, &outcomes)
            .await;

        BatchResult {
            outcomes,
            fingerprint,
            cached: false,
            config_version: snapshot.version,
        }
    }

    /// The store's snapshot, with any due file refresh run on the blocking pool
    async fn pin_snapshot(&self) -> Arc<ConfigSnapshot> {
        if !self.store.refresh_due() {
            return self.store.cached();
        }
        let store = Arc::clone(&self.store);
        match self.pool.run(move || store.snapshot()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "config refresh did not run; using current snapshot");
                self.store.cached()
            }
        }
    }

    async fn dispatch(&self, snapshot: Arc<ConfigSnapshot>, request: &GenerationRequest) -> Vec<BatchOutcome> {
        let mut plan = BatchPlan {
            model: request.model.clone(),
            category: Default::default(),
            mode: request.effective_mode(),
            prompt: request.prompt.clone(),
            base_seed: request.seed,
            batch_count: request.batch_count,
            parameters: request.parameters.clone(),
            attachments: Arc::from(Vec::new()),
            pin: request.endpoint.clone().filter(|p| !p.is_empty()),
        };

        match snapshot.document.model(&request.model) {
            Ok(model) => plan.category = model.category,
            Err(e) => return reject(&plan, e),
        }

        match decode_attachments(&self.pool, &request.attachments).await {
            Ok(attachments) => plan.attachments = attachments,
            Err(e) => return reject(&plan, e),
        }

        self.orchestrator.run(snapshot, plan).await
    }
}

fn reject(plan: &BatchPlan, error: BatchboxError) -> Vec<BatchOutcome> {
    warn!(model = %plan.model, error = %error, "request rejected before dispatch");
    BatchOrchestrator::fail_all(plan, &error)
}

/// Builder for [`Generator`]
pub struct GeneratorBuilder {
    store: Arc<ConfigStore>,
    transport: Option<Arc<dyn HttpTransport>>,
    cache: Option<Arc<dyn ResultCache>>,
    observer: Option<Arc<dyn BatchObserver>>,
    concurrency: ConcurrencyPolicy,
    task_timeout: Option<Duration>,
    blocking_workers: usize,
    adapter_options: AdapterOptions,
}

impl GeneratorBuilder {
    fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            transport: None,
            cache: None,
            observer: None,
            concurrency: ConcurrencyPolicy::default(),
            task_timeout: None,
            blocking_workers: 4,
            adapter_options: AdapterOptions::default(),
        }
    }

    /// Replace the default `reqwest` transport
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn concurrency(mut self, policy: ConcurrencyPolicy) -> Self {
        self.concurrency = policy;
        self
    }

    /// Caller-level limit on each batch item
    pub fn task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn blocking_workers(mut self, workers: usize) -> Self {
        self.blocking_workers = workers;
        self
    }

    pub fn adapter_options(mut self, options: AdapterOptions) -> Self {
        self.adapter_options = options;
        self
    }

    pub fn build(self) -> Result<Generator> {
        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let timeout = self.store.cached().document.settings.default_timeout;
                Arc::new(ReqwestTransport::new(Duration::from_secs(timeout))?)
            }
        };
        let adapter = GenericAdapter::new(transport).with_options(self.adapter_options);
        let controller = Arc::new(FailoverController::new(adapter));

        let mut orchestrator = BatchOrchestrator::new(controller)
            .with_policy(self.concurrency)
            .with_task_timeout(self.task_timeout);
        if let Some(observer) = self.observer {
            orchestrator = orchestrator.with_observer(observer);
        }

        let gate = match self.cache {
            Some(cache) => CacheGate::new(cache),
            None => CacheGate::in_memory(),
        };

        Ok(Generator {
            store: self.store,
            orchestrator,
            gate,
            pool: BlockingPool::new(self.blocking_workers),
        })
    }
}
