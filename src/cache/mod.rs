//! Content-hash cache gate
//!
//! Results are keyed by [`fingerprint`]. With the parameter-change check on,
//! a lookup matches on the fingerprint alone. With it off, a request carrying
//! a `cache_slot` gets back whatever that slot produced last, so only an
//! explicit `force_regenerate` dispatches again.

pub mod fingerprint;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::BatchOutcome;

pub use fingerprint::{FingerprintInput, SEED_KEY, canonical_json, fingerprint};

/// One stored batch result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub outcomes: Vec<BatchOutcome>,
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(fingerprint: impl Into<String>, outcomes: Vec<BatchOutcome>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            outcomes,
            created_at: Utc::now(),
        }
    }
}

/// Storage behind the gate
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>>;

    /// The last entry stored for `slot`
    async fn get_by_slot(&self, slot: &str) -> Result<Option<CacheEntry>>;

    async fn put(&self, slot: Option<&str>, entry: CacheEntry) -> Result<()>;
}

/// Process-local store; unbounded unless built with a capacity
pub struct InMemoryResultCache {
    entries: TokioMutex<LruCache<String, CacheEntry>>,
    slots: TokioMutex<HashMap<String, String>>,
}

impl InMemoryResultCache {
    pub fn new() -> Self {
        Self {
            entries: TokioMutex::new(LruCache::unbounded()),
            slots: TokioMutex::new(HashMap::new()),
        }
    }

    /// Evict least recently used entries beyond `capacity`
    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: TokioMutex::new(LruCache::new(capacity)),
            slots: TokioMutex::new(HashMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for InMemoryResultCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for InMemoryResultCache {
    async fn get(&self, fingerprint: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().await.get(fingerprint).cloned())
    }

    async fn get_by_slot(&self, slot: &str) -> Result<Option<CacheEntry>> {
        let fingerprint = self.slots.lock().await.get(slot).cloned();
        match fingerprint {
            Some(fp) => self.get(&fp).await,
            None => Ok(None),
        }
    }

    async fn put(&self, slot: Option<&str>, entry: CacheEntry) -> Result<()> {
        if let Some(slot) = slot {
            self.slots
                .lock()
                .await
                .insert(slot.to_string(), entry.fingerprint.clone());
        }
        self.entries.lock().await.put(entry.fingerprint.clone(), entry);
        Ok(())
    }
}

/// How a request is matched against stored results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateQuery<'a> {
    pub fingerprint: &'a str,
    pub slot: Option<&'a str>,
    pub force_regenerate: bool,
    /// Off: a slot hit is served even if the parameters changed
    pub check_params: bool,
}

#[derive(Clone)]
pub struct CacheGate {
    store: Arc<dyn ResultCache>,
}

impl CacheGate {
    pub fn new(store: Arc<dyn ResultCache>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryResultCache::new()))
    }

    pub fn store(&self) -> &Arc<dyn ResultCache> {
        &self.store
    }

    /// A stored result for `query`, if dispatch can be skipped.
    ///
    /// Store failures count as misses.
    pub async fn lookup(&self, query: GateQuery<'_>) -> Option<CacheEntry> {
        if query.force_regenerate {
            debug!(fingerprint = query.fingerprint, "cache bypassed by re-trigger");
            return None;
        }
        let found = match (query.check_params, query.slot) {
            (false, Some(slot)) => self.store.get_by_slot(slot).await,
            _ => self.store.get(query.fingerprint).await,
        };
        match found {
            Ok(hit) => {
                debug!(
                    fingerprint = query.fingerprint,
                    hit = hit.is_some(),
                    "cache lookup"
                );
                hit
            }
            Err(e) => {
                warn!(error = %e, "cache lookup failed");
                None
            }
        }
    }

    /// Remember `outcomes` unless every item failed
    pub async fn remember(&self, slot: Option<&str>, fingerprint: &str, outcomes: &[BatchOutcome]) {
        if !outcomes.iter().any(|o| o.success) {
            return;
        }
        let entry = CacheEntry::new(fingerprint, outcomes.to_vec());
        if let Err(e) = self.store.put(slot, entry).await {
            warn!(error = %e, "cache store failed");
        }
    }
}
