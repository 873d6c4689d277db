//! Hot-reloadable configuration store
//!
//! Readers take an `Arc<ConfigSnapshot>` and keep it for the whole request, so
//! a reload never changes configuration under an in-flight call. Each reload
//! bumps a monotonic version; callers compare the version they read with
//! [`ConfigStore::version`] to detect staleness.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use super::schema::{ConfigDocument, SecretsDocument};
use super::validate::validate;
use crate::error::{BatchboxError, Result};

/// Minimum time between on-disk modification checks
pub const FILE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Age after which a file-backed snapshot is re-parsed even if unchanged
pub const SNAPSHOT_TTL: Duration = Duration::from_secs(300);

/// An immutable view of the configuration at one version
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub document: ConfigDocument,
    loaded_at: Instant,
}

impl ConfigSnapshot {
    fn new(version: u64, document: ConfigDocument) -> Self {
        Self {
            version,
            document,
            loaded_at: Instant::now(),
        }
    }

    fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.loaded_at.elapsed() > ttl,
            None => false,
        }
    }
}

enum Source {
    Static,
    Files {
        config: PathBuf,
        secrets: Option<PathBuf>,
    },
}

struct FileState {
    last_check: Instant,
    config_mtime: Option<SystemTime>,
    secrets_mtime: Option<SystemTime>,
}

pub struct ConfigStore {
    source: Source,
    current: RwLock<Arc<ConfigSnapshot>>,
    version: AtomicU64,
    files: Mutex<FileState>,
    check_interval: Duration,
    ttl: Option<Duration>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("version", &self.version())
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl ConfigStore {
    /// Store over an in-memory document; only [`replace`](Self::replace) changes it
    pub fn from_document(document: ConfigDocument) -> Self {
        Self::build(Source::Static, document, None, None)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(Self::from_document(ConfigDocument::from_yaml_str(text)?))
    }

    /// File-backed store. The optional secrets file replaces the `providers` section.
    pub fn open(config: impl Into<PathBuf>, secrets: Option<PathBuf>) -> Result<Self> {
        let config = config.into();
        let document = load_files(&config, secrets.as_deref())?;
        let config_mtime = mtime(&config);
        let secrets_mtime = secrets.as_deref().and_then(mtime);
        Ok(Self::build(
            Source::Files { config, secrets },
            document,
            config_mtime,
            secrets_mtime,
        ))
    }

    fn build(
        source: Source,
        document: ConfigDocument,
        config_mtime: Option<SystemTime>,
        secrets_mtime: Option<SystemTime>,
    ) -> Self {
        log_problems(&document);
        Self {
            source,
            current: RwLock::new(Arc::new(ConfigSnapshot::new(1, document))),
            version: AtomicU64::new(1),
            files: Mutex::new(FileState {
                last_check: Instant::now(),
                config_mtime,
                secrets_mtime,
            }),
            check_interval: FILE_CHECK_INTERVAL,
            ttl: Some(SNAPSHOT_TTL),
        }
    }

    /// Override the modification-check throttle
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Override the snapshot TTL (`None` disables time-based re-parsing)
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = ttl;
        self
    }

    /// Current version counter
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Whether a snapshot read at `version` has since been superseded
    pub fn is_stale(&self, version: u64) -> bool {
        version != self.version()
    }

    /// Current snapshot, refreshed from disk when the files changed or the TTL elapsed.
    ///
    /// Blocking: a due refresh stats, reads and parses the files. Async callers
    /// check [`refresh_due`](Self::refresh_due) and run this off the scheduler.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        if let Source::Files { config, secrets } = &self.source
            && self.should_refresh(config, secrets.as_deref())
            && let Err(err) = self.reload()
        {
            tracing::warn!(error = %err, "config reload failed; keeping previous snapshot");
        }
        self.current()
    }

    /// Current snapshot without touching the disk
    pub fn cached(&self) -> Arc<ConfigSnapshot> {
        self.current()
    }

    /// Whether the next [`snapshot`](Self::snapshot) call may do file I/O
    pub fn refresh_due(&self) -> bool {
        if matches!(self.source, Source::Static) {
            return false;
        }
        self.files
            .lock()
            .map(|state| state.last_check.elapsed() >= self.check_interval)
            .unwrap_or(false)
    }

    /// Re-read the backing files (or just re-version a static document)
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        match &self.source {
            Source::Static => {
                let document = self.current().document.clone();
                Ok(self.install(document))
            }
            Source::Files { config, secrets } => {
                let document = load_files(config, secrets.as_deref())?;
                if let Ok(mut state) = self.files.lock() {
                    state.config_mtime = mtime(config);
                    state.secrets_mtime = secrets.as_deref().and_then(mtime);
                    state.last_check = Instant::now();
                }
                log_problems(&document);
                Ok(self.install(document))
            }
        }
    }

    /// Swap in a new document programmatically
    pub fn replace(&self, document: ConfigDocument) -> Arc<ConfigSnapshot> {
        log_problems(&document);
        self.install(document)
    }

    fn current(&self) -> Arc<ConfigSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, document: ConfigDocument) -> Arc<ConfigSnapshot> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = Arc::new(ConfigSnapshot::new(version, document));
        *guard = snapshot.clone();
        tracing::info!(version, "configuration loaded");
        snapshot
    }

    fn should_refresh(&self, config: &Path, secrets: Option<&Path>) -> bool {
        let Ok(mut state) = self.files.lock() else {
            return false;
        };
        if state.last_check.elapsed() < self.check_interval {
            return false;
        }
        state.last_check = Instant::now();
        let changed = mtime(config) != state.config_mtime
            || secrets.and_then(mtime) != state.secrets_mtime;
        changed || self.current().is_expired(self.ttl)
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn load_files(config: &Path, secrets: Option<&Path>) -> Result<ConfigDocument> {
    let mut document = ConfigDocument::from_path(config)?;
    if let Some(path) = secrets.filter(|p| p.exists()) {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BatchboxError::config(format!("cannot read secrets {}: {e}", path.display()))
        })?;
        if !text.trim().is_empty() {
            let secrets: SecretsDocument = serde_yaml::from_str(&text)?;
            tracing::debug!(providers = secrets.providers.len(), "merging secrets file");
            document.merge_secrets(secrets);
        }
    }
    Ok(document)
}

fn log_problems(document: &ConfigDocument) {
    for problem in validate(document) {
        tracing::warn!(%problem, "configuration problem");
    }
}
