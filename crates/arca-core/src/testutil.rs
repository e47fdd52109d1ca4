use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Once};

use arca_storage::{RestoreTier, StorageBackend};
use arca_types::error::{ArcaError, Result};

use crate::config::{ArcaConfig, KdfConfig, RetryConfig};
use crate::repo::Repo;

pub const TEST_COMPUTER: &str = "computer-1";
pub const TEST_BUCKET: &str = "bucket-1";
pub const TEST_PASSWORD: &str = "secret123";

static TEST_ENV_INIT: Once = Once::new();

pub fn init_test_environment() {
    TEST_ENV_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Config with the on-disk cache off, cheap Argon2id costs and
/// millisecond retry delays.
pub fn test_config() -> ArcaConfig {
    let mut config = ArcaConfig::for_url("memory://test");
    config.use_cache = false;
    config.repository.retry = RetryConfig {
        max_retries: 3,
        retry_delay_ms: 1,
        retry_max_delay_ms: 4,
    };
    config.encryption.kdf = KdfConfig {
        time_cost: 1,
        memory_cost: 8,
        parallelism: 1,
    };
    config
}

pub fn open_repo(backend: Arc<dyn StorageBackend>, config: &ArcaConfig, password: &str) -> Result<Repo> {
    init_test_environment();
    Repo::open_with_backend(backend, config, TEST_COMPUTER, TEST_BUCKET, password)
}

/// Open the test bucket on `backend` with the default test config.
pub fn test_repo(backend: &MemoryBackend) -> Repo {
    open_repo(Arc::new(backend.clone()), &test_config(), TEST_PASSWORD)
        .expect("failed to open test repo")
}

/// In-memory storage backend for testing. Clones share the same contents.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn keys_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.keys()
            .into_iter()
            .filter(|k| k.ends_with(suffix))
            .collect()
    }

    /// Overwrite a stored value behind the repository's back.
    pub fn overwrite(&self, key: &str, data: Vec<u8>) {
        self.data.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(key).cloned()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        Ok(map.get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut map = self.data.lock().unwrap();
        map.remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let map = self.data.lock().unwrap();
        Ok(map.contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.data.lock().unwrap();
        Ok(map
            .keys()
            .filter(|k| k.starts_with(prefix) && !k.ends_with('/'))
            .cloned()
            .collect())
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let map = self.data.lock().unwrap();
        match map.get(key) {
            Some(data) => {
                let start = offset as usize;
                let end = start.checked_add(length as usize).ok_or_else(|| {
                    ArcaError::Other(format!(
                        "short read on {key} at offset {offset}: offset + length overflows usize"
                    ))
                })?;
                if start > data.len() || end > data.len() {
                    return Err(ArcaError::Other(format!(
                        "short read on {key} at offset {offset}: expected {length} bytes, got {}",
                        data.len().saturating_sub(start)
                    )));
                }
                Ok(Some(data[start..end].to_vec()))
            }
            None => Ok(None),
        }
    }
}

/// Shared handle to inspect which keys were written via `put()`.
#[derive(Clone)]
pub struct PutLog(Arc<Mutex<Vec<String>>>);

impl PutLog {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count_with_suffix(&self, suffix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|k| k.ends_with(suffix))
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }

    fn record(&self, key: &str) {
        self.0.lock().unwrap().push(key.to_string());
    }
}

/// Storage wrapper that records which keys were passed to `put()`.
pub struct RecordingBackend {
    inner: MemoryBackend,
    log: PutLog,
}

impl RecordingBackend {
    pub fn new(inner: MemoryBackend) -> (Self, PutLog) {
        let log = PutLog::new();
        (
            Self {
                inner,
                log: log.clone(),
            },
            log,
        )
    }
}

impl StorageBackend for RecordingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.log.record(key);
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
}

#[derive(Default)]
struct ColdState {
    restored: HashSet<String>,
    pending: HashSet<String>,
    requests: Vec<(String, u32, RestoreTier)>,
}

/// Archival tier simulation: pack files and loose objects are unreadable
/// until a restore has been requested and completed with
/// [`ColdMemoryBackend::complete_restores`].
#[derive(Clone, Default)]
pub struct ColdMemoryBackend {
    inner: MemoryBackend,
    state: Arc<Mutex<ColdState>>,
}

impl ColdMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryBackend {
        &self.inner
    }

    fn is_cold(key: &str) -> bool {
        key.ends_with(".pack") || key.contains("/objects/")
    }

    fn readable(&self, key: &str) -> bool {
        !Self::is_cold(key) || self.state.lock().unwrap().restored.contains(key)
    }

    /// Make every pending restore readable.
    pub fn complete_restores(&self) {
        let mut state = self.state.lock().unwrap();
        let pending: Vec<String> = state.pending.drain().collect();
        state.restored.extend(pending);
    }

    /// `(key, days, tier)` of every restore request received.
    pub fn restore_requests(&self) -> Vec<(String, u32, RestoreTier)> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl StorageBackend for ColdMemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        if !self.readable(key) && self.inner.exists(key)? {
            return Err(ArcaError::ColdStorageUnavailable(key.to_string()));
        }
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.state.lock().unwrap().restored.remove(key);
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        if !self.readable(key) && self.inner.exists(key)? {
            return Err(ArcaError::ColdStorageUnavailable(key.to_string()));
        }
        self.inner.get_range(key, offset, length)
    }
    fn size(&self, key: &str) -> Result<Option<u64>> {
        self.inner.size(key)
    }
    fn is_restored(&self, key: &str) -> Result<bool> {
        Ok(self.readable(key))
    }
    fn request_restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.requests.push((key.to_string(), days, tier));
        if state.restored.contains(key) || state.pending.contains(key) {
            return Ok(true);
        }
        state.pending.insert(key.to_string());
        Ok(false)
    }
}

/// Fails every delete while armed, as if the process died right after the
/// preceding writes.
#[derive(Clone, Default)]
pub struct FailingDeleteBackend {
    inner: MemoryBackend,
    armed: Arc<AtomicBool>,
}

impl FailingDeleteBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl StorageBackend for FailingDeleteBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(ArcaError::Other(format!("simulated crash before deleting {key}")));
        }
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
}

/// Rejects every put while armed. Starts disarmed.
#[derive(Clone, Default)]
pub struct FailingPutBackend {
    inner: MemoryBackend,
    armed: Arc<AtomicBool>,
}

impl FailingPutBackend {
    pub fn new(inner: MemoryBackend) -> Self {
        Self {
            inner,
            armed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl StorageBackend for FailingPutBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            return Err(ArcaError::Other(format!("simulated upload failure for {key}")));
        }
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }
}

/// Backend whose first `failures` calls to `get_range` fail transiently.
pub struct FlakyBackend {
    inner: MemoryBackend,
    failures: Mutex<usize>,
}

impl FlakyBackend {
    pub fn new(inner: MemoryBackend, failures: usize) -> Self {
        Self {
            inner,
            failures: Mutex::new(failures),
        }
    }

    pub fn set_failures(&self, failures: usize) {
        *self.failures.lock().unwrap() = failures;
    }
}

impl StorageBackend for FlakyBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }
    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }
    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(ArcaError::Transient(format!("simulated 503 on {key}")));
        }
        drop(failures);
        self.inner.get_range(key, offset, length)
    }
}
