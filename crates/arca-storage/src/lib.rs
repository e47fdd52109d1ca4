pub mod local_backend;
pub mod retry;
pub mod s3_backend;

use serde::{Deserialize, Serialize};

use arca_types::error::{ArcaError, Result};

pub use local_backend::LocalBackend;
pub use s3_backend::S3Backend;

/// Retrieval speed requested when thawing an object from a cold tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestoreTier {
    Expedited,
    #[default]
    Standard,
    Bulk,
}

impl RestoreTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RestoreTier::Expedited => "Expedited",
            RestoreTier::Standard => "Standard",
            RestoreTier::Bulk => "Bulk",
        }
    }
}

/// Key/value blob store reachable by `/`-separated paths.
///
/// Every method blocks for the duration of the remote round trip.
/// Missing objects are reported as `Ok(None)` / `Ok(false)`, never as errors.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Delete `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// All keys under `prefix`, relative to the backend root.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read `length` bytes starting at `offset`.
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Byte size of `key`, or `None` when absent.
    fn size(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.get(key)?.map(|d| d.len() as u64))
    }

    /// Whether `key` is readable right now. Only cold tiers ever answer `false`.
    fn is_restored(&self, _key: &str) -> Result<bool> {
        Ok(true)
    }

    /// Ask a cold tier to make `key` readable for `days` days.
    ///
    /// Returns `true` when the object was already restored or a restore is
    /// already in progress.
    fn request_restore(&self, _key: &str, _days: u32, _tier: RestoreTier) -> Result<bool> {
        Err(ArcaError::UnsupportedBackend(
            "cold-storage restore is not supported by this backend".into(),
        ))
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

/// Bounded exponential backoff for transient remote failures.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// Everything needed to construct a backend.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub url: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub retry: RetryConfig,
}

/// A parsed repository URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoUrl {
    Local {
        path: String,
    },
    S3 {
        endpoint: String,
        bucket: String,
        root: String,
    },
}

/// Parse a repository URL.
///
/// * bare path or `file:///path` → local directory
/// * `s3://host[:port]/bucket[/root]` → S3 over HTTPS
/// * `s3+http://host[:port]/bucket[/root]` → S3 over plain HTTP (test setups)
pub fn parse_repo_url(url: &str) -> Result<RepoUrl> {
    if let Some(path) = url.strip_prefix("file://") {
        if path.is_empty() {
            return Err(ArcaError::Config("file:// URL has an empty path".into()));
        }
        return Ok(RepoUrl::Local {
            path: path.to_string(),
        });
    }

    let (scheme, rest) = if let Some(rest) = url.strip_prefix("s3://") {
        ("https", rest)
    } else if let Some(rest) = url.strip_prefix("s3+http://") {
        ("http", rest)
    } else if url.contains("://") {
        return Err(ArcaError::UnsupportedBackend(url.to_string()));
    } else {
        if url.is_empty() {
            return Err(ArcaError::Config("repository URL is empty".into()));
        }
        return Ok(RepoUrl::Local {
            path: url.to_string(),
        });
    };

    let mut parts = rest.splitn(3, '/');
    let host = parts.next().unwrap_or_default();
    let bucket = parts.next().unwrap_or_default();
    let root = parts.next().unwrap_or_default().trim_matches('/');
    if host.is_empty() || bucket.is_empty() {
        return Err(ArcaError::Config(format!(
            "S3 URL must look like s3://host/bucket[/root], got '{url}'"
        )));
    }
    Ok(RepoUrl::S3 {
        endpoint: format!("{scheme}://{host}"),
        bucket: bucket.to_string(),
        root: root.to_string(),
    })
}

/// Build a storage backend from a [`StorageConfig`].
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match parse_repo_url(&cfg.url)? {
        RepoUrl::Local { path } => Ok(Box::new(LocalBackend::new(&path)?)),
        RepoUrl::S3 {
            endpoint,
            bucket,
            root,
        } => {
            let access_key_id = cfg.access_key_id.as_deref().ok_or_else(|| {
                ArcaError::Config("S3 backend requires access_key_id".into())
            })?;
            let secret_access_key = cfg.secret_access_key.as_deref().ok_or_else(|| {
                ArcaError::Config("S3 backend requires secret_access_key".into())
            })?;
            let region = cfg.region.as_deref().unwrap_or("us-east-1");
            Ok(Box::new(S3Backend::new(
                &bucket,
                region,
                &root,
                &endpoint,
                access_key_id,
                secret_access_key,
                cfg.retry.clone(),
            )?))
        }
    }
}
