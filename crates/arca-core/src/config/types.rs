use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use arca_crypto::key::KdfParams;
use arca_storage::{RetryConfig, StorageConfig};
use arca_types::{CompressionType, StorageType};

use super::defaults::*;
use super::util::{default_cache_root, expand_tilde};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArcaConfig {
    pub repository: RepositoryConfig,
    #[serde(default)]
    pub pack: PackConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Root directory for the local pack/index cache.
    /// Default: platform cache dir + "arca" (e.g. ~/.cache/arca/).
    #[serde(default)]
    pub cache_dir: Option<String>,
    /// Disable the on-disk cache entirely. Remote state is authoritative
    /// either way.
    #[serde(default = "default_use_cache")]
    pub use_cache: bool,
    /// Compression applied to new blobs.
    #[serde(default = "default_compression")]
    pub compression: CompressionType,
}

impl ArcaConfig {
    /// Config for `url` with every other setting at its default.
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            repository: RepositoryConfig {
                url: url.into(),
                region: None,
                access_key_id: None,
                secret_access_key: None,
                storage_type: StorageType::default(),
                retry: RetryConfig::default(),
            },
            pack: PackConfig::default(),
            encryption: EncryptionConfig::default(),
            cache_dir: None,
            use_cache: default_use_cache(),
            compression: default_compression(),
        }
    }

    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            url: self.repository.url.clone(),
            region: self.repository.region.clone(),
            access_key_id: self.repository.access_key_id.clone(),
            secret_access_key: self.repository.secret_access_key.clone(),
            retry: self.repository.retry.clone(),
        }
    }

    /// The cache root to use, or `None` when caching is off or no platform
    /// cache directory exists.
    pub fn resolved_cache_dir(&self) -> Option<PathBuf> {
        if !self.use_cache {
            return None;
        }
        match &self.cache_dir {
            Some(dir) => Some(PathBuf::from(expand_tilde(dir))),
            None => default_cache_root(),
        }
    }

    pub(super) fn validate(&self) -> std::result::Result<(), String> {
        if self.repository.url.trim().is_empty() {
            return Err("repository.url must not be empty".into());
        }
        if self.pack.max_pack_size_mb == 0 {
            return Err("pack.max_pack_size_mb must be greater than 0".into());
        }
        if self.pack.max_pack_item_size_bytes == 0 {
            return Err("pack.max_pack_item_size_bytes must be greater than 0".into());
        }
        if !matches!(self.encryption.version, 1 | 2) {
            return Err(format!(
                "encryption.version must be 1 or 2, got {}",
                self.encryption.version
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// `/local/path`, `file:///path`, or `s3://endpoint/bucket/root`.
    pub url: String,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Tier recorded on new blob keys.
    #[serde(default)]
    pub storage_type: StorageType,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackConfig {
    /// A mutable pack is sealed once it grows past this size.
    #[serde(default = "default_max_pack_size_mb")]
    pub max_pack_size_mb: u32,
    /// Objects larger than this bypass packs and are stored as loose objects.
    #[serde(default = "default_max_pack_item_size_bytes")]
    pub max_pack_item_size_bytes: u64,
    /// Committed packs smaller than this are consolidation candidates.
    /// Default: half of `max_pack_size_mb`.
    #[serde(default)]
    pub consolidate_below_bytes: Option<u64>,
}

impl PackConfig {
    pub fn max_pack_size_bytes(&self) -> u64 {
        u64::from(self.max_pack_size_mb) * 1024 * 1024
    }

    pub fn consolidate_below_bytes(&self) -> u64 {
        self.consolidate_below_bytes
            .unwrap_or_else(|| self.max_pack_size_bytes() / 2)
    }
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            max_pack_size_mb: default_max_pack_size_mb(),
            max_pack_item_size_bytes: default_max_pack_item_size_bytes(),
            consolidate_below_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Object format for a new bucket. Existing buckets keep the version
    /// recorded in their parameters blob.
    #[serde(default = "default_encryption_version")]
    pub version: u32,
    #[serde(default)]
    pub kdf: KdfConfig,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            version: default_encryption_version(),
            kdf: KdfConfig::default(),
        }
    }
}

/// Argon2id costs used when a bucket's parameters are first created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfConfig {
    #[serde(default = "default_kdf_time_cost")]
    pub time_cost: u32,
    /// Memory cost in KiB.
    #[serde(default = "default_kdf_memory_cost")]
    pub memory_cost: u32,
    #[serde(default = "default_kdf_parallelism")]
    pub parallelism: u32,
}

impl KdfConfig {
    /// Fresh parameters with a random salt.
    pub fn generate_params(&self) -> KdfParams {
        KdfParams::generate(self.time_cost, self.memory_cost, self.parallelism)
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self {
            time_cost: default_kdf_time_cost(),
            memory_cost: default_kdf_memory_cost(),
            parallelism: default_kdf_parallelism(),
        }
    }
}
