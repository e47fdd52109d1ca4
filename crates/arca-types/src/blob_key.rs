use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ArcaError, Result};
use crate::sha1_digest::Sha1Digest;

/// Storage tier an object was written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    #[default]
    Standard,
    Glacier,
    DeepArchive,
}

impl StorageType {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Standard),
            2 => Ok(Self::Glacier),
            3 => Ok(Self::DeepArchive),
            _ => Err(ArcaError::InvalidFormat(format!("unknown storage type: {v}"))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::Standard => 1,
            Self::Glacier => 2,
            Self::DeepArchive => 3,
        }
    }

    /// Objects on a cold tier need a restore request before they can be read.
    pub fn is_cold(self) -> bool {
        !matches!(self, Self::Standard)
    }
}

/// Compression applied to plaintext before encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None,
    Gzip,
    #[default]
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::None),
            1 => Ok(Self::Gzip),
            2 => Ok(Self::Lz4),
            3 => Ok(Self::Zstd),
            _ => Err(ArcaError::InvalidFormat(format!(
                "unknown compression type: {v}"
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Lz4 => 2,
            Self::Zstd => 3,
        }
    }
}

/// Identity of a stored object.
///
/// The derived `PartialEq`/`Hash` compare every field. Two keys naming the
/// same stored object may still differ in compression or archive metadata;
/// use [`BlobKey::same_identity`] for that weaker comparison.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    sha1: Sha1Digest,
    storage_type: StorageType,
    stretch_encryption_key: bool,
    compression_type: CompressionType,
    archive_id: Option<String>,
    archive_size: Option<u64>,
    archive_uploaded_date: Option<DateTime<Utc>>,
}

impl BlobKey {
    pub fn new(
        sha1: Sha1Digest,
        storage_type: StorageType,
        stretch_encryption_key: bool,
        compression_type: CompressionType,
    ) -> Self {
        Self {
            sha1,
            storage_type,
            stretch_encryption_key,
            compression_type,
            archive_id: None,
            archive_size: None,
            archive_uploaded_date: None,
        }
    }

    /// Build a key from a hex SHA-1, rejecting anything but 40 hex chars.
    pub fn from_hex(
        sha1_hex: &str,
        storage_type: StorageType,
        stretch_encryption_key: bool,
        compression_type: CompressionType,
    ) -> Result<Self> {
        let sha1 = Sha1Digest::from_hex(sha1_hex)?;
        Ok(Self::new(
            sha1,
            storage_type,
            stretch_encryption_key,
            compression_type,
        ))
    }

    /// Attach archive (vault) metadata for objects uploaded as standalone
    /// archives on a cold tier.
    pub fn with_archive(
        mut self,
        archive_id: String,
        archive_size: u64,
        archive_uploaded_date: DateTime<Utc>,
    ) -> Self {
        self.archive_id = Some(archive_id);
        self.archive_size = Some(archive_size);
        self.archive_uploaded_date = Some(archive_uploaded_date);
        self
    }

    pub fn sha1(&self) -> &Sha1Digest {
        &self.sha1
    }

    pub fn sha1_hex(&self) -> String {
        self.sha1.to_hex()
    }

    pub fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    pub fn stretch_encryption_key(&self) -> bool {
        self.stretch_encryption_key
    }

    pub fn compression_type(&self) -> CompressionType {
        self.compression_type
    }

    pub fn archive_id(&self) -> Option<&str> {
        self.archive_id.as_deref()
    }

    pub fn archive_size(&self) -> Option<u64> {
        self.archive_size
    }

    pub fn archive_uploaded_date(&self) -> Option<DateTime<Utc>> {
        self.archive_uploaded_date
    }

    /// Legacy identity: same SHA-1 and same key-stretch flag.
    ///
    /// This is deliberately weaker than `==`; keys that differ only in
    /// compression, storage tier or archive metadata still name the same
    /// object.
    pub fn same_identity(&self, other: &BlobKey) -> bool {
        self.sha1 == other.sha1 && self.stretch_encryption_key == other.stretch_encryption_key
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}",
            self.sha1,
            if self.stretch_encryption_key { "" } else { "(unstretched)" }
        )
    }
}
