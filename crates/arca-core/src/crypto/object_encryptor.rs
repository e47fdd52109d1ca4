//! Per-bucket object encryption.
//!
//! The encryption version and KDF parameters of a bucket live in a small
//! parameters blob on the target. It is created once, by whichever writer
//! gets there first, and every later open adopts what is stored.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use arca_crypto::key::{EncryptedMasterKey, KdfParams, MasterKey, PasswordKeys};
use arca_crypto::object::{self, DataIvAndKey};
use arca_crypto::NONCE_LEN;
use arca_types::{BlobKey, CompressionType, Sha1Digest, StorageType};

use crate::compress;
use crate::config::EncryptionConfig;
use crate::error::{ArcaError, Result};
use crate::repo::fark::Fark;

/// New objects are always written under the stretched key.
pub const NEW_OBJECTS_USE_STRETCHED_KEY: bool = true;

/// Stored form of a bucket's encryption parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionParams {
    pub version: u32,
    pub kdf: KdfParams,
    pub key_check: Vec<u8>,
    pub master_key: Option<EncryptedMasterKey>,
}

impl EncryptionParams {
    /// Fresh parameters for `password`. Version 2 generates and wraps a new
    /// master key.
    pub fn create(password: &str, version: u32, kdf: KdfParams) -> Result<Self> {
        let keys = PasswordKeys::derive(password, &kdf)?;
        let master_key = match version {
            1 => None,
            2 => Some(MasterKey::generate().to_encrypted(keys.key(true))?),
            other => return Err(ArcaError::UnsupportedVersion(other)),
        };
        Ok(Self {
            version,
            kdf,
            key_check: keys.key_check()?.to_vec(),
            master_key,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Turns plaintext into stored objects for one bucket and back.
pub struct ObjectEncryptor {
    version: u32,
    keys: PasswordKeys,
    master_key: Option<MasterKey>,
}

impl ObjectEncryptor {
    /// Load the bucket's parameters, creating them on first use.
    ///
    /// Creation is check-then-put followed by a re-read: if another writer
    /// stored parameters in between, theirs are adopted.
    pub fn open(
        fark: &Fark,
        bucket_uuid: &str,
        password: &str,
        config: &EncryptionConfig,
    ) -> Result<Self> {
        if let Some(data) = fark.encryption_params(bucket_uuid)? {
            return Self::from_params(&EncryptionParams::from_bytes(&data)?, password);
        }

        let fresh =
            EncryptionParams::create(password, config.version, config.kdf.generate_params())?;
        if fark.put_encryption_params_if_absent(bucket_uuid, &fresh.to_bytes()?)? {
            info!(
                bucket = bucket_uuid,
                version = fresh.version,
                "created encryption parameters"
            );
        }
        let stored = fark.encryption_params(bucket_uuid)?.ok_or_else(|| {
            ArcaError::NotFound(format!("encryption parameters for bucket {bucket_uuid}"))
        })?;
        let params = EncryptionParams::from_bytes(&stored)?;
        if params != fresh {
            debug!(bucket = bucket_uuid, "adopting encryption parameters created concurrently");
        }
        Self::from_params(&params, password)
    }

    /// Derive keys for `password` and check them against `params`.
    /// A wrong password fails with [`ArcaError::DecryptionFailed`].
    pub fn from_params(params: &EncryptionParams, password: &str) -> Result<Self> {
        let keys = PasswordKeys::derive(password, &params.kdf)?;
        if keys.key_check()?.as_slice() != params.key_check.as_slice() {
            return Err(ArcaError::DecryptionFailed);
        }
        let master_key = match params.version {
            1 => None,
            2 => {
                let encrypted = params.master_key.as_ref().ok_or_else(|| {
                    ArcaError::InvalidFormat("v2 encryption parameters lack a master key".into())
                })?;
                Some(MasterKey::from_encrypted(encrypted, keys.key(true))?)
            }
            other => return Err(ArcaError::UnsupportedVersion(other)),
        };
        Ok(Self {
            version: params.version,
            keys,
            master_key,
        })
    }

    pub fn encryption_version(&self) -> u32 {
        self.version
    }

    /// Content hash used for addressing: SHA-1 of the uncompressed plaintext.
    pub fn sha1_for_data(data: &[u8]) -> Sha1Digest {
        Sha1Digest::compute(data)
    }

    /// The key `data` is stored under by this encryptor.
    pub fn blob_key_for_data(
        &self,
        data: &[u8],
        compression: CompressionType,
        storage_type: StorageType,
    ) -> BlobKey {
        BlobKey::new(
            Self::sha1_for_data(data),
            storage_type,
            NEW_OBJECTS_USE_STRETCHED_KEY,
            compression,
        )
    }

    /// Compress then encrypt in the bucket's negotiated format.
    pub fn encrypt(&self, data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
        match self.version {
            1 => self.encrypt_v1_data(data, NEW_OBJECTS_USE_STRETCHED_KEY, compression),
            _ => self.encrypt_v2_data(data, compression),
        }
    }

    pub fn encrypt_v1_data(
        &self,
        data: &[u8],
        stretch: bool,
        compression: CompressionType,
    ) -> Result<Vec<u8>> {
        let compressed = compress::compress(compression, data)?;
        object::encrypt_v1(self.keys.key(stretch), &compressed)
    }

    pub fn encrypt_v2_data(&self, data: &[u8], compression: CompressionType) -> Result<Vec<u8>> {
        let compressed = compress::compress(compression, data)?;
        object::encrypt_v2(&self.master_key()?.encryption_key, &compressed)
    }

    /// v2 encryption with explicit IVs and data key.
    pub fn v2_encrypted_object_from_data(
        &self,
        data: &[u8],
        compression: CompressionType,
        master_iv: &[u8; NONCE_LEN],
        data_iv_and_key: &DataIvAndKey,
    ) -> Result<Vec<u8>> {
        let compressed = compress::compress(compression, data)?;
        object::v2_encrypted_object_from_data(
            &self.master_key()?.encryption_key,
            &compressed,
            master_iv,
            data_iv_and_key,
        )
    }

    /// Parse the master IV and data key out of a v2 object header.
    pub fn master_iv_and_data_key_from_header(
        &self,
        encrypted: &[u8],
    ) -> Result<([u8; NONCE_LEN], DataIvAndKey)> {
        object::parse_v2_header(&self.master_key()?.encryption_key, encrypted)
    }

    /// Decrypt then decompress. The object's magic selects the format; for
    /// v1 objects the blob key's stretch flag selects the password key
    /// (stretched when no key is given).
    pub fn decrypt(&self, encrypted: &[u8], blob_key: Option<&BlobKey>) -> Result<Vec<u8>> {
        let compressed = match object::object_version(encrypted)? {
            1 => {
                let stretch = blob_key.map_or(NEW_OBJECTS_USE_STRETCHED_KEY, |k| {
                    k.stretch_encryption_key()
                });
                object::decrypt_v1(self.keys.key(stretch), encrypted)?
            }
            _ => object::decrypt_v2(&self.master_key()?.encryption_key, encrypted)?,
        };
        compress::decompress(&compressed)
    }

    fn master_key(&self) -> Result<&MasterKey> {
        self.master_key.as_ref().ok_or_else(|| {
            ArcaError::InvalidFormat(format!(
                "bucket uses v{} encryption and has no master key",
                self.version
            ))
        })
    }
}
