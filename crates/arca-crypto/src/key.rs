use argon2::Argon2;
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use arca_types::error::{ArcaError, Result};

use crate::aes_gcm::{random_nonce, Aes256GcmCipher};
use crate::{KEY_LEN, NONCE_LEN};

/// Minimum salt length accepted by the KDF.
pub const MIN_SALT_LEN: usize = 8;

/// Domain separation for the wrapped master key.
const MASTER_KEY_AAD: &[u8] = b"arca:master-key:v2";

const KEY_CHECK_LABEL: &[u8] = b"arca:key-check";

/// Argon2id parameters plus the bucket salt they are applied with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl KdfParams {
    /// Parameters with a fresh random 32-byte salt.
    pub fn generate(time_cost: u32, memory_cost: u32, parallelism: u32) -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: "argon2id".to_string(),
            time_cost,
            memory_cost,
            parallelism,
            salt,
        }
    }

    /// Same costs, explicit salt.
    pub fn with_salt(&self, salt: &[u8]) -> Self {
        Self {
            salt: salt.to_vec(),
            ..self.clone()
        }
    }
}

/// The two password-derived keys of a bucket.
///
/// `key` is one Argon2id pass over the password; `stretched_key` feeds that
/// output through a second pass. Which one an object was encrypted with is
/// recorded on its `BlobKey`.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordKeys {
    key: [u8; KEY_LEN],
    stretched_key: [u8; KEY_LEN],
}

impl PasswordKeys {
    pub fn derive(password: &str, kdf: &KdfParams) -> Result<Self> {
        if password.is_empty() {
            return Err(ArcaError::KeyDerivation("password is empty".into()));
        }
        if kdf.algorithm != "argon2id" {
            return Err(ArcaError::KeyDerivation(format!(
                "unsupported KDF algorithm '{}'",
                kdf.algorithm
            )));
        }
        if kdf.salt.len() < MIN_SALT_LEN {
            return Err(ArcaError::KeyDerivation(format!(
                "salt must be at least {MIN_SALT_LEN} bytes, got {}",
                kdf.salt.len()
            )));
        }
        let key = argon2id(password.as_bytes(), kdf)?;
        let stretched_key = argon2id(key.as_ref(), kdf)?;
        Ok(Self {
            key: *key,
            stretched_key: *stretched_key,
        })
    }

    pub fn key(&self, stretched: bool) -> &[u8; KEY_LEN] {
        if stretched {
            &self.stretched_key
        } else {
            &self.key
        }
    }

    /// Keyed digest of a fixed label under the stretched key. Stored next to
    /// the KDF parameters so a wrong password is rejected at open time.
    pub fn key_check(&self) -> Result<[u8; 32]> {
        let mut mac = <Blake2bMac<U32> as Mac>::new_from_slice(&self.stretched_key)
            .map_err(|e| ArcaError::KeyDerivation(format!("blake2b key: {e}")))?;
        Mac::update(&mut mac, KEY_CHECK_LABEL);
        Ok(mac.finalize().into_bytes().into())
    }
}

fn argon2id(input: &[u8], kdf: &KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = argon2::Params::new(
        kdf.memory_cost,
        kdf.time_cost,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| ArcaError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; KEY_LEN]);
    argon2
        .hash_password_into(input, &kdf.salt, output.as_mut())
        .map_err(|e| ArcaError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}

/// Random per-bucket master key used to wrap v2 per-object data keys.
/// Never stored in plaintext; zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; KEY_LEN],
}

/// On-target form of the master key: sealed under the stretched password key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedMasterKey {
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

impl MasterKey {
    /// Generate a new random master key using OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; KEY_LEN];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        Self { encryption_key }
    }

    pub fn to_encrypted(&self, wrapping_key: &[u8; KEY_LEN]) -> Result<EncryptedMasterKey> {
        let nonce = random_nonce();
        let encrypted_payload =
            Aes256GcmCipher::new(wrapping_key).seal(&nonce, &self.encryption_key, MASTER_KEY_AAD)?;
        Ok(EncryptedMasterKey {
            nonce: nonce.to_vec(),
            encrypted_payload,
        })
    }

    /// Unwrap the master key. A wrong password surfaces here as
    /// [`ArcaError::DecryptionFailed`].
    pub fn from_encrypted(encrypted: &EncryptedMasterKey, wrapping_key: &[u8; KEY_LEN]) -> Result<Self> {
        let nonce: [u8; NONCE_LEN] = encrypted
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| ArcaError::DecryptionFailed)?;
        let plaintext = Zeroizing::new(Aes256GcmCipher::new(wrapping_key).open(
            &nonce,
            &encrypted.encrypted_payload,
            MASTER_KEY_AAD,
        )?);
        let encryption_key: [u8; KEY_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| ArcaError::DecryptionFailed)?;
        Ok(Self { encryption_key })
    }
}
