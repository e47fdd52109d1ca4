//! Encrypted object wire formats.
//!
//! v1: `"ARCV1" | iv (12) | AES-256-GCM(password key, iv, plaintext)`.
//! The IV is a keyed BLAKE2b of the plaintext, so one plaintext always
//! yields one ciphertext under a given key.
//!
//! v2: `"ARCV2" | master iv (12) | wrapped (60) | AES-256-GCM(data key, data iv, plaintext)`
//! where `wrapped` is the data IV and data key sealed under the bucket
//! master key with the master IV. Every object gets its own random data key.

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use arca_types::error::{ArcaError, Result};

use crate::aes_gcm::{random_nonce, Aes256GcmCipher};
use crate::{KEY_LEN, NONCE_LEN, TAG_LEN};

type KeyedBlake2b256 = Blake2bMac<U32>;

pub const V1_MAGIC: &[u8; 5] = b"ARCV1";
pub const V2_MAGIC: &[u8; 5] = b"ARCV2";
const MAGIC_LEN: usize = 5;

/// Magic + synthetic IV.
pub const V1_HEADER_LEN: usize = MAGIC_LEN + NONCE_LEN;
/// Data IV + data key, sealed.
pub const WRAPPED_KEY_LEN: usize = NONCE_LEN + KEY_LEN + TAG_LEN;
/// Magic + master IV + wrapped data key.
pub const V2_HEADER_LEN: usize = MAGIC_LEN + NONCE_LEN + WRAPPED_KEY_LEN;

/// Per-object data IV and symmetric key of a v2 object.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct DataIvAndKey {
    pub iv: [u8; NONCE_LEN],
    pub key: [u8; KEY_LEN],
}

impl DataIvAndKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut key);
        Self {
            iv: random_nonce(),
            key,
        }
    }

    fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(NONCE_LEN + KEY_LEN));
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.key);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != NONCE_LEN + KEY_LEN {
            return Err(ArcaError::DecryptionFailed);
        }
        let mut iv = [0u8; NONCE_LEN];
        let mut key = [0u8; KEY_LEN];
        iv.copy_from_slice(&bytes[..NONCE_LEN]);
        key.copy_from_slice(&bytes[NONCE_LEN..]);
        Ok(Self { iv, key })
    }
}

impl std::fmt::Debug for DataIvAndKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DataIvAndKey(..)")
    }
}

/// Format version of an encrypted object, read from its magic.
pub fn object_version(object: &[u8]) -> Result<u32> {
    if object.starts_with(V2_MAGIC) {
        Ok(2)
    } else if object.starts_with(V1_MAGIC) {
        Ok(1)
    } else {
        Err(ArcaError::DecryptionFailed)
    }
}

fn synthetic_iv(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<[u8; NONCE_LEN]> {
    let mut mac = <KeyedBlake2b256 as Mac>::new_from_slice(key)
        .map_err(|e| ArcaError::Other(format!("blake2b key: {e}")))?;
    Mac::update(&mut mac, V1_MAGIC);
    Mac::update(&mut mac, plaintext);
    let digest = mac.finalize().into_bytes();
    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&digest[..NONCE_LEN]);
    Ok(iv)
}

/// Encrypt a whole buffer in the v1 format.
pub fn encrypt_v1(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let iv = synthetic_iv(key, plaintext)?;
    let sealed = Aes256GcmCipher::new(key).seal(&iv, plaintext, V1_MAGIC)?;
    let mut out = Vec::with_capacity(V1_HEADER_LEN + sealed.len());
    out.extend_from_slice(V1_MAGIC);
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt_v1(key: &[u8; KEY_LEN], object: &[u8]) -> Result<Vec<u8>> {
    if object.len() < V1_HEADER_LEN + TAG_LEN || !object.starts_with(V1_MAGIC) {
        return Err(ArcaError::DecryptionFailed);
    }
    let mut iv = [0u8; NONCE_LEN];
    iv.copy_from_slice(&object[MAGIC_LEN..V1_HEADER_LEN]);
    Aes256GcmCipher::new(key).open(&iv, &object[V1_HEADER_LEN..], V1_MAGIC)
}

fn v2_body_aad(master_iv: &[u8; NONCE_LEN]) -> [u8; MAGIC_LEN + NONCE_LEN] {
    let mut aad = [0u8; MAGIC_LEN + NONCE_LEN];
    aad[..MAGIC_LEN].copy_from_slice(V2_MAGIC);
    aad[MAGIC_LEN..].copy_from_slice(master_iv);
    aad
}

/// Build a v2 object from explicit IVs and data key.
///
/// Deterministic for fixed inputs; [`encrypt_v2`] is the same with fresh
/// random values.
pub fn v2_encrypted_object_from_data(
    master_key: &[u8; KEY_LEN],
    plaintext: &[u8],
    master_iv: &[u8; NONCE_LEN],
    data_iv_and_key: &DataIvAndKey,
) -> Result<Vec<u8>> {
    let wrapped =
        Aes256GcmCipher::new(master_key).seal(master_iv, &data_iv_and_key.to_bytes(), V2_MAGIC)?;
    debug_assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);
    let body = Aes256GcmCipher::new(&data_iv_and_key.key).seal(
        &data_iv_and_key.iv,
        plaintext,
        &v2_body_aad(master_iv),
    )?;

    let mut out = Vec::with_capacity(V2_HEADER_LEN + body.len());
    out.extend_from_slice(V2_MAGIC);
    out.extend_from_slice(master_iv);
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn encrypt_v2(master_key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    v2_encrypted_object_from_data(
        master_key,
        plaintext,
        &random_nonce(),
        &DataIvAndKey::generate(),
    )
}

/// Parse the v2 header back into the master IV and the unwrapped data IV
/// and key. Exact inverse of the header written by
/// [`v2_encrypted_object_from_data`].
pub fn parse_v2_header(
    master_key: &[u8; KEY_LEN],
    object: &[u8],
) -> Result<([u8; NONCE_LEN], DataIvAndKey)> {
    if object.len() < V2_HEADER_LEN || !object.starts_with(V2_MAGIC) {
        return Err(ArcaError::DecryptionFailed);
    }
    let mut master_iv = [0u8; NONCE_LEN];
    master_iv.copy_from_slice(&object[MAGIC_LEN..MAGIC_LEN + NONCE_LEN]);
    let wrapped = &object[MAGIC_LEN + NONCE_LEN..V2_HEADER_LEN];
    let unwrapped =
        Zeroizing::new(Aes256GcmCipher::new(master_key).open(&master_iv, wrapped, V2_MAGIC)?);
    Ok((master_iv, DataIvAndKey::from_bytes(&unwrapped)?))
}

pub fn decrypt_v2(master_key: &[u8; KEY_LEN], object: &[u8]) -> Result<Vec<u8>> {
    let (master_iv, data) = parse_v2_header(master_key, object)?;
    let body = &object[V2_HEADER_LEN..];
    if body.len() < TAG_LEN {
        return Err(ArcaError::DecryptionFailed);
    }
    Aes256GcmCipher::new(&data.key).open(&data.iv, body, &v2_body_aad(&master_iv))
}
