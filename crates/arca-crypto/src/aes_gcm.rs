use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use arca_types::error::{ArcaError, Result};

use crate::{KEY_LEN, NONCE_LEN, TAG_LEN};

/// AES-256-GCM with caller-supplied nonces.
///
/// The object formats decide how nonces are chosen (random, wrapped or
/// derived from content), so this type never picks one itself.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    /// Encrypt and return `ciphertext || tag`.
    pub fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| ArcaError::Other(format!("AES-GCM encrypt: {e}")))
    }

    /// Decrypt `ciphertext || tag`. Any authentication failure is reported
    /// as [`ArcaError::DecryptionFailed`].
    pub fn open(&self, nonce: &[u8; NONCE_LEN], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if data.len() < TAG_LEN {
            return Err(ArcaError::DecryptionFailed);
        }
        self.cipher
            .decrypt(Nonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| ArcaError::DecryptionFailed)
    }
}

/// Fresh random nonce from the thread RNG.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Aes256GcmCipher {
        Aes256GcmCipher::new(&[0x11; 32])
    }

    #[test]
    fn seal_open_roundtrip() {
        let nonce = random_nonce();
        let sealed = cipher().seal(&nonce, b"secret message", b"aad").unwrap();
        assert_eq!(sealed.len(), b"secret message".len() + TAG_LEN);
        assert_eq!(cipher().open(&nonce, &sealed, b"aad").unwrap(), b"secret message");
    }

    #[test]
    fn wrong_aad_fails() {
        let nonce = random_nonce();
        let sealed = cipher().seal(&nonce, b"secret", b"correct").unwrap();
        assert!(matches!(
            cipher().open(&nonce, &sealed, b"wrong"),
            Err(ArcaError::DecryptionFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let nonce = random_nonce();
        let sealed = cipher().seal(&nonce, b"secret", b"").unwrap();
        let other = Aes256GcmCipher::new(&[0x22; 32]);
        assert!(matches!(
            other.open(&nonce, &sealed, b""),
            Err(ArcaError::DecryptionFailed)
        ));
    }

    #[test]
    fn truncated_input_fails() {
        assert!(matches!(
            cipher().open(&[0u8; 12], &[0u8; 8], b""),
            Err(ArcaError::DecryptionFailed)
        ));
    }

    #[test]
    fn random_nonces_differ() {
        assert_ne!(random_nonce(), random_nonce());
    }
}
