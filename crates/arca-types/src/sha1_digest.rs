use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

use crate::error::{ArcaError, Result};

/// A 20-byte SHA-1 digest. Addresses objects by the hash of their plaintext
/// and packs by the hash of their own bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sha1Digest(pub [u8; 20]);

impl Sha1Digest {
    pub const LEN: usize = 20;

    pub fn compute(data: &[u8]) -> Self {
        let mut out = [0u8; 20];
        out.copy_from_slice(&Sha1::digest(data));
        Sha1Digest(out)
    }

    /// Hex-encode the digest (40 lowercase chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a digest from exactly 40 hex characters.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != 40 {
            return Err(ArcaError::InvalidBlobKey(format!(
                "expected 40 hex chars, got {}: '{hex_str}'",
                hex_str.len()
            )));
        }
        let bytes = hex::decode(hex_str)
            .map_err(|e| ArcaError::InvalidBlobKey(format!("invalid hex '{hex_str}': {e}")))?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Sha1Digest(arr))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 20] = bytes.try_into().map_err(|_| {
            ArcaError::InvalidFormat(format!("expected 20-byte SHA-1, got {}", bytes.len()))
        })?;
        Ok(Sha1Digest(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// First byte, used to pick the fan-out bucket in pack indexes.
    pub fn first_byte(&self) -> u8 {
        self.0[0]
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_known_vector() {
        let digest = Sha1Digest::compute(b"abc");
        assert_eq!(digest.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Sha1Digest::from_hex("abcd").is_err());
        assert!(Sha1Digest::from_hex(&"a".repeat(41)).is_err());
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        assert!(Sha1Digest::from_hex(&"z".repeat(40)).is_err());
    }

    #[test]
    fn hex_roundtrip() {
        let digest = Sha1Digest::compute(b"roundtrip");
        let parsed = Sha1Digest::from_hex(&digest.to_hex()).unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn ordering_follows_bytes() {
        let low = Sha1Digest([0x00; 20]);
        let high = Sha1Digest([0xFF; 20]);
        assert!(low < high);
    }
}
