use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sha1_digest::Sha1Digest;

/// Identifies one immutable pack: the pack set it belongs to and the SHA-1
/// of the pack's own bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackId {
    pack_set_name: String,
    pack_sha1: Sha1Digest,
}

impl PackId {
    pub fn new(pack_set_name: impl Into<String>, pack_sha1: Sha1Digest) -> Self {
        Self {
            pack_set_name: pack_set_name.into(),
            pack_sha1,
        }
    }

    /// Compute a pack ID as SHA-1 of the entire pack contents.
    pub fn compute(pack_set_name: impl Into<String>, pack_bytes: &[u8]) -> Self {
        Self::new(pack_set_name, Sha1Digest::compute(pack_bytes))
    }

    pub fn pack_set_name(&self) -> &str {
        &self.pack_set_name
    }

    pub fn pack_sha1(&self) -> &Sha1Digest {
        &self.pack_sha1
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PackId({}/{})",
            self.pack_set_name,
            &self.pack_sha1.to_hex()[..12]
        )
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pack_set_name, self.pack_sha1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_content_addressed() {
        let a = PackId::compute("b-blobs", b"pack bytes");
        let b = PackId::compute("b-blobs", b"pack bytes");
        let c = PackId::compute("b-blobs", b"other bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn pack_set_name_is_part_of_identity() {
        let a = PackId::compute("b-blobs", b"same");
        let b = PackId::compute("b-trees", b"same");
        assert_ne!(a, b);
        assert_eq!(a.pack_sha1(), b.pack_sha1());
    }
}
