use std::collections::BTreeMap;

use super::codec::{BinaryReader, BinaryWriter};
use crate::error::{ArcaError, Result};

const XATTR_HEADER: &str = "XAttrSetV";
const XATTR_VERSION: u32 = 2;

/// Extended attributes of one file, stored as a blob referenced by
/// `xattrs_blob_key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XAttrSet {
    xattrs: BTreeMap<String, Vec<u8>>,
}

impl XAttrSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Vec<u8>) {
        self.xattrs.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.xattrs.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.xattrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.xattrs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.xattrs.keys().map(String::as_str)
    }

    /// Total size of all attribute values.
    pub fn data_length(&self) -> u64 {
        self.xattrs.values().map(|v| v.len() as u64).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.header(XATTR_HEADER, XATTR_VERSION);
        w.u64(self.xattrs.len() as u64);
        for (name, value) in &self.xattrs {
            w.string(name);
            w.bytes(value);
        }
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(data);
        let version = r.header(XATTR_HEADER)?;
        if version != XATTR_VERSION {
            return Err(ArcaError::UnsupportedVersion(version));
        }
        let count = r.u64()?;
        let mut xattrs = BTreeMap::new();
        for _ in 0..count {
            let name = r.string()?;
            let value = r.bytes()?;
            xattrs.insert(name, value);
        }
        r.finish()?;
        Ok(Self { xattrs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_preserves_attributes() {
        let mut set = XAttrSet::new();
        set.insert("com.apple.quarantine", b"0081;5f".to_vec());
        set.insert("user.empty", Vec::new());
        let decoded = XAttrSet::from_bytes(&set.to_bytes()).unwrap();
        assert_eq!(decoded, set);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.data_length(), 7);
        assert_eq!(decoded.get("user.empty"), Some(&[][..]));
        assert_eq!(
            decoded.names().collect::<Vec<_>>(),
            vec!["com.apple.quarantine", "user.empty"]
        );
    }

    #[test]
    fn wrong_version_is_rejected() {
        assert!(matches!(
            XAttrSet::from_bytes(b"XAttrSetV001"),
            Err(ArcaError::UnsupportedVersion(1))
        ));
    }
}
