//! Big-endian binary encoding shared by commits, trees, nodes, reflog
//! entries and xattr sets.
//!
//! Records start with an ASCII header such as `TreeV018`: a type name
//! followed by a three-digit version. Readers dispatch on that version.

use chrono::{DateTime, TimeZone, Utc};

use arca_types::{BlobKey, CompressionType, Sha1Digest, StorageType};

use crate::error::{ArcaError, Result};

/// How a `BlobKey` is laid out in a record of a given version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKeyLayout {
    /// sha1, stretch flag, `compressed` flag. Storage tier is implied
    /// Standard; a set `compressed` flag means gzip.
    Legacy,
    /// Adds storage tier and archive metadata. Still a `compressed` flag.
    Archived,
    /// Compression recorded as an explicit type code.
    Current,
}

#[derive(Default)]
pub struct BinaryWriter {
    buf: Vec<u8>,
}

impl BinaryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&mut self, name: &str, version: u32) {
        self.buf
            .extend_from_slice(format!("{name}{version:03}").as_bytes());
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.u64(v.len() as u64);
        self.buf.extend_from_slice(v);
    }

    pub fn string(&mut self, v: &str) {
        self.bytes(v.as_bytes());
    }

    pub fn opt_string(&mut self, v: Option<&str>) {
        self.bool(v.is_some());
        if let Some(s) = v {
            self.string(s);
        }
    }

    /// Milliseconds since the epoch.
    pub fn date(&mut self, v: &DateTime<Utc>) {
        self.i64(v.timestamp_millis());
    }

    pub fn opt_date(&mut self, v: Option<&DateTime<Utc>>) {
        self.bool(v.is_some());
        if let Some(d) = v {
            self.date(d);
        }
    }

    /// Always written in the current layout.
    pub fn blob_key(&mut self, key: Option<&BlobKey>) {
        self.bool(key.is_some());
        let Some(key) = key else { return };
        self.buf.extend_from_slice(key.sha1().as_bytes());
        self.bool(key.stretch_encryption_key());
        self.u32(key.storage_type().as_u32());
        self.opt_string(key.archive_id());
        self.u64(key.archive_size().unwrap_or(0));
        self.opt_date(key.archive_uploaded_date().as_ref());
        self.u32(key.compression_type().as_u32());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                ArcaError::InvalidFormat(format!(
                    "truncated {what} at offset {}: need {len} bytes, have {}",
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    /// Read a `<name>NNN` header and return the version.
    pub fn header(&mut self, name: &str) -> Result<u32> {
        let raw = self.take(name.len() + 3, "header")?;
        let (prefix, digits) = raw.split_at(name.len());
        if prefix != name.as_bytes() {
            return Err(ArcaError::InvalidFormat(format!(
                "expected {name} header, got {:?}",
                String::from_utf8_lossy(raw)
            )));
        }
        std::str::from_utf8(digits)
            .ok()
            .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| {
                ArcaError::InvalidFormat(format!(
                    "bad {name} version {:?}",
                    String::from_utf8_lossy(digits)
                ))
            })
    }

    pub fn bool(&mut self) -> Result<bool> {
        match self.take(1, "bool")?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ArcaError::InvalidFormat(format!("bad bool byte {other:#04x}"))),
        }
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array("u32")?))
    }

    pub fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array("i32")?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array("u64")?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array("i64")?))
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u64()?;
        let len = usize::try_from(len)
            .map_err(|_| ArcaError::InvalidFormat(format!("length {len} too large")))?;
        Ok(self.take(len, "bytes")?.to_vec())
    }

    pub fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|e| ArcaError::InvalidFormat(format!("invalid UTF-8 string: {e}")))
    }

    pub fn opt_string(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    pub fn date(&mut self) -> Result<DateTime<Utc>> {
        let millis = self.i64()?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| ArcaError::InvalidFormat(format!("date out of range: {millis}")))
    }

    pub fn opt_date(&mut self) -> Result<Option<DateTime<Utc>>> {
        if self.bool()? {
            Ok(Some(self.date()?))
        } else {
            Ok(None)
        }
    }

    pub fn blob_key(&mut self, layout: BlobKeyLayout) -> Result<Option<BlobKey>> {
        if !self.bool()? {
            return Ok(None);
        }
        let sha1 = Sha1Digest(self.array("sha1")?);
        let stretch = self.bool()?;
        let key = match layout {
            BlobKeyLayout::Legacy => {
                let compression = legacy_compression(self.bool()?);
                BlobKey::new(sha1, StorageType::Standard, stretch, compression)
            }
            BlobKeyLayout::Archived | BlobKeyLayout::Current => {
                let storage_type = StorageType::from_u32(self.u32()?)?;
                let archive_id = self.opt_string()?;
                let archive_size = self.u64()?;
                let archive_uploaded_date = self.opt_date()?;
                let compression = if layout == BlobKeyLayout::Current {
                    CompressionType::from_u32(self.u32()?)?
                } else {
                    legacy_compression(self.bool()?)
                };
                let key = BlobKey::new(sha1, storage_type, stretch, compression);
                match (archive_id, archive_uploaded_date) {
                    (Some(id), Some(date)) => key.with_archive(id, archive_size, date),
                    _ => key,
                }
            }
        };
        Ok(Some(key))
    }

    /// A present blob key, or `InvalidFormat` naming the field.
    pub fn required_blob_key(&mut self, layout: BlobKeyLayout, field: &str) -> Result<BlobKey> {
        self.blob_key(layout)?
            .ok_or_else(|| ArcaError::InvalidFormat(format!("missing {field}")))
    }

    /// Fail if bytes remain after the record.
    pub fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(ArcaError::InvalidFormat(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

fn legacy_compression(compressed: bool) -> CompressionType {
    if compressed {
        CompressionType::Gzip
    } else {
        CompressionType::None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write a key in one of the older layouts, as shipped records did.
    pub(crate) fn write_legacy_blob_key(w: &mut BinaryWriter, key: &BlobKey, layout: BlobKeyLayout) {
        w.bool(true);
        w.buf.extend_from_slice(key.sha1().as_bytes());
        w.bool(key.stretch_encryption_key());
        if layout != BlobKeyLayout::Legacy {
            w.u32(key.storage_type().as_u32());
            w.opt_string(key.archive_id());
            w.u64(key.archive_size().unwrap_or(0));
            w.opt_date(key.archive_uploaded_date().as_ref());
        }
        w.bool(key.compression_type() != CompressionType::None);
    }

    fn sample_key() -> BlobKey {
        BlobKey::new(
            Sha1Digest::compute(b"sample"),
            StorageType::Glacier,
            true,
            CompressionType::Zstd,
        )
    }

    #[test]
    fn header_roundtrip_and_validation() {
        let mut w = BinaryWriter::new();
        w.header("TreeV", 18);
        let bytes = w.into_bytes();
        assert_eq!(bytes, b"TreeV018");
        assert_eq!(BinaryReader::new(&bytes).header("TreeV").unwrap(), 18);
        assert!(BinaryReader::new(&bytes).header("CommitV").is_err());
        assert!(BinaryReader::new(b"TreeVx18").header("TreeV").is_err());
    }

    #[test]
    fn current_blob_key_keeps_every_field() {
        let date = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let key = sample_key().with_archive("vault-archive-1".into(), 4096, date);
        let mut w = BinaryWriter::new();
        w.blob_key(Some(&key));
        w.blob_key(None);
        let bytes = w.into_bytes();
        let mut r = BinaryReader::new(&bytes);
        assert_eq!(r.blob_key(BlobKeyLayout::Current).unwrap(), Some(key));
        assert_eq!(r.blob_key(BlobKeyLayout::Current).unwrap(), None);
        r.finish().unwrap();
    }

    #[test]
    fn legacy_layout_defaults_missing_fields() {
        let key = sample_key();
        let mut w = BinaryWriter::new();
        write_legacy_blob_key(&mut w, &key, BlobKeyLayout::Legacy);
        let bytes = w.into_bytes();
        let decoded = BinaryReader::new(&bytes)
            .blob_key(BlobKeyLayout::Legacy)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.storage_type(), StorageType::Standard);
        assert_eq!(decoded.compression_type(), CompressionType::Gzip);
        assert!(decoded.same_identity(&key));
    }

    #[test]
    fn archived_layout_keeps_tier_but_maps_compression_flag() {
        let uncompressed = BlobKey::new(
            Sha1Digest::compute(b"raw"),
            StorageType::DeepArchive,
            false,
            CompressionType::None,
        );
        let mut w = BinaryWriter::new();
        write_legacy_blob_key(&mut w, &uncompressed, BlobKeyLayout::Archived);
        let bytes = w.into_bytes();
        let decoded = BinaryReader::new(&bytes)
            .blob_key(BlobKeyLayout::Archived)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, uncompressed);
    }

    #[test]
    fn truncation_is_reported() {
        let mut w = BinaryWriter::new();
        w.string("hello");
        let bytes = w.into_bytes();
        let err = BinaryReader::new(&bytes[..bytes.len() - 1])
            .string()
            .unwrap_err();
        assert!(matches!(err, ArcaError::InvalidFormat(ref m) if m.contains("truncated")));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut r = BinaryReader::new(&[1, 0]);
        assert!(r.bool().unwrap());
        assert!(r.finish().is_err());
    }

    #[test]
    fn bad_bool_is_rejected() {
        assert!(BinaryReader::new(&[2]).bool().is_err());
    }
}
