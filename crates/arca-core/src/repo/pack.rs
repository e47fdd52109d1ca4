//! Pack archives.
//!
//! Layout: `"PACK" | version u32 | count u64 | records | sha1 trailer`,
//! where each record is `object sha1 (20) | length u64 | data`. All
//! integers are big-endian. The trailer is the SHA-1 of everything before
//! it; the pack's id is the SHA-1 of the whole file.

use std::collections::HashMap;

use sha1::{Digest, Sha1};

use arca_types::{PackId, Sha1Digest};

use super::pack_index::{self, PackIndexEntry};
use crate::error::{ArcaError, Result};

pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
/// Magic + version + object count.
pub const PACK_HEADER_SIZE: usize = 16;
/// Object sha1 + data length.
pub const RECORD_HEADER_SIZE: usize = Sha1Digest::LEN + 8;
pub const PACK_TRAILER_SIZE: usize = Sha1Digest::LEN;

/// A sealed pack ready for upload.
pub struct SealedPack {
    pub pack_id: PackId,
    pub pack_bytes: Vec<u8>,
    pub index_bytes: Vec<u8>,
    pub entries: Vec<PackIndexEntry>,
}

/// The mutable in-progress pack of a pack set.
///
/// Objects are kept in insertion order; adding a SHA-1 that is already
/// present is a no-op.
pub struct PackBuilder {
    pack_set_name: String,
    objects: Vec<(Sha1Digest, Vec<u8>)>,
    positions: HashMap<Sha1Digest, usize>,
    size: u64,
}

impl PackBuilder {
    pub fn new(pack_set_name: impl Into<String>) -> Self {
        Self {
            pack_set_name: pack_set_name.into(),
            objects: Vec::new(),
            positions: HashMap::new(),
            size: 0,
        }
    }

    pub fn pack_set_name(&self) -> &str {
        &self.pack_set_name
    }

    pub fn contains(&self, sha1: &Sha1Digest) -> bool {
        self.positions.contains_key(sha1)
    }

    pub fn data_for_sha1(&self, sha1: &Sha1Digest) -> Option<&[u8]> {
        self.positions
            .get(sha1)
            .map(|&i| self.objects[i].1.as_slice())
    }

    /// Returns false if the object was already present.
    pub fn add_data(&mut self, sha1: Sha1Digest, data: Vec<u8>) -> bool {
        if self.positions.contains_key(&sha1) {
            return false;
        }
        self.size += (RECORD_HEADER_SIZE + data.len()) as u64;
        self.positions.insert(sha1, self.objects.len());
        self.objects.push((sha1, data));
        true
    }

    /// Returns false if the object was not present.
    pub fn remove_data(&mut self, sha1: &Sha1Digest) -> bool {
        let Some(index) = self.positions.remove(sha1) else {
            return false;
        };
        let (_, data) = self.objects.remove(index);
        self.size -= (RECORD_HEADER_SIZE + data.len()) as u64;
        for position in self.positions.values_mut() {
            if *position > index {
                *position -= 1;
            }
        }
        true
    }

    /// Size the sealed pack would have.
    pub fn size(&self) -> u64 {
        (PACK_HEADER_SIZE + PACK_TRAILER_SIZE) as u64 + self.size
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn sha1s(&self) -> impl Iterator<Item = &Sha1Digest> {
        self.objects.iter().map(|(sha1, _)| sha1)
    }

    /// Serialize the pack and its index. The builder itself is left
    /// untouched so a failed upload loses nothing.
    pub fn seal(&self) -> Result<SealedPack> {
        if self.objects.is_empty() {
            return Err(ArcaError::Other("cannot seal an empty pack".into()));
        }
        let mut pack_bytes = Vec::with_capacity(self.size() as usize);
        pack_bytes.extend_from_slice(PACK_MAGIC);
        pack_bytes.extend_from_slice(&PACK_VERSION.to_be_bytes());
        pack_bytes.extend_from_slice(&(self.objects.len() as u64).to_be_bytes());

        let mut locations = Vec::with_capacity(self.objects.len());
        for (sha1, data) in &self.objects {
            pack_bytes.extend_from_slice(sha1.as_bytes());
            pack_bytes.extend_from_slice(&(data.len() as u64).to_be_bytes());
            locations.push((*sha1, pack_bytes.len() as u64, data.len() as u64));
            pack_bytes.extend_from_slice(data);
        }
        let trailer = Sha1::digest(&pack_bytes);
        pack_bytes.extend_from_slice(&trailer);

        let pack_id = PackId::compute(self.pack_set_name.clone(), &pack_bytes);
        let index_bytes = pack_index::write_index(&locations);
        let entries = locations
            .into_iter()
            .map(|(sha1, offset, length)| PackIndexEntry::new(pack_id.clone(), offset, length, sha1))
            .collect();
        Ok(SealedPack {
            pack_id,
            pack_bytes,
            index_bytes,
            entries,
        })
    }
}

/// Per-object records of a pack: `(sha1, data offset, data length)`.
///
/// Validates the header, every record bound, and the trailer.
pub fn scan_pack(pack_bytes: &[u8]) -> Result<Vec<(Sha1Digest, u64, u64)>> {
    if pack_bytes.len() < PACK_HEADER_SIZE + PACK_TRAILER_SIZE {
        return Err(ArcaError::InvalidFormat("pack too small".into()));
    }
    if &pack_bytes[..4] != PACK_MAGIC {
        return Err(ArcaError::InvalidFormat("invalid pack magic".into()));
    }
    let version = u32::from_be_bytes(be_array(&pack_bytes[4..8])?);
    if version != PACK_VERSION {
        return Err(ArcaError::UnsupportedVersion(version));
    }
    let count = u64::from_be_bytes(be_array(&pack_bytes[8..16])?);

    let body_end = pack_bytes.len() - PACK_TRAILER_SIZE;
    if Sha1::digest(&pack_bytes[..body_end]).as_slice() != &pack_bytes[body_end..] {
        return Err(ArcaError::InvalidFormat("pack checksum mismatch".into()));
    }

    let mut records = Vec::new();
    let mut pos = PACK_HEADER_SIZE;
    for _ in 0..count {
        if pos + RECORD_HEADER_SIZE > body_end {
            return Err(ArcaError::InvalidFormat("truncated pack record header".into()));
        }
        let sha1 = Sha1Digest::from_slice(&pack_bytes[pos..pos + Sha1Digest::LEN])?;
        let length = u64::from_be_bytes(be_array(
            &pack_bytes[pos + Sha1Digest::LEN..pos + RECORD_HEADER_SIZE],
        )?);
        let data_start = pos + RECORD_HEADER_SIZE;
        let data_end = usize::try_from(length)
            .ok()
            .and_then(|len| data_start.checked_add(len))
            .filter(|&end| end <= body_end)
            .ok_or_else(|| ArcaError::InvalidFormat("pack record overruns pack".into()))?;
        records.push((sha1, data_start as u64, length));
        pos = data_end;
    }
    if pos != body_end {
        return Err(ArcaError::InvalidFormat(format!(
            "{} unexpected bytes after last pack record",
            body_end - pos
        )));
    }
    Ok(records)
}

fn be_array<const N: usize>(slice: &[u8]) -> Result<[u8; N]> {
    slice
        .try_into()
        .map_err(|_| ArcaError::InvalidFormat("invalid integer field".into()))
}
