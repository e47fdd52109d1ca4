//! Pack index: the sidecar object that maps object SHA-1s to byte ranges
//! inside one pack.
//!
//! Layout (big-endian):
//!
//! ```text
//! magic ff 74 4f 63 | version u32 | fan-out 256 x u32
//! entries sorted by sha1: offset u64 | length u64 | sha1 (20) | 4 zero bytes
//! trailer: sha1 of everything above
//! ```
//!
//! `fanout[b]` is the number of entries whose first SHA-1 byte is `<= b`,
//! so a lookup only binary-searches the run of entries sharing a first byte.

use std::io::{self, Read};

use sha1::{Digest, Sha1};

use arca_types::{PackId, Sha1Digest};

use crate::error::{ArcaError, Result};

pub const INDEX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
pub const INDEX_VERSION: u32 = 2;
const FANOUT_SIZE: usize = 256 * 4;
pub const INDEX_HEADER_SIZE: usize = 8 + FANOUT_SIZE;
pub const INDEX_ENTRY_SIZE: usize = 8 + 8 + Sha1Digest::LEN + 4;
pub const INDEX_TRAILER_SIZE: usize = Sha1Digest::LEN;

/// Where one object lives: pack, byte offset of its data, and length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackIndexEntry {
    pack_id: PackId,
    offset: u64,
    data_length: u64,
    object_sha1: Sha1Digest,
}

impl PackIndexEntry {
    pub fn new(pack_id: PackId, offset: u64, data_length: u64, object_sha1: Sha1Digest) -> Self {
        Self {
            pack_id,
            offset,
            data_length,
            object_sha1,
        }
    }

    pub fn pack_id(&self) -> &PackId {
        &self.pack_id
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn data_length(&self) -> u64 {
        self.data_length
    }

    pub fn object_sha1(&self) -> &Sha1Digest {
        &self.object_sha1
    }
}

/// Serialize `(sha1, offset, length)` locations as an index.
pub fn write_index(locations: &[(Sha1Digest, u64, u64)]) -> Vec<u8> {
    let mut sorted = locations.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let mut fanout = [0u32; 256];
    for (sha1, _, _) in &sorted {
        fanout[sha1.first_byte() as usize] += 1;
    }
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }

    let mut out = Vec::with_capacity(
        INDEX_HEADER_SIZE + sorted.len() * INDEX_ENTRY_SIZE + INDEX_TRAILER_SIZE,
    );
    out.extend_from_slice(&INDEX_MAGIC);
    out.extend_from_slice(&INDEX_VERSION.to_be_bytes());
    for count in fanout {
        out.extend_from_slice(&count.to_be_bytes());
    }
    for (sha1, offset, length) in &sorted {
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
        out.extend_from_slice(sha1.as_bytes());
        out.extend_from_slice(&[0u8; 4]);
    }
    let trailer = Sha1::digest(&out);
    out.extend_from_slice(&trailer);
    out
}

fn corrupt(pack_id: &PackId, msg: impl std::fmt::Display) -> ArcaError {
    ArcaError::IndexCorrupt(format!("{pack_id}: {msg}"))
}

fn parse_header(pack_id: &PackId, header: &[u8]) -> Result<[u32; 256]> {
    if header[..4] != INDEX_MAGIC {
        return Err(corrupt(pack_id, "bad magic"));
    }
    let version = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if version != INDEX_VERSION {
        return Err(corrupt(pack_id, format!("unsupported version {version}")));
    }
    let mut fanout = [0u32; 256];
    for (i, chunk) in header[8..INDEX_HEADER_SIZE].chunks_exact(4).enumerate() {
        fanout[i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if i > 0 && fanout[i] < fanout[i - 1] {
            return Err(corrupt(pack_id, "fan-out table is not monotonic"));
        }
    }
    Ok(fanout)
}

fn decode_entry(raw: &[u8]) -> (u64, u64, Sha1Digest) {
    let mut offset = [0u8; 8];
    let mut length = [0u8; 8];
    let mut sha1 = [0u8; Sha1Digest::LEN];
    offset.copy_from_slice(&raw[..8]);
    length.copy_from_slice(&raw[8..16]);
    sha1.copy_from_slice(&raw[16..16 + Sha1Digest::LEN]);
    (
        u64::from_be_bytes(offset),
        u64::from_be_bytes(length),
        Sha1Digest(sha1),
    )
}

/// Range of entry positions whose SHA-1 starts with `first_byte`.
fn fanout_range(fanout: &[u32; 256], first_byte: u8) -> (usize, usize) {
    let end = fanout[first_byte as usize] as usize;
    let start = match first_byte {
        0 => 0,
        b => fanout[b as usize - 1] as usize,
    };
    (start, end)
}

/// A whole index held in memory, searched in place.
pub struct PackIndex {
    pack_id: PackId,
    data: Vec<u8>,
    fanout: [u32; 256],
}

impl PackIndex {
    /// Validate framing, trailer and ordering.
    pub fn parse(pack_id: PackId, data: Vec<u8>) -> Result<Self> {
        if data.len() < INDEX_HEADER_SIZE + INDEX_TRAILER_SIZE {
            return Err(corrupt(&pack_id, "index too small"));
        }
        let fanout = parse_header(&pack_id, &data[..INDEX_HEADER_SIZE])?;
        let count = fanout[255] as usize;
        let expected = count
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(INDEX_HEADER_SIZE + INDEX_TRAILER_SIZE));
        if expected != Some(data.len()) {
            return Err(corrupt(
                &pack_id,
                format!("{count} entries do not fit {} bytes", data.len()),
            ));
        }
        let body_end = data.len() - INDEX_TRAILER_SIZE;
        if Sha1::digest(&data[..body_end]).as_slice() != &data[body_end..] {
            return Err(corrupt(&pack_id, "checksum mismatch"));
        }

        let index = Self {
            pack_id,
            data,
            fanout,
        };
        let mut previous: Option<Sha1Digest> = None;
        for i in 0..count {
            let (_, _, sha1) = index.entry_at(i);
            if previous.is_some_and(|p| p >= sha1) {
                return Err(corrupt(&index.pack_id, "entries are not sorted"));
            }
            let (start, end) = fanout_range(&index.fanout, sha1.first_byte());
            if i < start || i >= end {
                return Err(corrupt(&index.pack_id, "fan-out table does not match entries"));
            }
            previous = Some(sha1);
        }
        Ok(index)
    }

    pub fn pack_id(&self) -> &PackId {
        &self.pack_id
    }

    pub fn len(&self) -> usize {
        self.fanout[255] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_at(&self, i: usize) -> (u64, u64, Sha1Digest) {
        let start = INDEX_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
        decode_entry(&self.data[start..start + INDEX_ENTRY_SIZE])
    }

    fn entry(&self, i: usize) -> PackIndexEntry {
        let (offset, length, sha1) = self.entry_at(i);
        PackIndexEntry::new(self.pack_id.clone(), offset, length, sha1)
    }

    /// O(log n) lookup within the fan-out bucket.
    pub fn lookup(&self, sha1: &Sha1Digest) -> Option<PackIndexEntry> {
        let (mut lo, mut hi) = fanout_range(&self.fanout, sha1.first_byte());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (_, _, candidate) = self.entry_at(mid);
            match candidate.cmp(sha1) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(self.entry(mid)),
            }
        }
        None
    }

    pub fn entries(&self) -> impl Iterator<Item = PackIndexEntry> + '_ {
        (0..self.len()).map(|i| self.entry(i))
    }
}

/// Streams index entries from any reader without holding the whole index.
///
/// Yields entries in SHA-1 order; the trailer is checked after the last
/// entry, so a corrupt index surfaces as a final `Err` item.
pub struct PackIndexReader<R> {
    pack_id: PackId,
    reader: R,
    hasher: Sha1,
    fanout: [u32; 256],
    position: usize,
    previous: Option<Sha1Digest>,
    done: bool,
}

impl<R: Read> PackIndexReader<R> {
    pub fn new(pack_id: PackId, mut reader: R) -> Result<Self> {
        let mut header = [0u8; INDEX_HEADER_SIZE];
        read_exact(&pack_id, &mut reader, &mut header)?;
        let fanout = parse_header(&pack_id, &header)?;
        let mut hasher = Sha1::new();
        hasher.update(header);
        Ok(Self {
            pack_id,
            reader,
            hasher,
            fanout,
            position: 0,
            previous: None,
            done: false,
        })
    }

    /// Number of entries announced by the header.
    pub fn len(&self) -> usize {
        self.fanout[255] as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_entry(&mut self) -> Result<PackIndexEntry> {
        let mut raw = [0u8; INDEX_ENTRY_SIZE];
        read_exact(&self.pack_id, &mut self.reader, &mut raw)?;
        self.hasher.update(raw);
        let (offset, length, sha1) = decode_entry(&raw);
        if self.previous.is_some_and(|p| p >= sha1) {
            return Err(corrupt(&self.pack_id, "entries are not sorted"));
        }
        let (start, end) = fanout_range(&self.fanout, sha1.first_byte());
        if self.position < start || self.position >= end {
            return Err(corrupt(&self.pack_id, "fan-out table does not match entries"));
        }
        self.previous = Some(sha1);
        self.position += 1;
        Ok(PackIndexEntry::new(self.pack_id.clone(), offset, length, sha1))
    }

    fn finish(&mut self) -> Result<()> {
        let mut trailer = [0u8; INDEX_TRAILER_SIZE];
        read_exact(&self.pack_id, &mut self.reader, &mut trailer)?;
        let computed = std::mem::replace(&mut self.hasher, Sha1::new()).finalize();
        if computed.as_slice() != trailer.as_slice() {
            return Err(corrupt(&self.pack_id, "checksum mismatch"));
        }
        let mut extra = [0u8; 1];
        match self.reader.read(&mut extra) {
            Ok(0) => Ok(()),
            Ok(_) => Err(corrupt(&self.pack_id, "trailing bytes after checksum")),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Read> Iterator for PackIndexReader<R> {
    type Item = Result<PackIndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if self.position == self.len() {
            self.done = true;
            return self.finish().err().map(Err);
        }
        let entry = self.read_entry();
        if entry.is_err() {
            self.done = true;
        }
        Some(entry)
    }
}

fn read_exact(pack_id: &PackId, reader: &mut impl Read, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => corrupt(pack_id, "truncated index"),
        _ => ArcaError::Io(e),
    })
}
