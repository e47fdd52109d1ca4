use chrono::{DateTime, Utc};

use arca_types::BlobKey;

use crate::error::{ArcaError, Result};
use crate::snapshot::codec::{BinaryReader, BinaryWriter, BlobKeyLayout};

const REFLOG_HEADER: &str = "ReflogV";
const REFLOG_VERSION: u32 = 1;

/// One head transition, appended on every head update and never rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_head_blob_key: Option<BlobKey>,
    pub new_head_blob_key: BlobKey,
    pub created: DateTime<Utc>,
    /// The update overrode a head it did not expect.
    pub rewrite: bool,
}

impl ReflogEntry {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.header(REFLOG_HEADER, REFLOG_VERSION);
        w.blob_key(self.old_head_blob_key.as_ref());
        w.blob_key(Some(&self.new_head_blob_key));
        w.date(&self.created);
        w.bool(self.rewrite);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(data);
        let version = r.header(REFLOG_HEADER)?;
        if version != REFLOG_VERSION {
            return Err(ArcaError::UnsupportedVersion(version));
        }
        let entry = Self {
            old_head_blob_key: r.blob_key(BlobKeyLayout::Current)?,
            new_head_blob_key: r.required_blob_key(BlobKeyLayout::Current, "new head blob key")?,
            created: r.date()?,
            rewrite: r.bool()?,
        };
        r.finish()?;
        Ok(entry)
    }
}
