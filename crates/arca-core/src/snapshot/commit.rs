use chrono::{DateTime, Utc};

use arca_types::BlobKey;

use super::codec::{BinaryReader, BinaryWriter, BlobKeyLayout};
use crate::error::{ArcaError, Result};

pub const CURRENT_COMMIT_VERSION: u32 = 9;
const COMMIT_HEADER: &str = "CommitV";

/// Fields present in each decodable commit version.
struct CommitFormat {
    blob_keys: BlobKeyLayout,
    has_completion_flags: bool,
    has_bucket_data: bool,
}

impl CommitFormat {
    fn for_version(version: u32) -> Result<Self> {
        match version {
            7 => Ok(Self {
                blob_keys: BlobKeyLayout::Legacy,
                has_completion_flags: false,
                has_bucket_data: false,
            }),
            8 => Ok(Self {
                blob_keys: BlobKeyLayout::Archived,
                has_completion_flags: true,
                has_bucket_data: false,
            }),
            9 => Ok(Self {
                blob_keys: BlobKeyLayout::Current,
                has_completion_flags: true,
                has_bucket_data: true,
            }),
            other => Err(ArcaError::UnsupportedVersion(other)),
        }
    }
}

/// A file the backup run could not store, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFailedFile {
    pub path: String,
    pub error_message: String,
}

impl CommitFailedFile {
    pub fn new(path: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            error_message: error_message.into(),
        }
    }
}

/// One backup run. Commits form a linear chain through
/// `parent_commit_blob_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    version: u32,
    pub author: Option<String>,
    pub comment: Option<String>,
    pub parent_commit_blob_key: Option<BlobKey>,
    pub tree_blob_key: BlobKey,
    pub location: String,
    pub computer: String,
    pub creation_date: DateTime<Utc>,
    pub commit_failed_files: Vec<CommitFailedFile>,
    pub has_missing_nodes: bool,
    pub is_complete: bool,
    pub bucket_xml_data: Vec<u8>,
}

impl Commit {
    pub fn new(
        tree_blob_key: BlobKey,
        parent_commit_blob_key: Option<BlobKey>,
        location: impl Into<String>,
        computer: impl Into<String>,
        creation_date: DateTime<Utc>,
    ) -> Self {
        Self {
            version: CURRENT_COMMIT_VERSION,
            author: None,
            comment: None,
            parent_commit_blob_key,
            tree_blob_key,
            location: location.into(),
            computer: computer.into(),
            creation_date,
            commit_failed_files: Vec::new(),
            has_missing_nodes: false,
            is_complete: true,
            bucket_xml_data: Vec::new(),
        }
    }

    /// The same commit re-parented onto `parent`, e.g. after the head moved
    /// while this backup ran.
    pub fn with_parent(&self, parent: Option<BlobKey>) -> Self {
        Self {
            version: CURRENT_COMMIT_VERSION,
            parent_commit_blob_key: parent,
            ..self.clone()
        }
    }

    /// Version this commit was decoded from.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Encode in the current version.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.header(COMMIT_HEADER, CURRENT_COMMIT_VERSION);
        w.opt_string(self.author.as_deref());
        w.opt_string(self.comment.as_deref());
        w.u64(u64::from(self.parent_commit_blob_key.is_some()));
        if let Some(parent) = &self.parent_commit_blob_key {
            w.blob_key(Some(parent));
        }
        w.blob_key(Some(&self.tree_blob_key));
        w.string(&self.location);
        w.string(&self.computer);
        w.date(&self.creation_date);
        w.u64(self.commit_failed_files.len() as u64);
        for failed in &self.commit_failed_files {
            w.string(&failed.path);
            w.string(&failed.error_message);
        }
        w.bool(self.has_missing_nodes);
        w.bool(self.is_complete);
        w.bytes(&self.bucket_xml_data);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(data);
        let version = r.header(COMMIT_HEADER)?;
        let format = CommitFormat::for_version(version)?;

        let author = r.opt_string()?;
        let comment = r.opt_string()?;
        let parent_count = r.u64()?;
        let parent_commit_blob_key = match parent_count {
            0 => None,
            1 => Some(r.required_blob_key(format.blob_keys, "parent commit blob key")?),
            n => {
                return Err(ArcaError::InvalidFormat(format!(
                    "commit has {n} parents, at most one is supported"
                )))
            }
        };
        let tree_blob_key = r.required_blob_key(format.blob_keys, "tree blob key")?;
        let location = r.string()?;
        let computer = r.string()?;
        let creation_date = r.date()?;
        let failed_count = r.u64()?;
        let mut commit_failed_files = Vec::new();
        for _ in 0..failed_count {
            commit_failed_files.push(CommitFailedFile {
                path: r.string()?,
                error_message: r.string()?,
            });
        }
        let (has_missing_nodes, is_complete) = if format.has_completion_flags {
            (r.bool()?, r.bool()?)
        } else {
            (false, true)
        };
        let bucket_xml_data = if format.has_bucket_data {
            r.bytes()?
        } else {
            Vec::new()
        };
        r.finish()?;

        Ok(Self {
            version,
            author,
            comment,
            parent_commit_blob_key,
            tree_blob_key,
            location,
            computer,
            creation_date,
            commit_failed_files,
            has_missing_nodes,
            is_complete,
            bucket_xml_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::codec::tests::write_legacy_blob_key;
    use arca_types::{CompressionType, Sha1Digest, StorageType};
    use chrono::TimeZone;

    fn key(data: &[u8]) -> BlobKey {
        BlobKey::new(
            Sha1Digest::compute(data),
            StorageType::Standard,
            true,
            CompressionType::Lz4,
        )
    }

    fn date() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn encode_decode_preserves_commit() {
        let mut commit = Commit::new(
            key(b"tree"),
            Some(key(b"parent")),
            "file://laptop/Users/me",
            "laptop",
            date(),
        );
        commit.author = Some("me".into());
        commit.comment = Some("nightly".into());
        commit.commit_failed_files = vec![CommitFailedFile::new("/etc/shadow", "permission denied")];
        commit.has_missing_nodes = true;
        commit.is_complete = false;
        commit.bucket_xml_data = b"<bucket/>".to_vec();

        let bytes = commit.to_bytes();
        assert!(bytes.starts_with(b"CommitV009"));
        assert_eq!(Commit::from_bytes(&bytes).unwrap(), commit);
    }

    #[test]
    fn with_parent_replaces_only_the_parent() {
        let commit = Commit::new(key(b"tree"), None, "loc", "host", date());
        let rebased = commit.with_parent(Some(key(b"new-head")));
        assert_eq!(rebased.parent_commit_blob_key, Some(key(b"new-head")));
        assert_eq!(rebased.tree_blob_key, commit.tree_blob_key);
        assert_eq!(rebased.creation_date, commit.creation_date);
    }

    #[test]
    fn decodes_version_7_commit_with_defaults() {
        let tree = key(b"old-tree");
        let mut w = BinaryWriter::new();
        w.header(COMMIT_HEADER, 7);
        w.opt_string(None);
        w.opt_string(Some("first"));
        w.u64(0);
        write_legacy_blob_key(&mut w, &tree, BlobKeyLayout::Legacy);
        w.string("/Users/me");
        w.string("mac");
        w.date(&date());
        w.u64(0);

        let commit = Commit::from_bytes(&w.into_bytes()).unwrap();
        assert_eq!(commit.version(), 7);
        assert_eq!(commit.comment.as_deref(), Some("first"));
        assert!(commit.tree_blob_key.same_identity(&tree));
        assert!(commit.is_complete);
        assert!(!commit.has_missing_nodes);
        assert!(commit.bucket_xml_data.is_empty());
    }

    #[test]
    fn multiple_parents_are_rejected() {
        let mut w = BinaryWriter::new();
        w.header(COMMIT_HEADER, 9);
        w.opt_string(None);
        w.opt_string(None);
        w.u64(2);
        assert!(matches!(
            Commit::from_bytes(&w.into_bytes()),
            Err(ArcaError::InvalidFormat(_))
        ));
    }

    #[test]
    fn unknown_version_is_rejected() {
        assert!(matches!(
            Commit::from_bytes(b"CommitV010"),
            Err(ArcaError::UnsupportedVersion(10))
        ));
        assert!(Commit::from_bytes(b"TreeV018").is_err());
    }
}
