use arca_types::BlobKey;

use super::codec::{BinaryReader, BinaryWriter, BlobKeyLayout};
use crate::error::{ArcaError, Result};

/// Stat-equivalent metadata shared by trees and nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub flags: i64,
    pub finder_flags: i32,
    pub extended_finder_flags: i32,
    pub dev: i32,
    pub ino: i64,
    pub nlink: u32,
    pub rdev: i32,
    pub ctime_sec: i64,
    pub ctime_nsec: i64,
    pub create_time_sec: i64,
    pub create_time_nsec: i64,
    pub blocks: i64,
    pub blksize: u32,
}

impl FileAttributes {
    pub(crate) fn write(&self, w: &mut BinaryWriter) {
        w.u32(self.uid);
        w.u32(self.gid);
        w.u32(self.mode);
        w.i64(self.mtime_sec);
        w.i64(self.mtime_nsec);
        w.i64(self.flags);
        w.i32(self.finder_flags);
        w.i32(self.extended_finder_flags);
        w.i32(self.dev);
        w.i64(self.ino);
        w.u32(self.nlink);
        w.i32(self.rdev);
        w.i64(self.ctime_sec);
        w.i64(self.ctime_nsec);
        w.i64(self.create_time_sec);
        w.i64(self.create_time_nsec);
        w.i64(self.blocks);
        w.u32(self.blksize);
    }

    pub(crate) fn read(r: &mut BinaryReader<'_>) -> Result<Self> {
        Ok(Self {
            uid: r.u32()?,
            gid: r.u32()?,
            mode: r.u32()?,
            mtime_sec: r.i64()?,
            mtime_nsec: r.i64()?,
            flags: r.i64()?,
            finder_flags: r.i32()?,
            extended_finder_flags: r.i32()?,
            dev: r.i32()?,
            ino: r.i64()?,
            nlink: r.u32()?,
            rdev: r.i32()?,
            ctime_sec: r.i64()?,
            ctime_nsec: r.i64()?,
            create_time_sec: r.i64()?,
            create_time_nsec: r.i64()?,
            blocks: r.i64()?,
            blksize: r.u32()?,
        })
    }
}

/// One directory entry.
///
/// For files, `data_blob_keys` are the content chunks in order. For
/// subdirectories (`is_tree`), the single data blob key names the child
/// [`Tree`](super::Tree).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub is_tree: bool,
    pub tree_contains_missing_items: bool,
    pub uncompressed_data_size: u64,
    pub data_blob_keys: Vec<BlobKey>,
    pub xattrs_blob_key: Option<BlobKey>,
    pub xattrs_size: u64,
    pub acl_blob_key: Option<BlobKey>,
    pub thumbnail_blob_key: Option<BlobKey>,
    pub preview_blob_key: Option<BlobKey>,
    pub attributes: FileAttributes,
    pub finder_file_type: String,
    pub finder_file_creator: String,
    pub is_file_extension_hidden: bool,
}

impl Node {
    /// A file node over the given content chunks.
    pub fn file(data_blob_keys: Vec<BlobKey>, uncompressed_data_size: u64) -> Self {
        Self {
            data_blob_keys,
            uncompressed_data_size,
            ..Self::default()
        }
    }

    /// A directory node pointing at a stored tree.
    pub fn tree(tree_blob_key: BlobKey) -> Self {
        Self {
            is_tree: true,
            data_blob_keys: vec![tree_blob_key],
            ..Self::default()
        }
    }

    pub fn tree_blob_key(&self) -> Option<&BlobKey> {
        if self.is_tree {
            self.data_blob_keys.first()
        } else {
            None
        }
    }

    /// Every blob key this node references directly.
    pub fn blob_keys(&self) -> impl Iterator<Item = &BlobKey> {
        self.data_blob_keys.iter().chain(
            [
                &self.xattrs_blob_key,
                &self.acl_blob_key,
                &self.thumbnail_blob_key,
                &self.preview_blob_key,
            ]
            .into_iter()
            .flatten(),
        )
    }

    pub(crate) fn write(&self, w: &mut BinaryWriter) {
        w.bool(self.is_tree);
        w.bool(self.tree_contains_missing_items);
        w.u64(self.uncompressed_data_size);
        w.u32(self.data_blob_keys.len() as u32);
        for key in &self.data_blob_keys {
            w.blob_key(Some(key));
        }
        w.blob_key(self.xattrs_blob_key.as_ref());
        w.u64(self.xattrs_size);
        w.blob_key(self.acl_blob_key.as_ref());
        w.blob_key(self.thumbnail_blob_key.as_ref());
        w.blob_key(self.preview_blob_key.as_ref());
        self.attributes.write(w);
        w.string(&self.finder_file_type);
        w.string(&self.finder_file_creator);
        w.bool(self.is_file_extension_hidden);
    }

    /// `has_missing_flag` is false for tree versions that predate
    /// `tree_contains_missing_items`.
    pub(crate) fn read(
        r: &mut BinaryReader<'_>,
        layout: BlobKeyLayout,
        has_missing_flag: bool,
    ) -> Result<Self> {
        let is_tree = r.bool()?;
        let tree_contains_missing_items = if has_missing_flag { r.bool()? } else { false };
        let uncompressed_data_size = r.u64()?;
        let count = r.u32()?;
        let mut data_blob_keys = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            data_blob_keys.push(r.required_blob_key(layout, "data blob key")?);
        }
        if is_tree && data_blob_keys.len() != 1 {
            return Err(ArcaError::InvalidFormat(format!(
                "tree node must reference exactly one tree, found {}",
                data_blob_keys.len()
            )));
        }
        Ok(Self {
            is_tree,
            tree_contains_missing_items,
            uncompressed_data_size,
            data_blob_keys,
            xattrs_blob_key: r.blob_key(layout)?,
            xattrs_size: r.u64()?,
            acl_blob_key: r.blob_key(layout)?,
            thumbnail_blob_key: r.blob_key(layout)?,
            preview_blob_key: r.blob_key(layout)?,
            attributes: FileAttributes::read(r)?,
            finder_file_type: r.string()?,
            finder_file_creator: r.string()?,
            is_file_extension_hidden: r.bool()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arca_types::{CompressionType, Sha1Digest, StorageType};

    fn key(data: &[u8]) -> BlobKey {
        BlobKey::new(
            Sha1Digest::compute(data),
            StorageType::Standard,
            true,
            CompressionType::Lz4,
        )
    }

    #[test]
    fn tree_node_exposes_child_key() {
        let node = Node::tree(key(b"child"));
        assert_eq!(node.tree_blob_key(), Some(&key(b"child")));
        assert_eq!(Node::file(vec![key(b"a")], 1).tree_blob_key(), None);
    }

    #[test]
    fn blob_keys_lists_every_reference() {
        let mut node = Node::file(vec![key(b"a"), key(b"b")], 8);
        node.xattrs_blob_key = Some(key(b"x"));
        node.preview_blob_key = Some(key(b"p"));
        let keys: Vec<_> = node.blob_keys().cloned().collect();
        assert_eq!(keys, vec![key(b"a"), key(b"b"), key(b"x"), key(b"p")]);
    }

    #[test]
    fn tree_node_with_two_keys_is_rejected() {
        let mut node = Node::tree(key(b"t"));
        node.data_blob_keys.push(key(b"u"));
        let mut w = BinaryWriter::new();
        node.write(&mut w);
        let bytes = w.into_bytes();
        assert!(Node::read(&mut BinaryReader::new(&bytes), BlobKeyLayout::Current, true).is_err());
    }
}
