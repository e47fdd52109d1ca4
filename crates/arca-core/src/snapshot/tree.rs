use std::collections::BTreeMap;

use arca_types::BlobKey;

use super::codec::{BinaryReader, BinaryWriter, BlobKeyLayout};
use super::node::{FileAttributes, Node};
use crate::error::{ArcaError, Result};

pub const CURRENT_TREE_VERSION: u32 = 18;
const TREE_HEADER: &str = "TreeV";

/// Fields present in each decodable tree version.
struct TreeFormat {
    blob_keys: BlobKeyLayout,
    has_missing_nodes: bool,
}

impl TreeFormat {
    fn for_version(version: u32) -> Result<Self> {
        match version {
            16 => Ok(Self {
                blob_keys: BlobKeyLayout::Legacy,
                has_missing_nodes: false,
            }),
            17 => Ok(Self {
                blob_keys: BlobKeyLayout::Archived,
                has_missing_nodes: true,
            }),
            18 => Ok(Self {
                blob_keys: BlobKeyLayout::Current,
                has_missing_nodes: true,
            }),
            other => Err(ArcaError::UnsupportedVersion(other)),
        }
    }
}

/// One directory snapshot.
///
/// `missing_nodes` holds entries that could not be captured at backup
/// time. A name is never in both maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tree {
    version: u32,
    pub xattrs_blob_key: Option<BlobKey>,
    pub xattrs_size: u64,
    pub acl_blob_key: Option<BlobKey>,
    pub attributes: FileAttributes,
    nodes: BTreeMap<String, Node>,
    missing_nodes: BTreeMap<String, Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    pub fn new() -> Self {
        Self {
            version: CURRENT_TREE_VERSION,
            xattrs_blob_key: None,
            xattrs_size: 0,
            acl_blob_key: None,
            attributes: FileAttributes::default(),
            nodes: BTreeMap::new(),
            missing_nodes: BTreeMap::new(),
        }
    }

    /// Version this tree was decoded from.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Add or replace a present entry. Clears a missing entry of the same name.
    pub fn insert_node(&mut self, name: impl Into<String>, node: Node) {
        let name = name.into();
        self.missing_nodes.remove(&name);
        self.nodes.insert(name, node);
    }

    /// Record an entry whose data could not be captured.
    pub fn insert_missing_node(&mut self, name: impl Into<String>, node: Node) -> Result<()> {
        let name = name.into();
        if self.nodes.contains_key(&name) {
            return Err(ArcaError::Other(format!(
                "'{name}' is already a present node"
            )));
        }
        self.missing_nodes.insert(name, node);
        Ok(())
    }

    pub fn remove_missing_node(&mut self, name: &str) -> Option<Node> {
        self.missing_nodes.remove(name)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn missing_node(&self, name: &str) -> Option<&Node> {
        self.missing_nodes.get(name)
    }

    pub fn contains_node(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    pub fn nodes(&self) -> &BTreeMap<String, Node> {
        &self.nodes
    }

    pub fn missing_nodes(&self) -> &BTreeMap<String, Node> {
        &self.missing_nodes
    }

    pub fn child_node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn contains_missing_items(&self) -> bool {
        !self.missing_nodes.is_empty() || self.nodes.values().any(|n| n.tree_contains_missing_items)
    }

    /// Sum of the file sizes directly in this tree.
    pub fn aggregate_uncompressed_data_size(&self) -> u64 {
        self.nodes
            .values()
            .filter(|n| !n.is_tree)
            .map(|n| n.uncompressed_data_size)
            .sum()
    }

    /// Encode in the current version.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = BinaryWriter::new();
        w.header(TREE_HEADER, CURRENT_TREE_VERSION);
        w.blob_key(self.xattrs_blob_key.as_ref());
        w.u64(self.xattrs_size);
        w.blob_key(self.acl_blob_key.as_ref());
        self.attributes.write(&mut w);
        write_node_map(&mut w, &self.nodes);
        write_node_map(&mut w, &self.missing_nodes);
        w.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = BinaryReader::new(data);
        let version = r.header(TREE_HEADER)?;
        let format = TreeFormat::for_version(version)?;
        let xattrs_blob_key = r.blob_key(format.blob_keys)?;
        let xattrs_size = r.u64()?;
        let acl_blob_key = r.blob_key(format.blob_keys)?;
        let attributes = FileAttributes::read(&mut r)?;
        let nodes = read_node_map(&mut r, &format)?;
        let missing_nodes = if format.has_missing_nodes {
            read_node_map(&mut r, &format)?
        } else {
            BTreeMap::new()
        };
        r.finish()?;

        if let Some(name) = missing_nodes.keys().find(|n| nodes.contains_key(*n)) {
            return Err(ArcaError::InvalidFormat(format!(
                "'{name}' is both present and missing"
            )));
        }
        Ok(Self {
            version,
            xattrs_blob_key,
            xattrs_size,
            acl_blob_key,
            attributes,
            nodes,
            missing_nodes,
        })
    }
}

fn write_node_map(w: &mut BinaryWriter, map: &BTreeMap<String, Node>) {
    w.u32(map.len() as u32);
    for (name, node) in map {
        w.string(name);
        node.write(w);
    }
}

fn read_node_map(r: &mut BinaryReader<'_>, format: &TreeFormat) -> Result<BTreeMap<String, Node>> {
    let count = r.u32()?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let name = r.string()?;
        // Nodes gained the missing-items flag together with missing nodes.
        let node = Node::read(r, format.blob_keys, format.has_missing_nodes)?;
        if map.insert(name.clone(), node).is_some() {
            return Err(ArcaError::InvalidFormat(format!("duplicate node '{name}'")));
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::codec::tests::write_legacy_blob_key;
    use arca_types::{CompressionType, Sha1Digest, StorageType};

    fn key(data: &[u8]) -> BlobKey {
        BlobKey::new(
            Sha1Digest::compute(data),
            StorageType::Standard,
            true,
            CompressionType::Lz4,
        )
    }

    fn sample_tree() -> Tree {
        let mut tree = Tree::new();
        tree.attributes.mode = 0o40755;
        tree.attributes.uid = 501;
        let mut file = Node::file(vec![key(b"AAAA"), key(b"BBBB")], 8);
        file.attributes.mode = 0o100644;
        file.finder_file_type = "TEXT".into();
        tree.insert_node("notes.txt", file);
        tree.insert_node("sub", Node::tree(key(b"subtree")));
        tree.insert_missing_node("locked.db", Node::default()).unwrap();
        tree
    }

    #[test]
    fn encode_decode_preserves_tree() {
        let tree = sample_tree();
        let decoded = Tree::from_bytes(&tree.to_bytes()).unwrap();
        assert_eq!(decoded, tree);
        assert!(decoded.contains_missing_items());
        assert_eq!(decoded.aggregate_uncompressed_data_size(), 8);
        assert_eq!(
            decoded.child_node_names().collect::<Vec<_>>(),
            vec!["notes.txt", "sub"]
        );
    }

    #[test]
    fn present_and_missing_stay_disjoint() {
        let mut tree = sample_tree();
        assert!(tree.insert_missing_node("notes.txt", Node::default()).is_err());
        tree.insert_node("locked.db", Node::file(vec![key(b"db")], 2));
        assert!(tree.missing_node("locked.db").is_none());
        assert!(tree.contains_node("locked.db"));
    }

    #[test]
    fn overlapping_maps_are_rejected_on_decode() {
        let mut w = BinaryWriter::new();
        w.header(TREE_HEADER, 18);
        w.blob_key(None);
        w.u64(0);
        w.blob_key(None);
        FileAttributes::default().write(&mut w);
        for _ in 0..2 {
            w.u32(1);
            w.string("dup");
            Node::default().write(&mut w);
        }
        assert!(matches!(
            Tree::from_bytes(&w.into_bytes()),
            Err(ArcaError::InvalidFormat(_))
        ));
    }

    #[test]
    fn decodes_version_16_tree() {
        let chunk = key(b"chunk");
        let mut w = BinaryWriter::new();
        w.header(TREE_HEADER, 16);
        w.blob_key(None);
        w.u64(0);
        w.blob_key(None);
        FileAttributes::default().write(&mut w);
        w.u32(1);
        w.string("old.txt");
        // v16 node: no missing-items flag, legacy key layout.
        w.bool(false);
        w.u64(5);
        w.u32(1);
        write_legacy_blob_key(&mut w, &chunk, BlobKeyLayout::Legacy);
        w.blob_key(None);
        w.u64(0);
        w.blob_key(None);
        w.blob_key(None);
        w.blob_key(None);
        FileAttributes::default().write(&mut w);
        w.string("");
        w.string("");
        w.bool(false);
        // v16 has no missing-nodes map.

        let tree = Tree::from_bytes(&w.into_bytes()).unwrap();
        assert_eq!(tree.version(), 16);
        assert!(tree.missing_nodes().is_empty());
        let node = tree.node("old.txt").unwrap();
        assert_eq!(node.uncompressed_data_size, 5);
        let decoded = &node.data_blob_keys[0];
        assert!(decoded.same_identity(&chunk));
        assert_eq!(decoded.compression_type(), CompressionType::Gzip);
        assert_eq!(decoded.storage_type(), StorageType::Standard);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut w = BinaryWriter::new();
        w.header(TREE_HEADER, 15);
        assert!(matches!(
            Tree::from_bytes(&w.into_bytes()),
            Err(ArcaError::UnsupportedVersion(15))
        ));
    }
}
