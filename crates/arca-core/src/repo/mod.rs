pub mod commit_list;
pub mod fark;
pub mod pack;
pub mod pack_index;
pub mod pack_set;
pub mod reflog;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use arca_storage::{backend_from_config, LocalBackend, RestoreTier, StorageBackend};
use arca_types::{BlobKey, CompressionType, Sha1Digest, StorageType};

use crate::config::ArcaConfig;
use crate::crypto::ObjectEncryptor;
use crate::error::{ArcaError, Result};
use crate::snapshot::{Commit, Tree, XAttrSet};

use self::commit_list::CommitList;
use self::fark::{Fark, RestoreRequest};
use self::pack_set::{ConsolidationStats, Downloadability, PackSet, PackSetLimits};
use self::reflog::ReflogEntry;

/// Called after every head update with `(old, new, rewrite)`.
pub type HeadListener = Box<dyn Fn(Option<&BlobKey>, &BlobKey, bool) + Send + Sync>;

/// Which pack set a new object goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackSetKind {
    /// Commits, trees and other metadata.
    Trees,
    /// File content and attribute blobs.
    Blobs,
}

/// Return [`ArcaError::Interrupted`] once the shutdown flag is raised.
pub(crate) fn check_interrupted(shutdown: Option<&AtomicBool>) -> Result<()> {
    if shutdown.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
        return Err(ArcaError::Interrupted);
    }
    Ok(())
}

/// One bucket of one computer on a backup target.
///
/// Owns the bucket's object encryptor and its two pack sets. Every method
/// blocks on the target; share a `Repo` across threads by reference.
pub struct Repo {
    fark: Arc<Fark>,
    bucket_uuid: String,
    encryptor: ObjectEncryptor,
    trees: PackSet,
    blobs: PackSet,
    compression: CompressionType,
    storage_type: StorageType,
    head_listener: Option<HeadListener>,
}

impl Repo {
    /// Open the bucket on the target named by `config`.
    pub fn open(
        config: &ArcaConfig,
        computer_uuid: &str,
        bucket_uuid: &str,
        password: &str,
    ) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> =
            Arc::from(backend_from_config(&config.storage_config())?);
        Self::open_with_backend(backend, config, computer_uuid, bucket_uuid, password)
    }

    /// Open the bucket on an already constructed backend. Everything except
    /// `repository.url` is taken from `config`.
    pub fn open_with_backend(
        backend: Arc<dyn StorageBackend>,
        config: &ArcaConfig,
        computer_uuid: &str,
        bucket_uuid: &str,
        password: &str,
    ) -> Result<Self> {
        let mut fark = Fark::new(backend, computer_uuid, config.repository.retry.clone());
        if let Some(root) = config.resolved_cache_dir() {
            match open_cache(&root, &config.repository.url) {
                Ok(cache) => fark = fark.with_cache(cache),
                Err(e) => warn!("local cache disabled: {e}"),
            }
        }
        let fark = Arc::new(fark);
        let encryptor = ObjectEncryptor::open(&fark, bucket_uuid, password, &config.encryption)?;

        let limits = PackSetLimits {
            max_pack_size: config.pack.max_pack_size_bytes(),
            max_pack_item_size: config.pack.max_pack_item_size_bytes,
            consolidate_below: config.pack.consolidate_below_bytes(),
        };
        let trees = PackSet::new(Arc::clone(&fark), format!("{bucket_uuid}-trees"), limits);
        let blobs = PackSet::new(Arc::clone(&fark), format!("{bucket_uuid}-blobs"), limits);
        debug!(
            computer = computer_uuid,
            bucket = bucket_uuid,
            encryption_version = encryptor.encryption_version(),
            "opened repository"
        );
        Ok(Self {
            fark,
            bucket_uuid: bucket_uuid.to_string(),
            encryptor,
            trees,
            blobs,
            compression: config.compression,
            storage_type: config.repository.storage_type,
            head_listener: None,
        })
    }

    pub fn bucket_uuid(&self) -> &str {
        &self.bucket_uuid
    }

    pub fn fark(&self) -> &Fark {
        &self.fark
    }

    pub fn encryptor(&self) -> &ObjectEncryptor {
        &self.encryptor
    }

    pub fn trees(&self) -> &PackSet {
        &self.trees
    }

    pub fn blobs(&self) -> &PackSet {
        &self.blobs
    }

    pub fn pack_set(&self, kind: PackSetKind) -> &PackSet {
        match kind {
            PackSetKind::Trees => &self.trees,
            PackSetKind::Blobs => &self.blobs,
        }
    }

    pub fn set_head_listener(&mut self, listener: HeadListener) {
        self.head_listener = Some(listener);
    }

    // --- head ---

    pub fn head_blob_key(&self) -> Result<Option<BlobKey>> {
        self.fark.head_blob_key(&self.bucket_uuid)
    }

    /// Move the head to `new`, provided the head is still `expected`.
    ///
    /// Pending packs are committed first so the new head never references
    /// objects that are not on the target. When the stored head differs from
    /// `expected` this fails with [`ArcaError::HeadChanged`] unless `rewrite`
    /// is set.
    pub fn set_head_blob_key(
        &self,
        new: &BlobKey,
        expected: Option<&BlobKey>,
        rewrite: bool,
    ) -> Result<()> {
        self.flush()?;
        let current = self.fark.head_blob_key(&self.bucket_uuid)?;
        let unchanged = match (&current, expected) {
            (None, None) => true,
            (Some(current), Some(expected)) => current.same_identity(expected),
            _ => false,
        };
        if !unchanged && !rewrite {
            return Err(ArcaError::HeadChanged {
                expected: describe_head(expected),
                actual: describe_head(current.as_ref()),
            });
        }
        self.fark
            .set_head_blob_key(&self.bucket_uuid, current.as_ref(), new, rewrite)?;
        info!(
            bucket = %self.bucket_uuid,
            old = %describe_head(current.as_ref()),
            new = %new,
            rewrite,
            "head updated"
        );
        if let Some(listener) = &self.head_listener {
            listener(current.as_ref(), new, rewrite);
        }
        Ok(())
    }

    pub fn delete_head(&self) -> Result<()> {
        self.fark.delete_head_blob_key(&self.bucket_uuid)
    }

    /// Reflog entries, newest first, with their ids.
    pub fn reflog(&self) -> Result<Vec<(String, ReflogEntry)>> {
        let mut ids = self.fark.reflog_entry_ids(&self.bucket_uuid)?;
        ids.reverse();
        ids.into_iter()
            .map(|id| {
                let entry = self.fark.reflog_entry(&self.bucket_uuid, &id)?;
                Ok((id, entry))
            })
            .collect()
    }

    pub fn commit_list(&self) -> Result<CommitList> {
        CommitList::load(self, self.head_blob_key()?.as_ref())
    }

    // --- read path ---

    /// Decrypted, decompressed plaintext of a stored object.
    pub fn data_for_blob_key(&self, blob_key: &BlobKey) -> Result<Vec<u8>> {
        let encrypted = self.encrypted_data_for_sha1(blob_key.sha1())?;
        self.encryptor.decrypt(&encrypted, Some(blob_key))
    }

    fn encrypted_data_for_sha1(&self, sha1: &Sha1Digest) -> Result<Vec<u8>> {
        for pack_set in [&self.blobs, &self.trees] {
            if pack_set.contains_blob(sha1)? {
                return pack_set.data_for_sha1(sha1, true);
            }
        }
        Err(ArcaError::NotFound(format!("object {sha1}")))
    }

    pub fn commit_for_blob_key(&self, blob_key: &BlobKey) -> Result<Commit> {
        Commit::from_bytes(&self.data_for_blob_key(blob_key)?)
    }

    pub fn tree_for_blob_key(&self, blob_key: &BlobKey) -> Result<Tree> {
        Tree::from_bytes(&self.data_for_blob_key(blob_key)?)
    }

    pub fn xattr_set_for_blob_key(&self, blob_key: &BlobKey) -> Result<XAttrSet> {
        XAttrSet::from_bytes(&self.data_for_blob_key(blob_key)?)
    }

    pub fn contains_blob(&self, blob_key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.contains_blob(blob_key.sha1())? || self.trees.contains_blob(blob_key.sha1())?)
    }

    // --- write path ---

    /// Store `data` in the chosen pack set and return its key.
    ///
    /// The key is derived from the plaintext, so data that is already
    /// stored costs no upload; only the key is returned.
    pub fn blob_key_for_data(
        &self,
        data: &[u8],
        kind: PackSetKind,
        compression: CompressionType,
    ) -> Result<BlobKey> {
        let blob_key = self
            .encryptor
            .blob_key_for_data(data, compression, self.storage_type);
        let pack_set = self.pack_set(kind);
        if pack_set.contains_blob(blob_key.sha1())? {
            debug!(pack_set = pack_set.name(), "dedup hit for {}", blob_key.sha1());
            return Ok(blob_key);
        }
        let encrypted = self.encryptor.encrypt(data, compression)?;
        pack_set.put_data(*blob_key.sha1(), encrypted)?;
        Ok(blob_key)
    }

    /// File content with the repository's default compression.
    pub fn put_blob(&self, data: &[u8]) -> Result<BlobKey> {
        self.blob_key_for_data(data, PackSetKind::Blobs, self.compression)
    }

    pub fn put_tree(&self, tree: &Tree) -> Result<BlobKey> {
        self.blob_key_for_data(&tree.to_bytes(), PackSetKind::Trees, self.compression)
    }

    pub fn put_commit(&self, commit: &Commit) -> Result<BlobKey> {
        self.blob_key_for_data(&commit.to_bytes(), PackSetKind::Trees, self.compression)
    }

    pub fn put_xattr_set(&self, xattrs: &XAttrSet) -> Result<BlobKey> {
        self.blob_key_for_data(&xattrs.to_bytes(), PackSetKind::Blobs, self.compression)
    }

    /// Remove a stored object. Callers must ensure no retained commit still
    /// reaches it.
    pub fn delete_blob(&self, blob_key: &BlobKey) -> Result<bool> {
        let sha1 = blob_key.sha1();
        Ok(self.blobs.delete_blob(sha1)? || self.trees.delete_blob(sha1)?)
    }

    /// Commit both mutable packs. Blobs go first so an uploaded tree never
    /// references data that is still buffered.
    pub fn flush(&self) -> Result<()> {
        self.blobs.commit()?;
        self.trees.commit()?;
        Ok(())
    }

    // --- reachability ---

    /// Add the SHA-1 of the commit and of everything its tree reaches to
    /// `sha1s`. The parent chain is not followed. Subtrees already in the
    /// set are not walked again.
    pub fn add_sha1s_for_commit_blob_key(
        &self,
        commit_blob_key: &BlobKey,
        sha1s: &mut HashSet<Sha1Digest>,
    ) -> Result<()> {
        self.walk_commit(commit_blob_key, sha1s, &mut |_, e| Err(e))
    }

    /// SHA-1s reachable from the commit that are not stored on the target.
    pub fn verify_commit(&self, commit_blob_key: &BlobKey) -> Result<Vec<Sha1Digest>> {
        let mut reachable = HashSet::new();
        let mut missing = Vec::new();
        self.walk_commit(commit_blob_key, &mut reachable, &mut |sha1, e| {
            if e.is_not_found() {
                missing.push(sha1);
                Ok(())
            } else {
                Err(e)
            }
        })?;
        let missing_set: HashSet<Sha1Digest> = missing.iter().copied().collect();
        for sha1 in &reachable {
            if missing_set.contains(sha1) {
                continue;
            }
            if !self.blobs.contains_blob(sha1)? && !self.trees.contains_blob(sha1)? {
                missing.push(*sha1);
            }
        }
        missing.sort();
        if !missing.is_empty() {
            warn!(
                bucket = %self.bucket_uuid,
                missing = missing.len(),
                "commit {commit_blob_key} references missing objects"
            );
        }
        Ok(missing)
    }

    fn walk_commit(
        &self,
        commit_blob_key: &BlobKey,
        sha1s: &mut HashSet<Sha1Digest>,
        on_missing: &mut dyn FnMut(Sha1Digest, ArcaError) -> Result<()>,
    ) -> Result<()> {
        sha1s.insert(*commit_blob_key.sha1());
        let commit = match self.commit_for_blob_key(commit_blob_key) {
            Ok(commit) => commit,
            Err(e) => return on_missing(*commit_blob_key.sha1(), e),
        };
        self.walk_tree(&commit.tree_blob_key, sha1s, on_missing)
    }

    fn walk_tree(
        &self,
        tree_blob_key: &BlobKey,
        sha1s: &mut HashSet<Sha1Digest>,
        on_missing: &mut dyn FnMut(Sha1Digest, ArcaError) -> Result<()>,
    ) -> Result<()> {
        if !sha1s.insert(*tree_blob_key.sha1()) {
            return Ok(());
        }
        let tree = match self.tree_for_blob_key(tree_blob_key) {
            Ok(tree) => tree,
            Err(e) => return on_missing(*tree_blob_key.sha1(), e),
        };
        for key in [&tree.xattrs_blob_key, &tree.acl_blob_key].into_iter().flatten() {
            sha1s.insert(*key.sha1());
        }
        for node in tree.nodes().values().chain(tree.missing_nodes().values()) {
            let subtree = node.tree_blob_key();
            for key in node.blob_keys() {
                if Some(key) == subtree {
                    self.walk_tree(key, sha1s, on_missing)?;
                } else {
                    sha1s.insert(*key.sha1());
                }
            }
        }
        Ok(())
    }

    // --- cold storage ---

    pub fn is_object_downloadable(&self, blob_key: &BlobKey) -> Result<Downloadability> {
        self.owning_pack_set(blob_key.sha1())?
            .is_object_downloadable(blob_key.sha1())
    }

    /// Request a restore of the pack (or loose object) holding `blob_key`.
    pub fn restore_object(
        &self,
        blob_key: &BlobKey,
        days: u32,
        tier: RestoreTier,
    ) -> Result<RestoreRequest> {
        self.owning_pack_set(blob_key.sha1())?
            .restore_pack_for_sha1(blob_key.sha1(), days, tier)
    }

    /// Poll until the object is readable. The shutdown flag is checked
    /// between polls.
    pub fn wait_for_object(
        &self,
        blob_key: &BlobKey,
        poll_interval: Duration,
        shutdown: Option<&AtomicBool>,
    ) -> Result<()> {
        loop {
            check_interrupted(shutdown)?;
            if self.is_object_downloadable(blob_key)? == Downloadability::Available {
                return Ok(());
            }
            debug!("waiting for restore of {}", blob_key.sha1());
            std::thread::sleep(poll_interval);
        }
    }

    fn owning_pack_set(&self, sha1: &Sha1Digest) -> Result<&PackSet> {
        for pack_set in [&self.blobs, &self.trees] {
            if pack_set.contains_blob(sha1)? {
                return Ok(pack_set);
            }
        }
        Err(ArcaError::NotFound(format!("object {sha1}")))
    }

    // --- maintenance ---

    /// Repack small packs of both pack sets.
    pub fn consolidate(&self, shutdown: Option<&AtomicBool>) -> Result<ConsolidationStats> {
        let mut total = ConsolidationStats::default();
        for pack_set in [&self.blobs, &self.trees] {
            let stats = pack_set.consolidate(shutdown)?;
            total.packs_written += stats.packs_written;
            total.packs_removed += stats.packs_removed;
            total.objects_moved += stats.objects_moved;
        }
        Ok(total)
    }

    /// Drop every local cache file of this computer and reload indexes.
    pub fn clear_cache(&self) -> Result<()> {
        self.fark.clear_cache()?;
        self.trees.reload_cache();
        self.blobs.reload_cache();
        Ok(())
    }

    pub fn reload_cache(&self) {
        self.trees.reload_cache();
        self.blobs.reload_cache();
    }
}

fn describe_head(key: Option<&BlobKey>) -> String {
    key.map_or_else(|| "none".to_string(), |k| k.to_string())
}

/// One cache directory per target URL beneath the cache root.
fn open_cache(root: &Path, url: &str) -> Result<LocalBackend> {
    let dir = root.join(&Sha1Digest::compute(url.as_bytes()).to_hex()[..16]);
    std::fs::create_dir_all(&dir)?;
    let dir = dir
        .to_str()
        .ok_or_else(|| ArcaError::Config(format!("cache path {} is not UTF-8", dir.display())))?;
    LocalBackend::new(dir)
}
