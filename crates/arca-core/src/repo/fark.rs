//! Remote repository access for one computer on one target.
//!
//! Fark maps content-addressed names onto target paths:
//!
//! ```text
//! <computer>/packsets/<pack set>/<pack sha1>.pack
//! <computer>/packsets/<pack set>/<pack sha1>.index
//! <computer>/packsets/<pack set>/objects/<sha1>
//! <computer>/bucketdata/<bucket>/encryption.dat
//! <computer>/bucketdata/<bucket>/refs/heads/master
//! <computer>/bucketdata/<bucket>/refs/logs/master/<entry id>
//! ```
//!
//! Every remote call retries transient failures. An optional local cache
//! holds immutable pack and index files; it is only ever a shortcut and is
//! cleared explicitly.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, warn};

use arca_storage::retry::retry_transient;
use arca_storage::{LocalBackend, RestoreTier, RetryConfig, StorageBackend};
use arca_types::{BlobKey, PackId, Sha1Digest};

use super::reflog::ReflogEntry;
use crate::error::{ArcaError, Result};
use crate::snapshot::codec::{BinaryReader, BinaryWriter, BlobKeyLayout};

const HEAD_HEADER: &str = "HeadV";
const HEAD_VERSION: u32 = 1;

/// Outcome of a restore request for a cold object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreRequest {
    /// Already readable; nothing was requested.
    Available,
    /// A restore was requested earlier and has not finished.
    InFlight,
    /// A new restore request was issued.
    Requested,
}

impl RestoreRequest {
    pub fn was_already_requested(self) -> bool {
        !matches!(self, Self::Requested)
    }
}

#[derive(Default)]
struct ColdStorageState {
    restore_requested: HashSet<String>,
    downloadable: HashSet<String>,
}

pub struct Fark {
    backend: Arc<dyn StorageBackend>,
    computer_uuid: String,
    retry: RetryConfig,
    cache: Option<LocalBackend>,
    cold: Mutex<ColdStorageState>,
}

impl Fark {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        computer_uuid: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            backend,
            computer_uuid: computer_uuid.into(),
            retry,
            cache: None,
            cold: Mutex::new(ColdStorageState::default()),
        }
    }

    /// Keep pack and index files in a local directory as well.
    pub fn with_cache(mut self, cache: LocalBackend) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn computer_uuid(&self) -> &str {
        &self.computer_uuid
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    fn call<T>(&self, op: &str, f: impl FnMut() -> Result<T>) -> Result<T> {
        retry_transient(&self.retry, op, f)
    }

    fn cold_state(&self) -> std::sync::MutexGuard<'_, ColdStorageState> {
        self.cold.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- paths ---

    pub fn pack_set_prefix(&self, pack_set_name: &str) -> String {
        format!("{}/packsets/{pack_set_name}/", self.computer_uuid)
    }

    pub fn pack_key(&self, pack_id: &PackId) -> String {
        format!(
            "{}{}.pack",
            self.pack_set_prefix(pack_id.pack_set_name()),
            pack_id.pack_sha1()
        )
    }

    pub fn index_key(&self, pack_id: &PackId) -> String {
        format!(
            "{}{}.index",
            self.pack_set_prefix(pack_id.pack_set_name()),
            pack_id.pack_sha1()
        )
    }

    /// Loose objects belong to one pack set, and through its name to one
    /// bucket and its keys.
    fn objects_prefix(&self, pack_set_name: &str) -> String {
        format!("{}objects/", self.pack_set_prefix(pack_set_name))
    }

    pub fn object_key(&self, pack_set_name: &str, sha1: &Sha1Digest) -> String {
        format!("{}{sha1}", self.objects_prefix(pack_set_name))
    }

    fn bucket_data_prefix(&self, bucket_uuid: &str) -> String {
        format!("{}/bucketdata/{bucket_uuid}/", self.computer_uuid)
    }

    pub fn head_key(&self, bucket_uuid: &str) -> String {
        format!("{}refs/heads/master", self.bucket_data_prefix(bucket_uuid))
    }

    fn reflog_prefix(&self, bucket_uuid: &str) -> String {
        format!("{}refs/logs/master/", self.bucket_data_prefix(bucket_uuid))
    }

    pub fn encryption_params_key(&self, bucket_uuid: &str) -> String {
        format!("{}encryption.dat", self.bucket_data_prefix(bucket_uuid))
    }

    // --- head and reflog ---

    pub fn head_blob_key(&self, bucket_uuid: &str) -> Result<Option<BlobKey>> {
        let key = self.head_key(bucket_uuid);
        let Some(data) = self.call("get head", || self.backend.get(&key))? else {
            return Ok(None);
        };
        let mut r = BinaryReader::new(&data);
        let version = r.header(HEAD_HEADER)?;
        if version != HEAD_VERSION {
            return Err(ArcaError::UnsupportedVersion(version));
        }
        let head = r.required_blob_key(BlobKeyLayout::Current, "head blob key")?;
        r.finish()?;
        Ok(Some(head))
    }

    /// Point the bucket's head at `new` and append a reflog entry for the
    /// transition. No comparison happens here; see `Repo::set_head_blob_key`.
    pub fn set_head_blob_key(
        &self,
        bucket_uuid: &str,
        old: Option<&BlobKey>,
        new: &BlobKey,
        rewrite: bool,
    ) -> Result<()> {
        let mut w = BinaryWriter::new();
        w.header(HEAD_HEADER, HEAD_VERSION);
        w.blob_key(Some(new));
        let data = w.into_bytes();
        let key = self.head_key(bucket_uuid);
        self.call("put head", || self.backend.put(&key, &data))?;

        let entry = ReflogEntry {
            old_head_blob_key: old.cloned(),
            new_head_blob_key: new.clone(),
            created: Utc::now(),
            rewrite,
        };
        // The head is already updated at this point.
        if let Err(e) = self.append_reflog_entry(bucket_uuid, &entry) {
            warn!(bucket = bucket_uuid, "failed to append reflog entry: {e}");
        }
        Ok(())
    }

    pub fn delete_head_blob_key(&self, bucket_uuid: &str) -> Result<()> {
        let key = self.head_key(bucket_uuid);
        self.call("delete head", || self.backend.delete(&key))
    }

    /// Store a reflog entry under a new time-ordered id and return the id.
    pub fn append_reflog_entry(&self, bucket_uuid: &str, entry: &ReflogEntry) -> Result<String> {
        let id = format!(
            "{:016}-{:08x}",
            entry.created.timestamp_millis().max(0),
            rand::random::<u32>()
        );
        let key = format!("{}{id}", self.reflog_prefix(bucket_uuid));
        let data = entry.to_bytes();
        self.call("put reflog entry", || self.backend.put(&key, &data))?;
        Ok(id)
    }

    /// Reflog entry ids, oldest first.
    pub fn reflog_entry_ids(&self, bucket_uuid: &str) -> Result<Vec<String>> {
        let prefix = self.reflog_prefix(bucket_uuid);
        let keys = self.call("list reflog", || self.backend.list(&prefix))?;
        let mut ids: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .map(str::to_string)
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn reflog_entry(&self, bucket_uuid: &str, id: &str) -> Result<ReflogEntry> {
        let key = format!("{}{id}", self.reflog_prefix(bucket_uuid));
        let data = self
            .call("get reflog entry", || self.backend.get(&key))?
            .ok_or_else(|| ArcaError::NotFound(format!("reflog entry {id}")))?;
        ReflogEntry::from_bytes(&data)
    }

    // --- bucket encryption parameters ---

    pub fn encryption_params(&self, bucket_uuid: &str) -> Result<Option<Vec<u8>>> {
        let key = self.encryption_params_key(bucket_uuid);
        self.call("get encryption parameters", || self.backend.get(&key))
    }

    /// Store `data` unless parameters already exist. Returns whether this
    /// call wrote them.
    pub fn put_encryption_params_if_absent(&self, bucket_uuid: &str, data: &[u8]) -> Result<bool> {
        let key = self.encryption_params_key(bucket_uuid);
        if self.call("check encryption parameters", || self.backend.exists(&key))? {
            return Ok(false);
        }
        self.call("put encryption parameters", || self.backend.put(&key, data))?;
        Ok(true)
    }

    // --- loose objects ---

    pub fn put_data_for_sha1(
        &self,
        pack_set_name: &str,
        sha1: &Sha1Digest,
        data: &[u8],
    ) -> Result<()> {
        let key = self.object_key(pack_set_name, sha1);
        self.call("put object", || self.backend.put(&key, data))?;
        self.cache_put(&key, data);
        Ok(())
    }

    pub fn data_for_sha1(&self, pack_set_name: &str, sha1: &Sha1Digest) -> Result<Vec<u8>> {
        let key = self.object_key(pack_set_name, sha1);
        if let Some(data) = self.cache_get(&key) {
            return Ok(data);
        }
        let data = self
            .call("get object", || self.backend.get(&key))?
            .ok_or_else(|| ArcaError::NotFound(format!("object {sha1}")))?;
        self.cache_put(&key, &data);
        Ok(data)
    }

    pub fn contains_object_for_sha1(&self, pack_set_name: &str, sha1: &Sha1Digest) -> Result<bool> {
        let key = self.object_key(pack_set_name, sha1);
        self.call("check object", || self.backend.exists(&key))
    }

    pub fn size_of_object(&self, pack_set_name: &str, sha1: &Sha1Digest) -> Result<Option<u64>> {
        let key = self.object_key(pack_set_name, sha1);
        self.call("size object", || self.backend.size(&key))
    }

    pub fn delete_object_for_sha1(&self, pack_set_name: &str, sha1: &Sha1Digest) -> Result<()> {
        let key = self.object_key(pack_set_name, sha1);
        self.call("delete object", || self.backend.delete(&key))?;
        self.cache_delete(&key);
        Ok(())
    }

    /// SHA-1s of every loose object of one pack set.
    pub fn loose_object_sha1s(&self, pack_set_name: &str) -> Result<Vec<Sha1Digest>> {
        let prefix = self.objects_prefix(pack_set_name);
        let keys = self.call("list objects", || self.backend.list(&prefix))?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|name| Sha1Digest::from_hex(name).ok())
            .collect())
    }

    pub fn contains_object_in_cache(&self, pack_set_name: &str, sha1: &Sha1Digest) -> bool {
        self.cache_contains(&self.object_key(pack_set_name, sha1))
    }

    // --- packs ---

    /// Ids of every pack in the set that has an index.
    pub fn pack_ids(&self, pack_set_name: &str) -> Result<Vec<PackId>> {
        let prefix = self.pack_set_prefix(pack_set_name);
        let keys = self.call("list packs", || self.backend.list(&prefix))?;
        let mut ids: Vec<PackId> = keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.strip_suffix(".index"))
            .filter_map(|hex| Sha1Digest::from_hex(hex).ok())
            .map(|sha1| PackId::new(pack_set_name, sha1))
            .collect();
        ids.sort_by(|a, b| a.pack_sha1().cmp(b.pack_sha1()));
        Ok(ids)
    }

    pub fn put_pack(&self, pack_id: &PackId, pack_bytes: &[u8]) -> Result<()> {
        let key = self.pack_key(pack_id);
        self.call("put pack", || self.backend.put(&key, pack_bytes))?;
        self.cache_put(&key, pack_bytes);
        Ok(())
    }

    pub fn put_pack_index(&self, pack_id: &PackId, index_bytes: &[u8]) -> Result<()> {
        let key = self.index_key(pack_id);
        self.call("put pack index", || self.backend.put(&key, index_bytes))?;
        self.cache_put(&key, index_bytes);
        Ok(())
    }

    pub fn pack_index(&self, pack_id: &PackId) -> Result<Vec<u8>> {
        self.immutable_object(&self.index_key(pack_id), "pack index", pack_id)
    }

    /// The index as stored on the target, bypassing the cache.
    pub fn remote_pack_index(&self, pack_id: &PackId) -> Result<Vec<u8>> {
        let key = self.index_key(pack_id);
        self.call("get pack index", || self.backend.get(&key))?
            .ok_or_else(|| ArcaError::NotFound(format!("pack index {pack_id}")))
    }

    pub fn pack_bytes(&self, pack_id: &PackId) -> Result<Vec<u8>> {
        self.immutable_object(&self.pack_key(pack_id), "pack", pack_id)
    }

    fn immutable_object(&self, key: &str, what: &str, pack_id: &PackId) -> Result<Vec<u8>> {
        if let Some(data) = self.cache_get(key) {
            return Ok(data);
        }
        let data = self
            .call(&format!("get {what}"), || self.backend.get(key))?
            .ok_or_else(|| ArcaError::NotFound(format!("{what} {pack_id}")))?;
        self.cache_put(key, &data);
        Ok(data)
    }

    /// Read `length` bytes at `offset` of a pack. With `with_retry` unset,
    /// a transient failure is returned immediately.
    pub fn pack_range(
        &self,
        pack_id: &PackId,
        offset: u64,
        length: u64,
        with_retry: bool,
    ) -> Result<Vec<u8>> {
        let key = self.pack_key(pack_id);
        if let Some(cache) = &self.cache {
            match cache.get_range(&key, offset, length) {
                Ok(Some(data)) => return Ok(data),
                Ok(None) => {}
                Err(e) => debug!("cache read of {key} failed, using target: {e}"),
            }
        }
        let fetch = || self.backend.get_range(&key, offset, length);
        let data = if with_retry {
            self.call("get pack range", fetch)?
        } else {
            fetch()?
        };
        data.ok_or_else(|| ArcaError::NotFound(format!("pack {pack_id}")))
    }

    pub fn size_of_pack(&self, pack_id: &PackId) -> Result<Option<u64>> {
        let key = self.pack_key(pack_id);
        self.call("size pack", || self.backend.size(&key))
    }

    pub fn delete_pack(&self, pack_id: &PackId) -> Result<()> {
        let key = self.pack_key(pack_id);
        self.call("delete pack", || self.backend.delete(&key))?;
        self.cache_delete(&key);
        let mut cold = self.cold_state();
        cold.restore_requested.remove(&key);
        cold.downloadable.remove(&key);
        Ok(())
    }

    pub fn delete_pack_index(&self, pack_id: &PackId) -> Result<()> {
        let key = self.index_key(pack_id);
        self.call("delete pack index", || self.backend.delete(&key))?;
        self.cache_delete(&key);
        Ok(())
    }

    pub fn contains_pack_in_cache(&self, pack_id: &PackId) -> bool {
        self.cache_contains(&self.pack_key(pack_id))
    }

    // --- cold storage ---

    pub fn is_pack_downloadable(&self, pack_id: &PackId) -> Result<bool> {
        self.is_downloadable(&self.pack_key(pack_id))
    }

    /// Ask for the whole pack to be restored. A pack already restoring or
    /// restored is never requested twice.
    pub fn restore_pack(
        &self,
        pack_id: &PackId,
        days: u32,
        tier: RestoreTier,
    ) -> Result<RestoreRequest> {
        self.restore(&self.pack_key(pack_id), days, tier)
    }

    pub fn is_object_downloadable(&self, pack_set_name: &str, sha1: &Sha1Digest) -> Result<bool> {
        self.is_downloadable(&self.object_key(pack_set_name, sha1))
    }

    pub fn restore_object(
        &self,
        pack_set_name: &str,
        sha1: &Sha1Digest,
        days: u32,
        tier: RestoreTier,
    ) -> Result<RestoreRequest> {
        self.restore(&self.object_key(pack_set_name, sha1), days, tier)
    }

    fn is_downloadable(&self, key: &str) -> Result<bool> {
        if self.cold_state().downloadable.contains(key) || self.cache_contains(key) {
            return Ok(true);
        }
        let restored = self.call("check restore", || self.backend.is_restored(key))?;
        if restored {
            let mut cold = self.cold_state();
            cold.restore_requested.remove(key);
            cold.downloadable.insert(key.to_string());
        }
        Ok(restored)
    }

    fn restore(&self, key: &str, days: u32, tier: RestoreTier) -> Result<RestoreRequest> {
        if self.is_downloadable(key)? {
            return Ok(RestoreRequest::Available);
        }
        if self.cold_state().restore_requested.contains(key) {
            debug!("restore of {key} already requested");
            return Ok(RestoreRequest::InFlight);
        }
        let already = self.call("request restore", || {
            self.backend.request_restore(key, days, tier)
        })?;
        self.cold_state().restore_requested.insert(key.to_string());
        debug!(tier = tier.as_str(), days, "requested restore of {key}");
        Ok(if already {
            RestoreRequest::InFlight
        } else {
            RestoreRequest::Requested
        })
    }

    // --- local cache ---

    fn cache_get(&self, key: &str) -> Option<Vec<u8>> {
        let cache = self.cache.as_ref()?;
        match cache.get(key) {
            Ok(data) => data,
            Err(e) => {
                debug!("cache read of {key} failed: {e}");
                None
            }
        }
    }

    fn cache_put(&self, key: &str, data: &[u8]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(key, data) {
                warn!("failed to cache {key}: {e}");
            }
        }
    }

    fn cache_delete(&self, key: &str) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.delete(key) {
                warn!("failed to evict {key} from cache: {e}");
            }
        }
    }

    fn cache_contains(&self, key: &str) -> bool {
        self.cache
            .as_ref()
            .is_some_and(|cache| cache.exists(key).unwrap_or(false))
    }

    /// Drop every cached file of this computer.
    pub fn clear_cache(&self) -> Result<()> {
        self.clear_cache_prefix(&format!("{}/", self.computer_uuid))
    }

    /// Drop cached packs and indexes of one pack set.
    pub fn clear_pack_set_cache(&self, pack_set_name: &str) -> Result<()> {
        self.clear_cache_prefix(&self.pack_set_prefix(pack_set_name))
    }

    fn clear_cache_prefix(&self, prefix: &str) -> Result<()> {
        let Some(cache) = &self.cache else {
            return Ok(());
        };
        let keys = cache.list(prefix)?;
        for key in &keys {
            cache.delete(key)?;
        }
        debug!("cleared {} cached files under {prefix}", keys.len());
        Ok(())
    }
}
