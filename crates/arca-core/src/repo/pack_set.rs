use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use arca_storage::RestoreTier;
use arca_types::{PackId, Sha1Digest};

use super::check_interrupted;
use super::fark::{Fark, RestoreRequest};
use super::pack::{
    scan_pack, PackBuilder, SealedPack, PACK_HEADER_SIZE, PACK_TRAILER_SIZE, RECORD_HEADER_SIZE,
};
use super::pack_index::{write_index, PackIndex, PackIndexEntry, PackIndexReader};
use crate::error::{ArcaError, Result};

/// Whether an object can be read without a cold-storage restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Downloadability {
    Available,
    NeedsRestore,
    /// The pack set has not loaded its indexes yet.
    Unknown,
}

/// Summary of one consolidation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConsolidationStats {
    pub packs_written: usize,
    pub packs_removed: usize,
    pub objects_moved: usize,
}

#[derive(Default)]
struct PackSetState {
    loaded: bool,
    /// Every committed pack, including ones whose objects all resolve to
    /// another pack.
    packs: BTreeMap<Sha1Digest, PackId>,
    entries: HashMap<Sha1Digest, PackIndexEntry>,
    loose: HashSet<Sha1Digest>,
    mutable_pack: Option<PackBuilder>,
}

/// Sizing knobs for a pack set.
#[derive(Debug, Clone, Copy)]
pub struct PackSetLimits {
    pub max_pack_size: u64,
    pub max_pack_item_size: u64,
    pub consolidate_below: u64,
}

/// One logical collection of packs ("trees" or "blobs") of a bucket.
///
/// The merged index of every committed pack is loaded on first use and
/// kept in memory; all lookups after that are local. New objects collect
/// in a single mutable pack that is uploaded on `commit` or once it grows
/// past `max_pack_size`.
pub struct PackSet {
    fark: Arc<Fark>,
    name: String,
    limits: PackSetLimits,
    state: Mutex<PackSetState>,
}

impl PackSet {
    pub fn new(fark: Arc<Fark>, name: impl Into<String>, limits: PackSetLimits) -> Self {
        Self {
            fark,
            name: name.into(),
            limits,
            state: Mutex::new(PackSetState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, PackSetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load the merged index now instead of on first lookup.
    pub fn load_cache(&self) -> Result<()> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)
    }

    fn ensure_loaded(&self, state: &mut PackSetState) -> Result<()> {
        if state.loaded {
            return Ok(());
        }
        let mut pack_ids = self.fark.pack_ids(&self.name)?;
        let mut entries = HashMap::new();
        let mut vanished = HashSet::new();
        for pack_id in &pack_ids {
            match self.load_pack_entries(pack_id) {
                Ok(pack_entries) => {
                    for entry in pack_entries {
                        entries.insert(*entry.object_sha1(), entry);
                    }
                }
                // Deleted after listing, e.g. by a consolidation elsewhere.
                Err(e) if e.is_not_found() => {
                    debug!(pack_set = %self.name, "skipping {pack_id}: {e}");
                    vanished.insert(pack_id.clone());
                }
                Err(e) => return Err(e),
            }
        }
        pack_ids.retain(|id| !vanished.contains(id));
        let loose: HashSet<Sha1Digest> = self
            .fark
            .loose_object_sha1s(&self.name)?
            .into_iter()
            .collect();
        debug!(
            pack_set = %self.name,
            packs = pack_ids.len(),
            objects = entries.len(),
            loose = loose.len(),
            "loaded pack set index"
        );
        state.packs = pack_ids
            .into_iter()
            .map(|id| (*id.pack_sha1(), id))
            .collect();
        state.entries = entries;
        state.loose = loose;
        state.loaded = true;
        Ok(())
    }

    fn load_pack_entries(&self, pack_id: &PackId) -> Result<Vec<PackIndexEntry>> {
        let data = self.fark.pack_index(pack_id)?;
        let parsed = PackIndexReader::new(pack_id.clone(), data.as_slice())
            .and_then(|reader| reader.collect::<Result<Vec<_>>>());
        match parsed {
            Ok(entries) => Ok(entries),
            Err(ArcaError::IndexCorrupt(msg)) => {
                warn!(pack_set = %self.name, "rebuilding index of {pack_id}: {msg}");
                self.rebuild_index(pack_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Recreate a pack's index from the records in the pack itself.
    fn rebuild_index(&self, pack_id: &PackId) -> Result<Vec<PackIndexEntry>> {
        let records = scan_pack(&self.fark.pack_bytes(pack_id)?)?;
        self.fark.put_pack_index(pack_id, &write_index(&records))?;
        Ok(records
            .into_iter()
            .map(|(sha1, offset, length)| PackIndexEntry::new(pack_id.clone(), offset, length, sha1))
            .collect())
    }

    /// Forget the loaded index; the next lookup lists the target again.
    /// Uncommitted objects stay in the mutable pack.
    pub fn reload_cache(&self) {
        let mut state = self.lock();
        state.loaded = false;
        state.packs.clear();
        state.entries.clear();
        state.loose.clear();
    }

    /// Delete cached pack and index files of this set and reload.
    pub fn clear_cache(&self) -> Result<()> {
        self.fark.clear_pack_set_cache(&self.name)?;
        self.reload_cache();
        Ok(())
    }

    // --- lookups ---

    pub fn contains_blob(&self, sha1: &Sha1Digest) -> Result<bool> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        Ok(state
            .mutable_pack
            .as_ref()
            .is_some_and(|pack| pack.contains(sha1))
            || state.entries.contains_key(sha1)
            || state.loose.contains(sha1))
    }

    pub fn pack_index_entry_for_sha1(&self, sha1: &Sha1Digest) -> Result<Option<PackIndexEntry>> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        Ok(state.entries.get(sha1).cloned())
    }

    pub fn pack_id_for_sha1(&self, sha1: &Sha1Digest) -> Result<Option<PackId>> {
        Ok(self
            .pack_index_entry_for_sha1(sha1)?
            .map(|entry| entry.pack_id().clone()))
    }

    /// Stored (encrypted) size of an object, if this set has it.
    pub fn size_of_blob(&self, sha1: &Sha1Digest) -> Result<Option<u64>> {
        let is_loose = {
            let mut state = self.lock();
            self.ensure_loaded(&mut state)?;
            if let Some(data) = state.mutable_pack.as_ref().and_then(|p| p.data_for_sha1(sha1)) {
                return Ok(Some(data.len() as u64));
            }
            if let Some(entry) = state.entries.get(sha1) {
                return Ok(Some(entry.data_length()));
            }
            state.loose.contains(sha1)
        };
        if is_loose {
            self.fark.size_of_object(&self.name, sha1)
        } else {
            Ok(None)
        }
    }

    pub fn contains_blob_in_cache(&self, sha1: &Sha1Digest) -> Result<bool> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        if state.mutable_pack.as_ref().is_some_and(|p| p.contains(sha1)) {
            return Ok(true);
        }
        if let Some(entry) = state.entries.get(sha1) {
            return Ok(self.fark.contains_pack_in_cache(entry.pack_id()));
        }
        Ok(state.loose.contains(sha1) && self.fark.contains_object_in_cache(&self.name, sha1))
    }

    /// Read one stored object. Only the object's byte range of its pack is
    /// fetched. With `with_retry` unset, transient target errors surface
    /// immediately.
    pub fn data_for_sha1(&self, sha1: &Sha1Digest, with_retry: bool) -> Result<Vec<u8>> {
        match self.locate(sha1)? {
            Location::Buffered(data) => Ok(data),
            Location::Packed(entry) => match self.read_entry(&entry, with_retry) {
                Err(e) if e.is_not_found() => {
                    // The pack may have been replaced by a consolidation
                    // elsewhere; reload once and retry.
                    debug!(pack_set = %self.name, "{} vanished, reloading index", entry.pack_id());
                    self.reload_cache();
                    match self.locate(sha1)? {
                        Location::Buffered(data) => Ok(data),
                        Location::Packed(fresh) if fresh.pack_id() != entry.pack_id() => {
                            self.read_entry(&fresh, with_retry)
                        }
                        Location::Loose => self.fark.data_for_sha1(&self.name, sha1),
                        _ => Err(e),
                    }
                }
                other => other,
            },
            Location::Loose => self.fark.data_for_sha1(&self.name, sha1),
            Location::Missing => Err(ArcaError::NotFound(format!(
                "object {sha1} in pack set {}",
                self.name
            ))),
        }
    }

    fn locate(&self, sha1: &Sha1Digest) -> Result<Location> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        if let Some(data) = state.mutable_pack.as_ref().and_then(|p| p.data_for_sha1(sha1)) {
            return Ok(Location::Buffered(data.to_vec()));
        }
        if let Some(entry) = state.entries.get(sha1) {
            return Ok(Location::Packed(entry.clone()));
        }
        if state.loose.contains(sha1) {
            return Ok(Location::Loose);
        }
        Ok(Location::Missing)
    }

    fn read_entry(&self, entry: &PackIndexEntry, with_retry: bool) -> Result<Vec<u8>> {
        let data = self.fark.pack_range(
            entry.pack_id(),
            entry.offset(),
            entry.data_length(),
            with_retry,
        )?;
        if data.len() as u64 != entry.data_length() {
            return Err(ArcaError::InvalidFormat(format!(
                "short read of {} from {}: expected {} bytes, got {}",
                entry.object_sha1(),
                entry.pack_id(),
                entry.data_length(),
                data.len()
            )));
        }
        Ok(data)
    }

    // --- cold storage ---

    pub fn is_object_downloadable(&self, sha1: &Sha1Digest) -> Result<Downloadability> {
        let location = {
            let state = self.lock();
            if !state.loaded {
                return Ok(Downloadability::Unknown);
            }
            if state.mutable_pack.as_ref().is_some_and(|p| p.contains(sha1)) {
                return Ok(Downloadability::Available);
            }
            (state.entries.get(sha1).cloned(), state.loose.contains(sha1))
        };
        let downloadable = match location {
            (Some(entry), _) => self.fark.is_pack_downloadable(entry.pack_id())?,
            (None, true) => self.fark.is_object_downloadable(&self.name, sha1)?,
            (None, false) => {
                return Err(ArcaError::NotFound(format!(
                    "object {sha1} in pack set {}",
                    self.name
                )))
            }
        };
        Ok(if downloadable {
            Downloadability::Available
        } else {
            Downloadability::NeedsRestore
        })
    }

    /// Request a restore of the whole pack holding `sha1`. Cold tiers
    /// restore packs, not single objects.
    pub fn restore_pack_for_sha1(
        &self,
        sha1: &Sha1Digest,
        days: u32,
        tier: RestoreTier,
    ) -> Result<RestoreRequest> {
        match self.locate(sha1)? {
            Location::Buffered(_) => Ok(RestoreRequest::Available),
            Location::Packed(entry) => self.fark.restore_pack(entry.pack_id(), days, tier),
            Location::Loose => self.fark.restore_object(&self.name, sha1, days, tier),
            Location::Missing => Err(ArcaError::NotFound(format!(
                "object {sha1} in pack set {}",
                self.name
            ))),
        }
    }

    // --- mutation ---

    /// Store an encrypted object. Returns false when the set already had it.
    ///
    /// Objects above the item size limit bypass the pack and are written
    /// as loose objects right away.
    pub fn put_data(&self, sha1: Sha1Digest, data: Vec<u8>) -> Result<bool> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        if state.mutable_pack.as_ref().is_some_and(|p| p.contains(&sha1))
            || state.entries.contains_key(&sha1)
            || state.loose.contains(&sha1)
        {
            return Ok(false);
        }
        if data.len() as u64 > self.limits.max_pack_item_size {
            self.fark.put_data_for_sha1(&self.name, &sha1, &data)?;
            state.loose.insert(sha1);
            debug!(pack_set = %self.name, size = data.len(), "stored loose object {sha1}");
            return Ok(true);
        }
        let pack = state
            .mutable_pack
            .get_or_insert_with(|| PackBuilder::new(self.name.clone()));
        pack.add_data(sha1, data);
        if pack.size() >= self.limits.max_pack_size {
            self.commit_locked(&mut state)?;
        }
        Ok(true)
    }

    pub fn has_pending(&self) -> bool {
        self.lock()
            .mutable_pack
            .as_ref()
            .is_some_and(|p| !p.is_empty())
    }

    /// Seal and upload the mutable pack, if it holds anything.
    pub fn commit(&self) -> Result<Option<PackId>> {
        let mut state = self.lock();
        self.commit_locked(&mut state)
    }

    fn commit_locked(&self, state: &mut PackSetState) -> Result<Option<PackId>> {
        let Some(pack) = state.mutable_pack.as_ref() else {
            return Ok(None);
        };
        if pack.is_empty() {
            state.mutable_pack = None;
            return Ok(None);
        }
        // On failure the mutable pack is kept; nothing references the
        // partial upload.
        let sealed = pack.seal()?;
        self.upload(&sealed)?;
        let pack_id = sealed.pack_id.clone();
        let count = sealed.entries.len();
        for entry in sealed.entries {
            state.entries.insert(*entry.object_sha1(), entry);
        }
        state.packs.insert(*pack_id.pack_sha1(), pack_id.clone());
        state.mutable_pack = None;
        info!(
            pack_set = %self.name,
            objects = count,
            size = sealed.pack_bytes.len(),
            "committed pack {pack_id}"
        );
        Ok(Some(pack_id))
    }

    /// Pack first, index second: readers discover packs by their index.
    fn upload(&self, sealed: &SealedPack) -> Result<()> {
        self.fark.put_pack(&sealed.pack_id, &sealed.pack_bytes)?;
        self.fark.put_pack_index(&sealed.pack_id, &sealed.index_bytes)
    }

    /// Remove one object from the set. A packed object is dropped by
    /// rewriting its pack without it.
    pub fn delete_blob(&self, sha1: &Sha1Digest) -> Result<bool> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        if let Some(pack) = state.mutable_pack.as_mut() {
            if pack.remove_data(sha1) {
                return Ok(true);
            }
        }
        if state.loose.contains(sha1) {
            self.fark.delete_object_for_sha1(&self.name, sha1)?;
            state.loose.remove(sha1);
            return Ok(true);
        }
        let Some(entry) = state.entries.get(sha1).cloned() else {
            return Ok(false);
        };
        let old_pack = entry.pack_id().clone();
        let mut builder = PackBuilder::new(self.name.clone());
        let pack_bytes = self.fark.pack_bytes(&old_pack)?;
        for (other, offset, length) in scan_pack(&pack_bytes)? {
            if other != *sha1 && state.entries.get(&other).is_some_and(|e| e.pack_id() == &old_pack) {
                builder.add_data(other, slice(&pack_bytes, offset, length)?.to_vec());
            }
        }
        // The entry goes only once the target no longer lists the object.
        if !builder.is_empty() {
            self.replace_packs(&mut state, &builder, std::slice::from_ref(&old_pack))?;
            state.entries.remove(sha1);
        } else {
            self.fark.delete_pack_index(&old_pack)?;
            state.entries.remove(sha1);
            state.packs.remove(old_pack.pack_sha1());
            self.fark.delete_pack(&old_pack)?;
        }
        debug!(pack_set = %self.name, "deleted {sha1} from {old_pack}");
        Ok(true)
    }

    /// Repack small committed packs into fewer large ones.
    ///
    /// Each replacement pack is uploaded and read back before the index
    /// map switches to it, and superseded packs are deleted only after
    /// that: indexes first, then packs. An interrupted run leaves old and
    /// new packs side by side, both valid.
    pub fn consolidate(&self, shutdown: Option<&AtomicBool>) -> Result<ConsolidationStats> {
        let mut state = self.lock();
        self.ensure_loaded(&mut state)?;
        self.commit_locked(&mut state)?;

        let candidates = self.consolidation_candidates(&state);
        let mut stats = ConsolidationStats::default();
        if candidates.len() < 2 {
            debug!(pack_set = %self.name, "nothing to consolidate");
            return Ok(stats);
        }
        info!(
            pack_set = %self.name,
            candidates = candidates.len(),
            "consolidating small packs"
        );

        let mut builder = PackBuilder::new(self.name.clone());
        let mut sources: Vec<PackId> = Vec::new();
        for pack_id in candidates {
            check_interrupted(shutdown)?;
            let pack_bytes = self.fark.pack_bytes(&pack_id)?;
            for (sha1, offset, length) in scan_pack(&pack_bytes)? {
                let live = state
                    .entries
                    .get(&sha1)
                    .is_some_and(|e| e.pack_id() == &pack_id);
                if live {
                    builder.add_data(sha1, slice(&pack_bytes, offset, length)?.to_vec());
                }
            }
            sources.push(pack_id);
            if builder.size() >= self.limits.max_pack_size {
                check_interrupted(shutdown)?;
                self.finish_batch(&mut state, &builder, &sources, &mut stats)?;
                builder = PackBuilder::new(self.name.clone());
                sources.clear();
            }
        }
        if sources.len() > 1 {
            check_interrupted(shutdown)?;
            self.finish_batch(&mut state, &builder, &sources, &mut stats)?;
        }
        info!(
            pack_set = %self.name,
            written = stats.packs_written,
            removed = stats.packs_removed,
            objects = stats.objects_moved,
            "consolidation finished"
        );
        Ok(stats)
    }

    fn finish_batch(
        &self,
        state: &mut PackSetState,
        builder: &PackBuilder,
        sources: &[PackId],
        stats: &mut ConsolidationStats,
    ) -> Result<()> {
        if builder.is_empty() {
            for pack_id in sources {
                self.fark.delete_pack_index(pack_id)?;
            }
            for pack_id in sources {
                self.fark.delete_pack(pack_id)?;
                state.packs.remove(pack_id.pack_sha1());
            }
            stats.packs_removed += sources.len();
        } else {
            let new_id = self.replace_packs(state, builder, sources)?;
            stats.packs_written += 1;
            stats.objects_moved += builder.len();
            stats.packs_removed += sources.iter().filter(|p| **p != new_id).count();
        }
        Ok(())
    }

    /// Committed packs below the consolidation threshold, largest id last.
    /// Sizes count live objects only, so fully superseded packs qualify.
    fn consolidation_candidates(&self, state: &PackSetState) -> Vec<PackId> {
        let empty_size = (PACK_HEADER_SIZE + PACK_TRAILER_SIZE) as u64;
        let mut sizes: BTreeMap<Sha1Digest, (PackId, u64)> = state
            .packs
            .iter()
            .map(|(sha1, id)| (*sha1, (id.clone(), empty_size)))
            .collect();
        for entry in state.entries.values() {
            let pack = sizes
                .entry(*entry.pack_id().pack_sha1())
                .or_insert_with(|| (entry.pack_id().clone(), empty_size));
            pack.1 += RECORD_HEADER_SIZE as u64 + entry.data_length();
        }
        sizes
            .into_values()
            .filter(|(_, size)| *size < self.limits.consolidate_below)
            .map(|(pack_id, _)| pack_id)
            .collect()
    }

    /// Upload `builder` as a new pack, verify it, point every moved object
    /// at it, then delete `sources`.
    fn replace_packs(
        &self,
        state: &mut PackSetState,
        builder: &PackBuilder,
        sources: &[PackId],
    ) -> Result<PackId> {
        let sealed = builder.seal()?;
        self.upload(&sealed)?;
        self.verify_upload(&sealed)?;

        for entry in &sealed.entries {
            state.entries.insert(*entry.object_sha1(), entry.clone());
        }
        state
            .packs
            .insert(*sealed.pack_id.pack_sha1(), sealed.pack_id.clone());
        let retired: Vec<&PackId> = sources.iter().filter(|p| **p != sealed.pack_id).collect();
        for pack_id in &retired {
            self.fark.delete_pack_index(pack_id)?;
        }
        for pack_id in &retired {
            self.fark.delete_pack(pack_id)?;
            state.packs.remove(pack_id.pack_sha1());
        }
        info!(
            pack_set = %self.name,
            objects = sealed.entries.len(),
            replaced = retired.len(),
            "wrote replacement pack {}",
            sealed.pack_id
        );
        Ok(sealed.pack_id)
    }

    fn verify_upload(&self, sealed: &SealedPack) -> Result<()> {
        let index = PackIndex::parse(
            sealed.pack_id.clone(),
            self.fark.remote_pack_index(&sealed.pack_id)?,
        )?;
        let size = self.fark.size_of_pack(&sealed.pack_id)?;
        if size != Some(sealed.pack_bytes.len() as u64) {
            return Err(ArcaError::Other(format!(
                "replacement pack {} has size {size:?}, expected {}",
                sealed.pack_id,
                sealed.pack_bytes.len()
            )));
        }
        for entry in &sealed.entries {
            let found = index.lookup(entry.object_sha1());
            if found.as_ref() != Some(entry) {
                return Err(ArcaError::Other(format!(
                    "replacement pack {} is missing {}",
                    sealed.pack_id,
                    entry.object_sha1()
                )));
            }
        }
        Ok(())
    }
}

enum Location {
    Buffered(Vec<u8>),
    Packed(PackIndexEntry),
    Loose,
    Missing,
}

fn slice(pack_bytes: &[u8], offset: u64, length: u64) -> Result<&[u8]> {
    let start = usize::try_from(offset).ok();
    let end = start.zip(usize::try_from(length).ok()).and_then(|(s, l)| s.checked_add(l));
    match (start, end) {
        (Some(start), Some(end)) if end <= pack_bytes.len() => Ok(&pack_bytes[start..end]),
        _ => Err(ArcaError::InvalidFormat(format!(
            "record at {offset}+{length} overruns pack of {} bytes",
            pack_bytes.len()
        ))),
    }
}
