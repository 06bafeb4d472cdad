//! The Foreign Object Table: reading, inserting and resolving cross-object references.

use std::ptr::NonNull;

use objspace_rt_abi::{
    error::ObjectError,
    meta::{fot_entry_ptr, FotEntry, FotFlags, FotTarget, MAX_FOT_ENTRIES},
    object::{MapFlags, ObjID, MAX_DATA_LEN},
    Result, TwzError,
};
use tracing::trace;

use super::{HandleInfo, ObjectHandle, ObjectMapKey};
use crate::runtime::Runtime;

/// Spins on a half-inserted slot before falling back to yielding.
const SPIN_LIMIT: u32 = 128;

fn entry(info: &HandleInfo, idx: u64) -> &FotEntry {
    // Safety: idx is below MAX_FOT_ENTRIES (checked by callers) and the meta region is mapped
    // while `info` is.
    unsafe { &*fot_entry_ptr(info.region.meta, idx) }
}

fn check_meta(info: &HandleInfo) -> Result<()> {
    if !info.meta_info().is_valid() {
        return Err(ObjectError::InvalidMeta.into());
    }
    Ok(())
}

/// Read slot `idx`. Slots past the table's extent, and slots that are not active yet, are
/// invalid.
pub(crate) fn read_fot_entry(info: &HandleInfo, idx: u64) -> Result<FotTarget> {
    check_meta(info)?;
    if idx >= MAX_FOT_ENTRIES || idx >= info.meta_info().fot_extent() {
        return Err(TwzError::INVALID_ARGUMENT);
    }
    let entry = entry(info, idx);
    if !entry.is_active() {
        return Err(TwzError::INVALID_ARGUMENT);
    }
    Ok(entry.target())
}

fn wait_for_active(entry: &FotEntry) {
    let mut spins = 0;
    while !entry.is_active() {
        if spins < SPIN_LIMIT {
            core::hint::spin_loop();
            spins += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// Find or create the slot for `target`. Concurrent inserters of one target all get the same
/// index: the first to claim a free slot publishes it, and everyone scanning past a claimed but
/// not yet active slot waits for it before comparing.
pub(crate) fn insert_fot_entry(info: &HandleInfo, target: FotTarget) -> Result<u64> {
    if !info.key.1.contains(MapFlags::WRITE) {
        return Err(TwzError::PERMISSION_DENIED);
    }
    check_meta(info)?;
    let meta = info.meta_info();
    for idx in 0..MAX_FOT_ENTRIES {
        let entry = entry(info, idx);
        loop {
            let state = entry.state();
            if state.contains(FotFlags::ACTIVE) {
                if entry.target() == target {
                    return Ok(idx);
                }
                break;
            }
            if !state.is_empty() {
                wait_for_active(entry);
                continue;
            }
            if entry.try_claim() {
                meta.fot_extent
                    .fetch_max(idx as u32 + 1, std::sync::atomic::Ordering::SeqCst);
                entry.activate(target);
                trace!("insert fot {} -> {:?} in {}", idx, target, info.key.0);
                return Ok(idx);
            }
            // Lost the claim; look at the same slot again.
        }
    }
    Err(TwzError::OUT_OF_RESOURCES)
}

impl Runtime {
    /// Get a FOT index referring to `target` from the object behind `handle`, mapped with the
    /// handle's read, write and persist flags.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn insert_fot(&self, handle: &ObjectHandle, target: ObjID) -> Result<u64> {
        let flags = handle.map_flags() & (MapFlags::READ | MapFlags::WRITE | MapFlags::PERSIST);
        self.insert_fot_with_flags(handle, target, flags)
    }

    #[tracing::instrument(skip(self), level = "trace")]
    pub fn insert_fot_with_flags(
        &self,
        handle: &ObjectHandle,
        target: ObjID,
        flags: MapFlags,
    ) -> Result<u64> {
        insert_fot_entry(&handle.info, FotTarget::new(target, flags))
    }

    /// Read FOT slot `idx` of the object behind `handle`.
    pub fn read_fot(&self, handle: &ObjectHandle, idx: u64) -> Result<FotTarget> {
        read_fot_entry(&handle.info, idx)
    }

    /// Every active FOT slot of the object behind `handle`.
    pub fn fot_entries(&self, handle: &ObjectHandle) -> Result<Vec<(u64, FotTarget)>> {
        check_meta(&handle.info)?;
        let extent = handle.meta_info().fot_extent().min(MAX_FOT_ENTRIES);
        Ok((0..extent)
            .filter_map(|idx| read_fot_entry(&handle.info, idx).ok().map(|t| (idx, t)))
            .collect())
    }

    /// Resolve FOT slot `idx` of `handle` to a handle on the target object, with at least
    /// `min_valid_len` bytes of it addressable.
    #[tracing::instrument(skip(self), level = "trace")]
    pub fn resolve_fot(
        &self,
        handle: &ObjectHandle,
        idx: u64,
        min_valid_len: usize,
    ) -> Result<ObjectHandle> {
        if min_valid_len > MAX_DATA_LEN {
            return Err(TwzError::INVALID_ARGUMENT);
        }
        let source = &handle.info;
        if let Some(cached) = source.fot_cache.get(idx) {
            if cached.valid_len() >= min_valid_len {
                if let Some(target) = self.objects.revive(&cached) {
                    trace!("fot cache hit {} in {}", idx, source.key.0);
                    return Ok(target);
                }
            }
        }

        let entry = read_fot_entry(source, idx)?;
        let target = self
            .objects
            .map_object(ObjectMapKey(entry.id, entry.flags))?;
        if target.valid_len() < min_valid_len {
            let len = self.objects.grow(&target.info, min_valid_len)?;
            if len < min_valid_len {
                return Err(TwzError::INVALID_ARGUMENT);
            }
        }
        source.fot_cache.insert(idx, target.info.clone());
        Ok(target)
    }

    /// Resolve FOT slot `idx` of the object containing `ptr`, using only resolutions that are
    /// already cached. Returns the target's data region start.
    pub fn resolve_fot_local(
        &self,
        ptr: *const u8,
        idx: u64,
        min_valid_len: usize,
    ) -> Option<NonNull<u8>> {
        let info = self.objects.lookup_ptr(ptr)?;
        trace!("resolve fot local {} in {}", idx, info.key.0);
        info.fot_cache.resolve_cached_ptr(idx, min_valid_len)
    }
}
